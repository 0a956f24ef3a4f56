// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A `View` is one of the two kinds of state every process keeps (the other
//! is the register value). It represents the membership of the group of
//! processes _storing_ the register. Abstractly it's a 2P-SET: the set of
//! processes that have joined and the set that have left; the set of current
//! members is just the joins minus the leaves. So a leave always dominates a
//! join, regardless of the order in which either was seen.
//!
//! Views form a lattice under union, which is exactly the "causal history"
//! order the reconfiguration protocol needs: a view is less updated than
//! another iff its entries are a strict subset of the other's. Concurrent
//! reconfigurations produce incomparable views, and their join is the view
//! that contains both.

use crate::{Error, Result};
use im::OrdSet as ArcOrdSet;
use itertools::Itertools;
use pergola::{ArcOrdSetWithUnion, LatticeElt, Tuple2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use tokio::sync::watch;

/// A process is identified solely by its network address.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Process(pub String);

impl Process {
    pub fn addr(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Process {
    fn from(s: &str) -> Self {
        Process(s.to_owned())
    }
}

impl From<String> for Process {
    fn from(s: String) -> Self {
        Process(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    Join,
    Leave,
}

/// A membership event. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Update {
    pub kind: UpdateKind,
    pub process: Process,
}

impl Update {
    pub fn join(process: impl Into<Process>) -> Self {
        Update {
            kind: UpdateKind::Join,
            process: process.into(),
        }
    }

    pub fn leave(process: impl Into<Process>) -> Self {
        Update {
            kind: UpdateKind::Leave,
            process: process.into(),
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UpdateKind::Join => write!(f, "+{}", self.process),
            UpdateKind::Leave => write!(f, "-{}", self.process),
        }
    }
}

type EntriesLD = Tuple2<ArcOrdSetWithUnion<Process>, ArcOrdSetWithUnion<Process>>;
type EntriesLE = LatticeElt<EntriesLD>;

/// Membership epoch: the set of updates that produced it, plus a cache of
/// the members those updates imply. The cache is always recomputed from the
/// entries, never edited on its own.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Update>", into = "Vec<Update>")]
pub struct View {
    entries: EntriesLE,
    members: ArcOrdSet<Process>,
}

impl View {
    pub fn new() -> Self {
        View::default()
    }

    pub fn with_updates<I: IntoIterator<Item = Update>>(updates: I) -> Self {
        View::new().copy_with_updates(updates)
    }

    /// Returns a new view extending this one; `self` is left untouched.
    pub fn copy_with_updates<I: IntoIterator<Item = Update>>(&self, updates: I) -> Self {
        let mut v = self.clone();
        for u in updates {
            v.add_update(u);
        }
        v
    }

    /// Only for views nobody else holds yet; published views are values.
    pub fn add_update(&mut self, update: Update) {
        match update.kind {
            UpdateKind::Join => self.joined_mut().insert(update.process),
            UpdateKind::Leave => self.left_mut().insert(update.process),
        };
        self.refresh_members();
    }

    fn joined(&self) -> &ArcOrdSet<Process> {
        &self.entries.value.0.value
    }
    fn joined_mut(&mut self) -> &mut ArcOrdSet<Process> {
        &mut self.entries.value.0.value
    }
    fn left(&self) -> &ArcOrdSet<Process> {
        &self.entries.value.1.value
    }
    fn left_mut(&mut self) -> &mut ArcOrdSet<Process> {
        &mut self.entries.value.1.value
    }

    fn refresh_members(&mut self) {
        let left = self.left();
        let members: ArcOrdSet<Process> = self
            .joined()
            .iter()
            .filter(|p| !left.contains(*p))
            .cloned()
            .collect();
        self.members = members;
    }

    /// Lattice join: the view containing the entries of both.
    pub fn merge(&self, other: &View) -> View {
        let mut v = View {
            entries: &self.entries + &other.entries,
            members: ArcOrdSet::new(),
        };
        v.refresh_members();
        v
    }

    pub fn contains(&self, update: &Update) -> bool {
        match update.kind {
            UpdateKind::Join => self.joined().contains(&update.process),
            UpdateKind::Leave => self.left().contains(&update.process),
        }
    }

    /// Strict causal order: every entry of `self` is in `other`, and `other`
    /// has at least one more. Concurrent views are mutually not less updated.
    pub fn less_updated_than(&self, other: &View) -> bool {
        self.entries.partial_cmp(&other.entries) == Some(Ordering::Less)
    }

    /// Neither view is less updated than the other, nor are they equal.
    pub fn conflicts_with(&self, other: &View) -> bool {
        self.entries.partial_cmp(&other.entries).is_none()
    }

    pub fn has_member(&self, p: &Process) -> bool {
        self.members.contains(p)
    }

    pub fn members(&self) -> impl Iterator<Item = &Process> + '_ {
        self.members.iter()
    }

    /// Stable rank among current members, used for proposal-number residues
    /// and for picking the consensus leader (rank 0).
    pub fn process_position(&self, p: &Process) -> Option<usize> {
        self.members.iter().position(|m| m == p)
    }

    pub fn leader(&self) -> Option<&Process> {
        self.members.iter().next()
    }

    pub fn n(&self) -> usize {
        self.members.len()
    }

    pub fn quorum_size(&self) -> usize {
        crate::quorum::quorum_size(self.n())
    }

    /// Number of simultaneous failures tolerated. Negative for an empty view.
    pub fn f(&self) -> isize {
        self.n() as isize - self.quorum_size() as isize
    }

    pub fn entry_count(&self) -> usize {
        self.joined().len() + self.left().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }

    /// Entries in canonical order: joins then leaves, each sorted.
    pub fn updates(&self) -> impl Iterator<Item = Update> + '_ {
        let joins = self.joined().iter().cloned().map(Update::join);
        let leaves = self.left().iter().cloned().map(Update::leave);
        joins.chain(leaves)
    }

    pub fn view_ref(&self) -> ViewRef {
        let mut hasher = blake3::Hasher::new();
        for u in self.updates() {
            hasher.update(&[u.kind as u8]);
            hasher.update(&(u.process.0.len() as u64).to_be_bytes());
            hasher.update(u.process.0.as_bytes());
        }
        ViewRef(*hasher.finalize().as_bytes())
    }

    /// A total order compatible with the causal one, used only to keep
    /// sequences in a canonical layout.
    pub(crate) fn canonical_cmp(&self, other: &View) -> Ordering {
        self.entry_count()
            .cmp(&other.entry_count())
            .then_with(|| self.entries.value.cmp(&other.entries.value))
    }
}

impl PartialEq for View {
    fn eq(&self, other: &Self) -> bool {
        self.entries.value == other.entries.value
    }
}

impl Eq for View {}

impl Hash for View {
    fn hash<H: Hasher>(&self, hstate: &mut H) {
        self.entries.value.hash(hstate);
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View[{}]", self.updates().join(" "))
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}#{}", self.members().join(","), self.entry_count())
    }
}

impl From<Vec<Update>> for View {
    fn from(updates: Vec<Update>) -> Self {
        View::with_updates(updates)
    }
}

impl From<View> for Vec<Update> {
    fn from(view: View) -> Self {
        view.updates().collect()
    }
}

/// Content hash of a view's entries, sent instead of the full view whenever
/// only equality matters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewRef(pub [u8; 32]);

impl fmt::Debug for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ViewRef({:02x}{:02x}{:02x}{:02x})", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A proposed path of views, kept in canonical (causal-then-content) order
/// with no duplicates, so two processes holding the same views hold equal
/// sequences.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewSeq(Vec<View>);

impl ViewSeq {
    pub fn new() -> Self {
        ViewSeq::default()
    }

    pub fn views(&self) -> &[View] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, view: &View) -> bool {
        self.0.contains(view)
    }

    pub fn insert(&mut self, view: View) {
        if !self.contains(&view) {
            self.0.push(view);
            self.0.sort_by(View::canonical_cmp);
        }
    }

    /// The earliest view; for a causal chain it is less updated than every
    /// other view in the sequence.
    pub fn least_updated(&self) -> Option<&View> {
        self.0.first()
    }

    pub fn most_updated(&self) -> Option<&View> {
        self.0.last()
    }

    /// True if every pair of views is causally comparable.
    pub fn is_chain(&self) -> bool {
        self.0
            .iter()
            .tuple_combinations()
            .all(|(a, b)| !a.conflicts_with(b))
    }

    /// The views of this sequence that are strictly more updated than `view`.
    pub fn more_updated_than(&self, view: &View) -> ViewSeq {
        ViewSeq(
            self.0
                .iter()
                .filter(|v| view.less_updated_than(v))
                .cloned()
                .collect(),
        )
    }
}

impl From<Vec<View>> for ViewSeq {
    fn from(views: Vec<View>) -> Self {
        let mut seq = ViewSeq::new();
        for v in views {
            seq.insert(v);
        }
        seq
    }
}

/// What the process currently trusts, plus its precomputed reference.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub view: View,
    pub view_ref: ViewRef,
}

impl Snapshot {
    fn of(view: View) -> Self {
        let view_ref = view.view_ref();
        Snapshot { view, view_ref }
    }
}

/// The process-wide current view slot. Many readers, one writer (the
/// reconfiguration orchestrator), and it only ever moves forward.
#[derive(Debug)]
pub struct CurrentView {
    tx: watch::Sender<Snapshot>,
}

impl CurrentView {
    pub fn new(view: View) -> Self {
        let (tx, _) = watch::channel(Snapshot::of(view));
        CurrentView { tx }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn get(&self) -> View {
        self.tx.borrow().view.clone()
    }

    /// Accepts a request made against `view_ref`, or rejects it with the
    /// view the requester should move to.
    pub fn admit(&self, view_ref: &ViewRef) -> Result<()> {
        let current = self.tx.borrow();
        if current.view_ref == *view_ref {
            Ok(())
        } else {
            Err(Error::OldView(current.view.clone()))
        }
    }

    /// Moves to `view` if it is strictly more updated; returns whether it did.
    pub fn advance(&self, view: View) -> bool {
        self.tx.send_if_modified(|current| {
            if current.view.less_updated_than(&view) {
                *current = Snapshot::of(view);
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }
}
