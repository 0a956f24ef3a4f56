// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! View-sequence generation: the members of an associated view agreeing on
//! the path of views to install next, given candidates proposed
//! independently by several of them.
//!
//! Each member keeps a grow-only set of candidate views it has heard of and
//! gossips the whole set whenever it grows, so the sets of correct members
//! end up equal. The proposed sequence is derived deterministically from
//! that set, so members holding the same candidates propose the same
//! sequence.
//!
//! A member announces convergence (`SeqConv`) at most once per generation,
//! and only for its own current proposal once a quorum holds it. Since every
//! member casts at most one convergence vote, two different sequences can
//! never both collect a quorum of them. If the votes split so that no
//! sequence can reach a quorum any more, the generation is handed to a
//! Paxos instance and the learned value is delivered instead.
//!
//! With consensus enabled from the start the gossip still spreads
//! candidates, but only the leader (rank 0 of the associated view) acts on
//! them, by proposing its sequence to the Paxos instance.

use crate::consensus::Consensus;
use crate::message::{GeneratorRequest, ProposeSeq, Request, Response, SeqConv};
use crate::quorum::spawn_broadcast;
use crate::reconfig::Event;
use crate::transport::Transport;
use crate::{Process, View, ViewRef, ViewSeq};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// The sequence implied by a set of candidate views: the candidates
/// themselves if they already form a causal chain; otherwise the
/// candidates comparable with every other candidate, followed by the join
/// of all of them.
pub fn resolve<'a, I>(known: I) -> ViewSeq
where
    I: IntoIterator<Item = &'a View>,
{
    let known: Vec<&View> = known.into_iter().collect();
    let seq = ViewSeq::from(known.iter().map(|v| (*v).clone()).collect::<Vec<_>>());
    if seq.is_chain() {
        return seq;
    }
    let merged = known.iter().fold(View::new(), |acc, v| acc.merge(v));
    let mut views: Vec<View> = known
        .iter()
        .filter(|v| known.iter().all(|w| !v.conflicts_with(w)))
        .map(|v| (*v).clone())
        .collect();
    views.push(merged);
    ViewSeq::from(views)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Broadcast(GeneratorRequest),
    Deliver(ViewSeq),
    Propose(ViewSeq),
}

/// One generation's worth of convergence state, for one associated view.
#[derive(Clone, Debug)]
pub struct Generation {
    me: Process,
    associated: View,
    consensus: bool,
    known: HashSet<View>,
    proposed: ViewSeq,
    last_converged: ViewSeq,
    votes: HashMap<Process, ViewSeq>,
    announced: bool,
    conv_votes: HashMap<ViewSeq, HashSet<Process>>,
    split: bool,
    delivered: bool,
}

impl Generation {
    pub fn new(me: Process, associated: View, consensus: bool) -> Self {
        Generation {
            me,
            associated,
            consensus,
            known: HashSet::new(),
            proposed: ViewSeq::new(),
            last_converged: ViewSeq::new(),
            votes: HashMap::new(),
            announced: false,
            conv_votes: HashMap::new(),
            split: false,
            delivered: false,
        }
    }

    pub fn proposed(&self) -> &ViewSeq {
        &self.proposed
    }

    pub fn delivered(&self) -> bool {
        self.delivered
    }

    /// Whether the convergence votes split and Paxos decides instead.
    pub fn split(&self) -> bool {
        self.split
    }

    fn is_leader(&self) -> bool {
        self.associated.leader() == Some(&self.me)
    }

    fn defers_to_consensus(&self) -> bool {
        self.consensus || self.split
    }

    /// Adds candidates; returns whether any were new.
    fn absorb(&mut self, seq: &ViewSeq) -> bool {
        let mut grew = false;
        for v in seq.views() {
            if self.associated.less_updated_than(v) {
                grew |= self.known.insert(v.clone());
            }
        }
        if grew {
            self.proposed = resolve(&self.known);
        }
        grew
    }

    fn proposal(&self) -> GeneratorRequest {
        GeneratorRequest::ProposeSeq(ProposeSeq {
            sender: self.me.clone(),
            associated: self.associated.clone(),
            proposed: self.proposed.clone(),
            known: ViewSeq::from(self.known.iter().cloned().collect::<Vec<_>>()),
            last_converged: self.last_converged.clone(),
        })
    }

    fn propose(&self, out: &mut Vec<Action>) {
        if !self.proposed.is_empty() {
            out.push(Action::Propose(self.proposed.clone()));
        }
    }

    /// Offers a local candidate sequence. Safe to repeat: the proposal is
    /// re-sent every time, which is what retries a stalled generation.
    /// After a split every member proposes on retry, not just the leader.
    pub fn start(&mut self, seq: &ViewSeq, out: &mut Vec<Action>) {
        self.absorb(seq);
        if self.proposed.is_empty() || self.delivered {
            return;
        }
        out.push(Action::Broadcast(self.proposal()));
        if self.split || (self.consensus && self.is_leader()) {
            self.propose(out);
        } else if !self.consensus {
            self.check_votes(out);
        }
    }

    pub fn on_propose(&mut self, msg: ProposeSeq, out: &mut Vec<Action>) {
        if !self.associated.has_member(&msg.sender) || self.delivered {
            return;
        }
        let before = self.proposed.clone();
        let mut grew = self.absorb(&msg.known);
        grew |= self.absorb(&msg.proposed);
        grew |= self.absorb(&msg.last_converged);
        if let Some(theirs) = msg.last_converged.most_updated() {
            let newer = self
                .last_converged
                .most_updated()
                .map_or(true, |mine| mine.less_updated_than(theirs));
            if newer {
                self.last_converged = msg.last_converged.clone();
            }
        }

        if self.defers_to_consensus() {
            if self.proposed != before && self.is_leader() {
                self.propose(out);
            }
            return;
        }

        if msg.sender != self.me {
            self.votes.insert(msg.sender, msg.proposed);
        }
        if grew {
            out.push(Action::Broadcast(self.proposal()));
        }
        self.check_votes(out);
    }

    fn check_votes(&mut self, out: &mut Vec<Action>) {
        if self.announced || self.proposed.is_empty() {
            return;
        }
        let agreeing = 1 + self
            .votes
            .values()
            .filter(|v| **v == self.proposed)
            .count();
        if agreeing >= self.associated.quorum_size() {
            self.announced = true;
            debug!("{} announces convergence on {} view(s)", self.me, self.proposed.len());
            out.push(Action::Broadcast(GeneratorRequest::SeqConv(SeqConv {
                sender: self.me.clone(),
                associated: self.associated.clone(),
                seq: self.proposed.clone(),
            })));
        }
    }

    pub fn on_conv(&mut self, msg: SeqConv, out: &mut Vec<Action>) {
        if !self.associated.has_member(&msg.sender) || self.delivered {
            return;
        }
        let voters = self.conv_votes.entry(msg.seq.clone()).or_default();
        voters.insert(msg.sender);
        if voters.len() >= self.associated.quorum_size() {
            self.delivered = true;
            self.last_converged = msg.seq.clone();
            self.conv_votes.clear();
            out.push(Action::Deliver(msg.seq));
            return;
        }
        if self.absorb(&msg.seq) && !self.defers_to_consensus() {
            out.push(Action::Broadcast(self.proposal()));
            self.check_votes(out);
        }
        self.check_split(out);
    }

    /// Every member votes once, so a sequence can gain at most one vote per
    /// member not yet heard from. Once none can reach a quorum that way,
    /// gossip can no longer decide and Paxos takes over.
    fn check_split(&mut self, out: &mut Vec<Action>) {
        if self.defers_to_consensus() {
            return;
        }
        let voters: HashSet<&Process> = self.conv_votes.values().flatten().collect();
        let best = self.conv_votes.values().map(HashSet::len).max().unwrap_or(0);
        let outstanding = self.associated.n().saturating_sub(voters.len());
        if best + outstanding >= self.associated.quorum_size() {
            return;
        }
        info!(
            "{} sees convergence votes split {} ways, deferring to consensus",
            self.me,
            self.conv_votes.len()
        );
        self.split = true;
        if self.is_leader() {
            self.propose(out);
        }
    }
}

enum Job {
    Start(ViewSeq),
    Message(GeneratorRequest),
}

/// Table of running generations, one task each, keyed by associated view.
pub struct Generator {
    me: Process,
    consensus_mode: bool,
    transport: Arc<dyn Transport>,
    consensus: Arc<Consensus>,
    events: mpsc::Sender<Event>,
    instances: Mutex<HashMap<ViewRef, mpsc::Sender<Job>>>,
}

impl Generator {
    pub fn new(
        me: Process,
        consensus_mode: bool,
        transport: Arc<dyn Transport>,
        consensus: Arc<Consensus>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Generator {
            me,
            consensus_mode,
            transport,
            consensus,
            events,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instance(&self, associated: &View) -> mpsc::Sender<Job> {
        let key = associated.view_ref();
        let mut table = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = table.get(&key) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            generation: Generation::new(self.me.clone(), associated.clone(), self.consensus_mode),
            transport: self.transport.clone(),
            consensus: self.consensus.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(actor.run(rx));
        table.insert(key, tx.clone());
        tx
    }

    /// Hands a local candidate sequence to the generation for `associated`.
    /// Never blocks; if that generation is backed up the candidate is
    /// dropped and the next reconfiguration tick offers it again.
    pub fn start(&self, associated: &View, seq: ViewSeq) {
        if let Err(e) = self.instance(associated).try_send(Job::Start(seq)) {
            warn!("view generator busy, candidate deferred: {}", e);
        }
    }

    pub async fn on_request(&self, request: GeneratorRequest) -> Response {
        let tx = self.instance(request.associated());
        match tx.send(Job::Message(request)).await {
            Ok(()) => Response::Ack,
            Err(_) => Response::Rejected(crate::Error::Shutdown),
        }
    }

    /// Stops every generation whose associated view is not `keep`.
    pub fn retire(&self, keep: &View) {
        let keep = keep.view_ref();
        let mut table = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|k, _| *k == keep);
    }
}

struct Actor {
    generation: Generation,
    transport: Arc<dyn Transport>,
    consensus: Arc<Consensus>,
    events: mpsc::Sender<Event>,
}

impl Actor {
    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        let mut out = Vec::new();
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Start(seq) => self.generation.start(&seq, &mut out),
                Job::Message(GeneratorRequest::ProposeSeq(m)) => {
                    trace!("propose-seq from {}", m.sender);
                    self.generation.on_propose(m, &mut out)
                }
                Job::Message(GeneratorRequest::SeqConv(m)) => {
                    trace!("seq-conv from {}", m.sender);
                    self.generation.on_conv(m, &mut out)
                }
            }
            for action in out.drain(..) {
                if !self.execute(action).await {
                    return;
                }
            }
        }
    }

    async fn execute(&self, action: Action) -> bool {
        let associated = &self.generation.associated;
        match action {
            Action::Broadcast(req) => {
                let members = associated.members().cloned().collect();
                spawn_broadcast(
                    self.transport.clone(),
                    members,
                    Request::ViewGenerator(req),
                    "view generator",
                );
            }
            Action::Deliver(seq) => {
                info!("converged on {} view(s) from {}", seq.len(), associated);
                let event = Event::Generated {
                    associated: associated.clone(),
                    seq,
                };
                return self.events.send(event).await.is_ok();
            }
            Action::Propose(seq) => {
                let consensus = self.consensus.clone();
                let associated = associated.clone();
                tokio::spawn(async move {
                    if let Err(e) = consensus.propose(&associated, seq).await {
                        debug!("consensus proposal abandoned: {}", e);
                    }
                });
            }
        }
        true
    }
}
