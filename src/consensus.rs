// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Single-decree Paxos, one instance per associated view, deciding which
//! view sequence the members of that view move along.
//!
//! The protocol roles (`Acceptor`, `Learner`, value choice and proposal
//! numbering) are plain state machines with no IO, so they can be driven
//! directly by a randomized simulation. `Consensus` wraps them in one task
//! per instance: every message for an instance is queued to that task and
//! handled in order, and acceptor state is persisted before any reply
//! leaves.

use crate::message::{
    Ballot, ConsensusId, ConsensusRequest, Proposal, ProposalNumber, Request, Response,
};
use crate::quorum::{self, fan_out, Progress, Tally};
use crate::reconfig::Event;
use crate::store::{self, DurableStore};
use crate::transport::Transport;
use crate::{Error, Process, Result, View, ViewRef, ViewSeq};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acceptor {
    promised: Option<ProposalNumber>,
    accepted: Option<(ProposalNumber, ViewSeq)>,
}

impl Acceptor {
    /// Promises to ignore anything numbered below `n`, returning whatever
    /// was accepted so far.
    pub fn prepare(&mut self, n: ProposalNumber) -> Result<Option<(ProposalNumber, ViewSeq)>> {
        match self.promised {
            Some(p) if n <= p => Err(Error::OldProposalNumber),
            _ => {
                self.promised = Some(n);
                Ok(self.accepted.clone())
            }
        }
    }

    pub fn accept(&mut self, n: ProposalNumber, value: ViewSeq) -> Result<()> {
        match self.promised {
            Some(p) if n < p => Err(Error::OldProposalNumber),
            _ => {
                self.promised = Some(n);
                self.accepted = Some((n, value));
                Ok(())
            }
        }
    }

    pub fn promised(&self) -> Option<ProposalNumber> {
        self.promised
    }
}

/// Counts acceptances of identical proposals from distinct acceptors, and
/// delivers the first one to reach a quorum, once.
#[derive(Clone, Debug)]
pub struct Learner {
    quorum: usize,
    votes: HashMap<(ProposalNumber, ViewSeq), HashSet<Process>>,
    learned: Option<ViewSeq>,
}

impl Learner {
    pub fn new(quorum: usize) -> Self {
        Learner {
            quorum,
            votes: HashMap::new(),
            learned: None,
        }
    }

    pub fn learn(&mut self, sender: Process, n: ProposalNumber, value: ViewSeq) -> Option<ViewSeq> {
        if self.learned.is_some() {
            return None;
        }
        let voters = self.votes.entry((n, value.clone())).or_default();
        voters.insert(sender);
        if voters.len() >= self.quorum {
            self.learned = Some(value.clone());
            self.votes.clear();
            return Some(value);
        }
        None
    }

    pub fn learned(&self) -> Option<&ViewSeq> {
        self.learned.as_ref()
    }
}

/// The value a proposer must use after phase 1: the highest-numbered one any
/// acceptor already accepted, or its own if none did.
pub fn choose_value<I>(promises: I, default: ViewSeq) -> ViewSeq
where
    I: IntoIterator<Item = Option<(ProposalNumber, ViewSeq)>>,
{
    promises
        .into_iter()
        .flatten()
        .max_by_key(|(n, _)| *n)
        .map(|(_, v)| v)
        .unwrap_or(default)
}

/// Smallest number above `last` that is `position` modulo `n`, so members of
/// a view never collide and a process's numbers only grow.
pub fn next_proposal_number(last: Option<ProposalNumber>, n: usize, position: usize) -> ProposalNumber {
    assert!(n > 0 && position < n, "position {} in a view of {}", position, n);
    let (n, pos) = (n as u64, position as u64);
    match last {
        None => pos,
        Some(last) => {
            let base = last - last % n + pos;
            if base > last {
                base
            } else {
                base + n
            }
        }
    }
}

enum Job {
    Prepare {
        n: ProposalNumber,
        reply: oneshot::Sender<Response>,
    },
    Accept {
        n: ProposalNumber,
        value: ViewSeq,
        reply: oneshot::Sender<Response>,
    },
    Learn {
        sender: Process,
        n: ProposalNumber,
        value: ViewSeq,
    },
    NextNumber {
        position: usize,
        reply: oneshot::Sender<Result<ProposalNumber>>,
    },
}

pub fn consensus_id(associated: &View) -> ConsensusId {
    associated.entry_count() as ConsensusId
}

pub struct Consensus {
    me: Process,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    events: mpsc::Sender<Event>,
    instances: Mutex<HashMap<ViewRef, mpsc::Sender<Job>>>,
}

impl Consensus {
    pub fn new(
        me: Process,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Consensus {
            me,
            transport,
            store,
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
        let (tx, rx) = mpsc::channel(64);
        let instance = Instance {
            me: self.me.clone(),
            associated: associated.clone(),
            transport: self.transport.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(instance.run(rx));
        table.insert(key, tx.clone());
        tx
    }

    /// Stops every instance whose associated view is not `keep`.
    pub fn retire(&self, keep: &View) {
        let keep = keep.view_ref();
        let mut table = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|k, _| *k == keep);
    }

    #[cfg(test)]
    pub(crate) fn instance_count(&self) -> usize {
        self.instances.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn submit<T>(&self, associated: &View, job: Job, rx: oneshot::Receiver<T>) -> Result<T> {
        self.instance(associated)
            .send(job)
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub async fn on_request(&self, request: ConsensusRequest) -> Response {
        match request {
            ConsensusRequest::Prepare(Ballot { associated, n, .. }) => {
                let (reply, rx) = oneshot::channel();
                self.submit(&associated, Job::Prepare { n, reply }, rx)
                    .await
                    .into()
            }
            ConsensusRequest::Accept(Proposal {
                associated, n, value, ..
            }) => {
                let (reply, rx) = oneshot::channel();
                self.submit(&associated, Job::Accept { n, value, reply }, rx)
                    .await
                    .into()
            }
            ConsensusRequest::Learn { sender, proposal } => {
                let job = Job::Learn {
                    sender,
                    n: proposal.n,
                    value: proposal.value,
                };
                match self.instance(&proposal.associated).send(job).await {
                    Ok(()) => Response::Ack,
                    Err(_) => Response::Rejected(Error::Shutdown),
                }
            }
        }
    }

    /// Runs both phases as this process, with `default` as the value if no
    /// acceptor has accepted one yet. Gives up on the first failure; the
    /// next reconfiguration tick proposes again with a higher number.
    pub async fn propose(&self, associated: &View, default: ViewSeq) -> Result<ViewSeq> {
        let position = associated
            .process_position(&self.me)
            .ok_or_else(|| Error::NotMember(self.me.clone()))?;
        let (reply, rx) = oneshot::channel();
        let n = self
            .submit(associated, Job::NextNumber { position, reply }, rx)
            .await??;
        let consensus_id = consensus_id(associated);
        let members: Vec<Process> = associated.members().cloned().collect();
        debug!("proposing n={} in instance {}", n, consensus_id);

        let prepare = Request::Consensus(ConsensusRequest::Prepare(Ballot {
            consensus_id,
            associated: associated.clone(),
            n,
        }));
        let (total, mut replies) = fan_out(&self.transport, members.clone(), &prepare);
        let mut tally = Tally::new(total);
        let mut promises = Vec::new();
        let mut reached = tally.progress();
        while reached == Progress::Pending {
            let (_, reply) = match replies.recv().await {
                Some(r) => r,
                None => break,
            };
            reached = match reply {
                Ok(Response::Promise { accepted }) => {
                    promises.push(accepted);
                    tally.success()
                }
                _ => tally.failure(),
            };
        }
        if reached != Progress::Reached {
            warn!("prepare n={} in instance {} failed", n, consensus_id);
            return Err(tally.unreachable());
        }

        let value = choose_value(promises, default);
        let accept = Request::Consensus(ConsensusRequest::Accept(Proposal {
            consensus_id,
            associated: associated.clone(),
            n,
            value: value.clone(),
        }));
        if let Err(e) = quorum::broadcast(&self.transport, members, accept).await {
            warn!("accept n={} in instance {} failed: {}", n, consensus_id, e);
            return Err(e);
        }
        Ok(value)
    }
}

struct Instance {
    me: Process,
    associated: View,
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    events: mpsc::Sender<Event>,
}

impl Instance {
    fn key(&self, what: &str) -> String {
        format!(
            "{}/{}/{}",
            what,
            consensus_id(&self.associated),
            self.associated.view_ref()
        )
    }

    async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        let acceptor_key = self.key("acceptor");
        let ballot_key = self.key("ballot");
        let restored = async {
            let acceptor: Option<Acceptor> = store::load(&*self.store, &acceptor_key).await?;
            let ballot: Option<ProposalNumber> = store::load(&*self.store, &ballot_key).await?;
            Ok::<_, Error>((acceptor.unwrap_or_default(), ballot))
        };
        let (mut acceptor, mut last_ballot) = match restored.await {
            Ok(r) => r,
            Err(e) => {
                error!("cannot restore consensus state: {}", e);
                return;
            }
        };
        let mut learner = Learner::new(self.associated.quorum_size());

        while let Some(job) = jobs.recv().await {
            match job {
                Job::Prepare { n, reply } => {
                    let mut next = acceptor.clone();
                    let response = match next.prepare(n) {
                        Ok(accepted) => match store::save(&*self.store, &acceptor_key, &next).await {
                            Ok(()) => {
                                acceptor = next;
                                Response::Promise { accepted }
                            }
                            Err(e) => Response::Rejected(e),
                        },
                        Err(e) => Response::Rejected(e),
                    };
                    let _ = reply.send(response);
                }
                Job::Accept { n, value, reply } => {
                    let mut next = acceptor.clone();
                    let response = match next.accept(n, value.clone()) {
                        Ok(()) => match store::save(&*self.store, &acceptor_key, &next).await {
                            Ok(()) => {
                                acceptor = next;
                                self.announce(n, value);
                                Response::Ack
                            }
                            Err(e) => Response::Rejected(e),
                        },
                        Err(e) => Response::Rejected(e),
                    };
                    let _ = reply.send(response);
                }
                Job::Learn { sender, n, value } => {
                    if let Some(seq) = learner.learn(sender, n, value) {
                        info!(
                            "learned {} view(s) for instance {}",
                            seq.len(),
                            consensus_id(&self.associated)
                        );
                        let event = Event::Generated {
                            associated: self.associated.clone(),
                            seq,
                        };
                        if self.events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Job::NextNumber { position, reply } => {
                    let last = last_ballot.max(acceptor.promised());
                    let n = next_proposal_number(last, self.associated.n(), position);
                    let saved = store::save(&*self.store, &ballot_key, &n).await;
                    if saved.is_ok() {
                        last_ballot = Some(n);
                    }
                    let _ = reply.send(saved.map(|()| n));
                }
            }
        }
    }

    fn announce(&self, n: ProposalNumber, value: ViewSeq) {
        let learn = Request::Consensus(ConsensusRequest::Learn {
            sender: self.me.clone(),
            proposal: Proposal {
                consensus_id: consensus_id(&self.associated),
                associated: self.associated.clone(),
                n,
                value,
            },
        });
        let members = self.associated.members().cloned().collect();
        quorum::spawn_broadcast(self.transport.clone(), members, learn, "learn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Update;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn seq(names: &[&str]) -> ViewSeq {
        ViewSeq::from(vec![View::with_updates(names.iter().map(|n| Update::join(*n)))])
    }

    #[test]
    fn proposal_numbers_are_unique_and_increasing() {
        let n = 3;
        let mut seen = HashSet::new();
        for pos in 0..n {
            let mut last = None;
            for _ in 0..20 {
                let next = next_proposal_number(last, n, pos);
                assert_eq!(next as usize % n, pos);
                assert!(last.map_or(true, |l| next > l));
                assert!(seen.insert(next));
                last = Some(next);
            }
        }
        // Jumping past a foreign promise keeps the residue.
        assert_eq!(next_proposal_number(Some(10), 3, 0), 12);
        assert_eq!(next_proposal_number(Some(10), 3, 1), 13);
        assert_eq!(next_proposal_number(Some(10), 3, 2), 11);
    }

    #[test]
    fn acceptor_rules() {
        let mut a = Acceptor::default();
        assert_eq!(a.prepare(5), Ok(None));
        assert_eq!(a.prepare(5), Err(Error::OldProposalNumber));
        assert_eq!(a.accept(4, seq(&["a"])), Err(Error::OldProposalNumber));
        assert_eq!(a.accept(5, seq(&["a"])), Ok(()));
        assert_eq!(a.prepare(7), Ok(Some((5, seq(&["a"])))));
    }

    #[test]
    fn choose_highest_accepted() {
        let d = seq(&["d"]);
        assert_eq!(choose_value(vec![None, None], d.clone()), d);
        let v = choose_value(vec![Some((3, seq(&["x"]))), None, Some((8, seq(&["y"])))], d);
        assert_eq!(v, seq(&["y"]));
    }

    #[test]
    fn learner_delivers_once() {
        let mut l = Learner::new(2);
        let v = seq(&["a"]);
        assert_eq!(l.learn("p".into(), 1, v.clone()), None);
        assert_eq!(l.learn("p".into(), 1, v.clone()), None);
        assert_eq!(l.learn("q".into(), 1, v.clone()), Some(v.clone()));
        assert_eq!(l.learn("r".into(), 1, v.clone()), None);
        assert_eq!(l.learned(), Some(&v));
    }

    // A message in flight in the simulated network.
    #[derive(Clone, Debug)]
    enum Msg {
        Prepare { from: usize, n: u64 },
        Promise { from: usize, n: u64, accepted: Option<(u64, ViewSeq)> },
        Accept { n: u64, value: ViewSeq },
        Accepted { from: usize, n: u64, value: ViewSeq },
    }

    struct Node {
        acceptor: Acceptor,
        learner: Learner,
        last: Option<u64>,
        round: Option<u64>,
        promises: HashMap<usize, Option<(u64, ViewSeq)>>,
        proposal: ViewSeq,
        learned: Vec<ViewSeq>,
    }

    /// Three nodes, each proposing a different value, with messages
    /// delivered in random order, dropped and duplicated at random, and
    /// proposers restarting rounds at random. No two nodes may ever learn
    /// different values.
    #[test]
    fn randomized_paxos_is_safe() {
        const N: usize = 3;
        let mut learned_any = false;
        for s in 0..200u64 {
            let mut rng = StdRng::seed_from_u64(s);
            let mut nodes: Vec<Node> = (0..N)
                .map(|i| Node {
                    acceptor: Acceptor::default(),
                    learner: Learner::new(quorum::quorum_size(N)),
                    last: None,
                    round: None,
                    promises: HashMap::new(),
                    proposal: seq(&[["a", "b", "c"][i]]),
                    learned: Vec::new(),
                })
                .collect();
            let mut net: Vec<(usize, Msg)> = Vec::new();
            for _ in 0..400 {
                if rng.gen_bool(0.1) {
                    let p = rng.gen_range(0..N);
                    let n = next_proposal_number(nodes[p].last, N, p);
                    nodes[p].last = Some(n);
                    nodes[p].round = Some(n);
                    nodes[p].promises.clear();
                    for to in 0..N {
                        net.push((to, Msg::Prepare { from: p, n }));
                    }
                }
                if net.is_empty() {
                    continue;
                }
                let i = rng.gen_range(0..net.len());
                let (to, msg) = if rng.gen_bool(0.1) {
                    net[i].clone()
                } else {
                    net.swap_remove(i)
                };
                if rng.gen_bool(0.1) {
                    continue;
                }
                let node = &mut nodes[to];
                match msg {
                    Msg::Prepare { from, n } => {
                        if let Ok(accepted) = node.acceptor.prepare(n) {
                            net.push((from, Msg::Promise { from: to, n, accepted }));
                        }
                    }
                    Msg::Promise { from, n, accepted } => {
                        if node.round == Some(n) {
                            node.promises.insert(from, accepted);
                            if node.promises.len() == quorum::quorum_size(N) {
                                // One value per round: stop listening once sent.
                                node.round = None;
                                let value = choose_value(
                                    node.promises.drain().map(|(_, a)| a),
                                    node.proposal.clone(),
                                );
                                for t in 0..N {
                                    net.push((t, Msg::Accept { n, value: value.clone() }));
                                }
                            }
                        }
                    }
                    Msg::Accept { n, value } => {
                        if node.acceptor.accept(n, value.clone()).is_ok() {
                            for t in 0..N {
                                net.push((t, Msg::Accepted { from: to, n, value: value.clone() }));
                            }
                        }
                    }
                    Msg::Accepted { from, n, value } => {
                        let sender = Process(format!("p{}", from));
                        if let Some(v) = node.learner.learn(sender, n, value) {
                            node.learned.push(v);
                        }
                    }
                }
            }
            let learned: Vec<&ViewSeq> = nodes.iter().flat_map(|n| n.learned.iter()).collect();
            learned_any |= !learned.is_empty();
            for v in &learned {
                assert_eq!(*v, learned[0], "seed {}", s);
            }
        }
        assert!(learned_any);
    }
}
