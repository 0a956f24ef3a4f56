// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The reconfiguration orchestrator: a single task that owns every
//! decision about moving the current view forward.
//!
//! A round goes like this. Pending updates are collected from `Reconfig`
//! requests. On each timer tick, if any are not yet in the current view, a
//! candidate view is handed to the view-sequence generator. When a sequence
//! is generated for the current view, its least updated view becomes the
//! _install_ view and is flooded to the old and new members as
//! `InstallSeq`. A process acts on the round once a quorum of the old
//! (associated) view has flooded it: old members lock their register and
//! send their state to the new members; new members wait for a quorum of
//! those states, adopt the newest, and install the view. Members that are
//! left behind wait for a quorum of the new view to confirm the install,
//! then shut down. If the sequence has further views the new members carry
//! on with it, starting from the view they just installed; the register
//! stays locked until the last one is in place.

use crate::consensus::Consensus;
use crate::generator::Generator;
use crate::message::{InstallRound, InstallSeq, ReconfigRequest, Request, StateUpdate, ViewInstalled};
use crate::quorum::spawn_broadcast;
use crate::server::Context;
use crate::{Process, RegisterValue, Update, View, ViewRef, ViewSeq};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Clone, Debug)]
pub enum Event {
    Update(Update),
    Generated { associated: View, seq: ViewSeq },
    InstallSeq(InstallSeq),
    StateUpdate(StateUpdate),
    ViewInstalled(ViewInstalled),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Stage {
    Idle,
    AwaitingState(InstallRound),
    AwaitingInstalled(InstallRound),
    Departed,
}

#[derive(Clone, Debug, Default)]
struct StateAccum {
    senders: HashSet<Process>,
    state: RegisterValue,
    recv: BTreeSet<Update>,
}

pub struct Reconfigurer {
    ctx: Arc<Context>,
    generator: Arc<Generator>,
    consensus: Arc<Consensus>,
    recv: BTreeSet<Update>,
    stage: Stage,
    installs: HashMap<InstallRound, HashSet<Process>>,
    flooded: HashSet<InstallRound>,
    states: HashMap<(ViewRef, ViewRef), StateAccum>,
    installed: HashMap<View, HashSet<Process>>,
    deferred: VecDeque<InstallRound>,
    deadline: Instant,
}

impl Reconfigurer {
    pub fn new(ctx: Arc<Context>, generator: Arc<Generator>, consensus: Arc<Consensus>) -> Self {
        let deadline = Instant::now() + ctx.config.reconfig_delay();
        Reconfigurer {
            ctx,
            generator,
            consensus,
            recv: BTreeSet::new(),
            stage: Stage::Idle,
            installs: HashMap::new(),
            flooded: HashSet::new(),
            states: HashMap::new(),
            installed: HashMap::new(),
            deferred: VecDeque::new(),
            deadline,
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => return,
                },
                _ = tokio::time::sleep_until(self.deadline) => self.tick(),
                _ = self.ctx.stopped() => return,
            }
            self.settle().await;
            if self.stage == Stage::Departed {
                return;
            }
        }
    }

    fn me(&self) -> &Process {
        &self.ctx.me
    }

    fn reset_timer(&mut self) {
        self.deadline = Instant::now() + self.ctx.config.reconfig_period();
    }

    fn tick(&mut self) {
        self.reset_timer();
        if self.stage != Stage::Idle {
            return;
        }
        let current = self.ctx.view.get();
        if !current.has_member(self.me()) {
            return;
        }
        self.recv.retain(|u| !current.contains(u));
        if self.recv.is_empty() {
            return;
        }
        let candidate = current.copy_with_updates(self.recv.iter().cloned());
        debug!("{} proposes {} from {}", self.me(), candidate, current);
        self.generator.start(&current, ViewSeq::from(vec![candidate]));
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Update(update) => {
                if !self.ctx.view.get().contains(&update) {
                    trace!("{} queued {}", self.me(), update);
                    self.recv.insert(update);
                }
            }
            Event::Generated { associated, seq } => self.on_generated(associated, seq),
            Event::InstallSeq(msg) => self.on_install_seq(msg).await,
            Event::StateUpdate(msg) => self.on_state_update(msg).await,
            Event::ViewInstalled(msg) => self.on_view_installed(msg),
        }
    }

    fn on_generated(&mut self, associated: View, seq: ViewSeq) {
        if associated != self.ctx.view.get() {
            debug!("{} ignores sequence generated for {}", self.me(), associated);
            return;
        }
        let remaining = seq.more_updated_than(&associated);
        let install = match remaining.least_updated() {
            Some(v) => v.clone(),
            None => return,
        };
        self.flood(InstallRound {
            install,
            seq: remaining,
            associated,
        });
    }

    /// Sends `round` to everyone involved in it, once per round.
    fn flood(&mut self, round: InstallRound) {
        if !self.flooded.insert(round.clone()) {
            return;
        }
        let targets: BTreeSet<Process> = round
            .associated
            .members()
            .chain(round.install.members())
            .cloned()
            .collect();
        let msg = InstallSeq {
            sender: self.me().clone(),
            round,
        };
        spawn_broadcast(
            self.ctx.transport.clone(),
            targets.into_iter().collect(),
            Request::Reconfiguration(ReconfigRequest::InstallSeq(msg)),
            "install-seq",
        );
    }

    async fn on_install_seq(&mut self, msg: InstallSeq) {
        self.flood(msg.round.clone());
        if !msg.round.associated.has_member(&msg.sender) {
            return;
        }
        let quorum = msg.round.associated.quorum_size();
        let voters = self.installs.entry(msg.round.clone()).or_default();
        if voters.insert(msg.sender) && voters.len() == quorum {
            self.install(msg.round).await;
        }
    }

    async fn install(&mut self, round: InstallRound) {
        if !self.ctx.view.get().less_updated_than(&round.install) {
            debug!("{} skips stale install of {}", self.me(), round.install);
            return;
        }
        if self.stage != Stage::Idle {
            self.deferred.push_back(round);
            return;
        }
        info!("{} installing {} after {}", self.me(), round.install, round.associated);

        if round.associated.has_member(self.me()) {
            self.ctx.register.lock().await;
            let msg = StateUpdate {
                sender: self.me().clone(),
                state: self.ctx.register.snapshot().await,
                recv: self.recv.clone(),
                associated: round.associated.clone(),
                install: round.install.clone(),
            };
            spawn_broadcast(
                self.ctx.transport.clone(),
                round.install.members().cloned().collect(),
                Request::Reconfiguration(ReconfigRequest::StateUpdate(msg)),
                "state-update",
            );
        }

        if round.install.has_member(self.me()) {
            self.ctx.register.lock().await;
            self.stage = Stage::AwaitingState(round);
            self.try_finish().await;
        } else {
            self.stage = Stage::AwaitingInstalled(round);
            self.try_depart();
        }
    }

    async fn on_state_update(&mut self, msg: StateUpdate) {
        if !msg.associated.has_member(&msg.sender)
            || !self.ctx.view.get().less_updated_than(&msg.install)
        {
            return;
        }
        let key = (msg.associated.view_ref(), msg.install.view_ref());
        let acc = self.states.entry(key).or_default();
        if acc.senders.insert(msg.sender) {
            acc.state = std::mem::take(&mut acc.state).newest(msg.state);
            acc.recv.extend(msg.recv);
        }
        self.try_finish().await;
    }

    async fn try_finish(&mut self) {
        let round = match &self.stage {
            Stage::AwaitingState(round) => round.clone(),
            _ => return,
        };
        let key = (round.associated.view_ref(), round.install.view_ref());
        let acc = match self.states.get(&key) {
            Some(acc) if acc.senders.len() >= round.associated.quorum_size() => acc.clone(),
            _ => return,
        };

        self.ctx.register.install(acc.state).await;
        self.recv.extend(acc.recv);
        self.recv.retain(|u| !round.install.contains(u));
        self.ctx.view.advance(round.install.clone());
        info!("{} installed {}", self.me(), round.install);

        let leavers: Vec<Process> = round
            .associated
            .members()
            .filter(|p| !round.install.has_member(p))
            .cloned()
            .collect();
        if !leavers.is_empty() {
            let msg = ViewInstalled {
                sender: self.me().clone(),
                view: round.install.clone(),
            };
            spawn_broadcast(
                self.ctx.transport.clone(),
                leavers,
                Request::Reconfiguration(ReconfigRequest::ViewInstalled(msg)),
                "view-installed",
            );
        }

        self.generator.retire(&round.install);
        self.consensus.retire(&round.install);
        let install = &round.install;
        self.states.retain(|(a, _), _| *a != key.0);
        self.installs.retain(|r, _| install.less_updated_than(&r.install));
        self.flooded.retain(|r| install.less_updated_than(&r.install));
        self.installed.retain(|v, _| install.less_updated_than(v));
        self.stage = Stage::Idle;

        let remaining = round.seq.more_updated_than(install);
        if remaining.is_empty() {
            self.ctx.register.unlock();
            self.reset_timer();
        } else {
            debug!("{} continues with {} more view(s)", self.me(), remaining.len());
            self.generator.start(install, remaining);
        }
    }

    fn on_view_installed(&mut self, msg: ViewInstalled) {
        if !msg.view.has_member(&msg.sender) || !self.ctx.view.get().less_updated_than(&msg.view) {
            return;
        }
        self.installed.entry(msg.view).or_default().insert(msg.sender);
        self.try_depart();
    }

    fn try_depart(&mut self) {
        let round = match &self.stage {
            Stage::AwaitingInstalled(round) => round.clone(),
            _ => return,
        };
        let acks = self
            .installed
            .get(&round.install)
            .map_or(0, |s| s.len());
        if acks < round.install.quorum_size() {
            return;
        }
        self.ctx.view.advance(round.install.clone());
        info!("{} left the group, {} took over", self.me(), round.install);
        self.stage = Stage::Departed;
        self.ctx.shutdown.send_replace(true);
    }

    /// Runs installs that arrived while another was in progress.
    async fn settle(&mut self) {
        while self.stage == Stage::Idle {
            match self.deferred.pop_front() {
                Some(round) => self.install(round).await,
                None => break,
            }
        }
    }
}
