// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Every message a process can receive. Each request is a point-to-point
//! call answered by exactly one `Response`; protocol rejections travel as
//! `Response::Rejected` so the transport only ever fails for transport
//! reasons.
//!
//! Requests are grouped by the service that handles them, so a process can
//! dispatch on the outer tag alone.

use crate::{Error, Process, RegisterValue, Update, View, ViewRef, ViewSeq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Consensus instances are named by the associated view they decide for.
/// Views only grow, so the entry count is a usable instance number.
pub type ConsensusId = u64;

pub type ProposalNumber = u64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Register(RegisterRequest),
    Consensus(ConsensusRequest),
    Reconfiguration(ReconfigRequest),
    ViewGenerator(GeneratorRequest),
    Admin(AdminRequest),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterRequest {
    Read { view_ref: ViewRef },
    Write { value: RegisterValue, view_ref: ViewRef },
    GetCurrentView,
}

/// Phase-1 message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub consensus_id: ConsensusId,
    pub associated: View,
    pub n: ProposalNumber,
}

/// Phase-2 message; also what learners count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub consensus_id: ConsensusId,
    pub associated: View,
    pub n: ProposalNumber,
    pub value: ViewSeq,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusRequest {
    Prepare(Ballot),
    Accept(Proposal),
    Learn { sender: Process, proposal: Proposal },
}

impl ConsensusRequest {
    pub fn associated(&self) -> &View {
        match self {
            ConsensusRequest::Prepare(b) => &b.associated,
            ConsensusRequest::Accept(p) | ConsensusRequest::Learn { proposal: p, .. } => &p.associated,
        }
    }
}

/// One step of the install chain: move from `associated` to `install`,
/// with `seq` the remaining path (including `install`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallRound {
    pub install: View,
    pub seq: ViewSeq,
    pub associated: View,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSeq {
    pub sender: Process,
    pub round: InstallRound,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub sender: Process,
    pub state: RegisterValue,
    pub recv: BTreeSet<Update>,
    pub associated: View,
    pub install: View,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInstalled {
    pub sender: Process,
    pub view: View,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigRequest {
    Reconfig { update: Update, view_ref: ViewRef },
    InstallSeq(InstallSeq),
    StateUpdate(StateUpdate),
    ViewInstalled(ViewInstalled),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeSeq {
    pub sender: Process,
    pub associated: View,
    pub proposed: ViewSeq,
    /// Every candidate the sender has heard of, including any its proposal
    /// folded into a merged view.
    pub known: ViewSeq,
    pub last_converged: ViewSeq,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqConv {
    pub sender: Process,
    pub associated: View,
    pub seq: ViewSeq,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeneratorRequest {
    ProposeSeq(ProposeSeq),
    SeqConv(SeqConv),
}

impl GeneratorRequest {
    pub fn associated(&self) -> &View {
        match self {
            GeneratorRequest::ProposeSeq(m) => &m.associated,
            GeneratorRequest::SeqConv(m) => &m.associated,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminRequest {
    /// Ask the receiving process to leave the group.
    Leave,
    /// Stop serving immediately.
    Terminate,
    Ping,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Value(RegisterValue),
    View(View),
    /// Phase-1 reply: the highest-numbered value this acceptor accepted.
    Promise {
        accepted: Option<(ProposalNumber, ViewSeq)>,
    },
    Pong,
    Rejected(Error),
}

impl<T: Into<Response>> From<crate::Result<T>> for Response {
    fn from(r: crate::Result<T>) -> Self {
        match r {
            Ok(v) => v.into(),
            Err(e) => Response::Rejected(e),
        }
    }
}

impl From<()> for Response {
    fn from(_: ()) -> Self {
        Response::Ack
    }
}

impl From<RegisterValue> for Response {
    fn from(v: RegisterValue) -> Self {
        Response::Value(v)
    }
}
