// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The client side of the register: majority-quorum reads with repair, and
//! timestamped writes, both against whatever view the client believes is
//! current. A replica that knows a newer view rejects the request with it;
//! the client adopts that view and starts the operation over.

use crate::message::{RegisterRequest, Request, Response};
use crate::quorum::{fan_out, Progress, Tally};
use crate::transport::Transport;
use crate::{Error, RegisterValue, Result, View, ViewRef};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

enum ReadResult {
    /// Every replica in the quorum returned this value.
    Agreed(RegisterValue),
    /// Replicas disagreed; this is the newest value seen.
    Divergent(RegisterValue),
}

enum Phase<T> {
    Done(T),
    ViewUpdated(View),
}

pub struct Client {
    transport: Arc<dyn Transport>,
    view: Mutex<View>,
}

impl Client {
    pub fn new(transport: Arc<dyn Transport>, view: View) -> Self {
        Client {
            transport,
            view: Mutex::new(view),
        }
    }

    pub fn view(&self) -> View {
        self.view.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Switches to `view` if it is newer than the one held.
    pub fn adopt(&self, view: View) -> bool {
        let mut held = self.view.lock().unwrap_or_else(|e| e.into_inner());
        if held.less_updated_than(&view) {
            debug!("client moves to {}", view);
            *held = view;
            true
        } else {
            false
        }
    }

    pub async fn read(&self) -> Result<RegisterValue> {
        loop {
            let view = self.view();
            let view_ref = view.view_ref();
            match self.read_quorum(&view, view_ref).await? {
                Phase::Done(ReadResult::Agreed(v)) => return Ok(v),
                Phase::Done(ReadResult::Divergent(v)) => {
                    trace!("repairing to ts={}", v.timestamp);
                    match self.write_quorum(&view, view_ref, v.clone()).await? {
                        Phase::Done(()) => return Ok(v),
                        Phase::ViewUpdated(newer) => {
                            self.adopt(newer);
                        }
                    }
                }
                Phase::ViewUpdated(newer) => {
                    self.adopt(newer);
                }
            }
        }
    }

    /// Writes `value` with a timestamp above any a quorum has seen. Both
    /// phases run in the same view; a newer view restarts from the read,
    /// since the timestamp it picked may already be taken there.
    pub async fn write(&self, value: Vec<u8>) -> Result<()> {
        loop {
            let view = self.view();
            let view_ref = view.view_ref();
            let current = match self.read_quorum(&view, view_ref).await? {
                Phase::Done(ReadResult::Agreed(v)) | Phase::Done(ReadResult::Divergent(v)) => v,
                Phase::ViewUpdated(newer) => {
                    self.adopt(newer);
                    continue;
                }
            };
            let next = RegisterValue::new(value.clone(), current.timestamp + 1);
            match self.write_quorum(&view, view_ref, next).await? {
                Phase::Done(()) => return Ok(()),
                Phase::ViewUpdated(newer) => {
                    self.adopt(newer);
                }
            }
        }
    }

    async fn read_quorum(&self, view: &View, view_ref: ViewRef) -> Result<Phase<ReadResult>> {
        let request = Request::Register(RegisterRequest::Read { view_ref });
        let (total, mut replies) = fan_out(&self.transport, view.members().cloned(), &request);
        let mut tally = Tally::new(total);
        let mut values: Vec<RegisterValue> = Vec::new();
        let mut progress = tally.progress();
        while progress == Progress::Pending {
            let (from, reply) = match replies.recv().await {
                Some(r) => r,
                None => break,
            };
            progress = match reply {
                Ok(Response::Value(v)) => {
                    values.push(v);
                    tally.success()
                }
                Ok(Response::Rejected(Error::OldView(newer))) if view.less_updated_than(&newer) => {
                    return Ok(Phase::ViewUpdated(newer));
                }
                Ok(other) => {
                    debug!("read from {}: unexpected {:?}", from, other);
                    tally.failure()
                }
                Err(e) => {
                    debug!("read from {} failed: {}", from, e);
                    tally.failure()
                }
            };
        }
        if progress != Progress::Reached {
            return Err(tally.unreachable());
        }
        let newest = values
            .iter()
            .cloned()
            .fold(RegisterValue::default(), RegisterValue::newest);
        if values.iter().all(|v| *v == newest) {
            Ok(Phase::Done(ReadResult::Agreed(newest)))
        } else {
            Ok(Phase::Done(ReadResult::Divergent(newest)))
        }
    }

    async fn write_quorum(&self, view: &View, view_ref: ViewRef, value: RegisterValue) -> Result<Phase<()>> {
        let request = Request::Register(RegisterRequest::Write { value, view_ref });
        let (total, mut replies) = fan_out(&self.transport, view.members().cloned(), &request);
        let mut tally = Tally::new(total);
        let mut progress = tally.progress();
        while progress == Progress::Pending {
            let (from, reply) = match replies.recv().await {
                Some(r) => r,
                None => break,
            };
            progress = match reply {
                Ok(Response::Ack) => tally.success(),
                Ok(Response::Rejected(Error::OldView(newer))) if view.less_updated_than(&newer) => {
                    return Ok(Phase::ViewUpdated(newer));
                }
                Ok(other) => {
                    debug!("write to {}: unexpected {:?}", from, other);
                    tally.failure()
                }
                Err(e) => {
                    debug!("write to {} failed: {}", from, e);
                    tally.failure()
                }
            };
        }
        match progress {
            Progress::Reached => Ok(Phase::Done(())),
            _ => Err(tally.unreachable()),
        }
    }
}
