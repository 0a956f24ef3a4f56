// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Majority-quorum arithmetic and the fan-out helper every phase of every
//! protocol in this crate is built on.
//!
//! A request fans out to every target as its own task, and replies are
//! collected from a channel until the caller has what it needs. The tasks
//! are never cancelled: a phase that returns after Q replies still lets the
//! request land on the remaining replicas, which is what makes read repair
//! and state propagation reach everyone.

use crate::message::{Request, Response};
use crate::transport::Transport;
use crate::{Error, Process, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Smallest majority of `n`; 1 for an empty group so that nothing can be
/// decided there.
pub fn quorum_size(n: usize) -> usize {
    (n + 1) / 2 + (n + 1) % 2
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Reached,
    Unreachable,
}

/// Counts votes for one phase against one view.
#[derive(Clone, Debug)]
pub struct Tally {
    total: usize,
    quorum: usize,
    successes: usize,
    failures: usize,
}

impl Tally {
    pub fn new(total: usize) -> Self {
        Tally {
            total,
            quorum: quorum_size(total),
            successes: 0,
            failures: 0,
        }
    }

    pub fn success(&mut self) -> Progress {
        self.successes += 1;
        self.progress()
    }

    pub fn failure(&mut self) -> Progress {
        self.failures += 1;
        self.progress()
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn progress(&self) -> Progress {
        if self.successes >= self.quorum {
            Progress::Reached
        } else if self.failures as isize > self.total as isize - self.quorum as isize {
            Progress::Unreachable
        } else {
            Progress::Pending
        }
    }

    pub fn unreachable(&self) -> Error {
        Error::QuorumUnreachable {
            failures: self.failures,
            total: self.total,
        }
    }
}

pub type Replies = mpsc::Receiver<(Process, Result<Response>)>;

/// Sends `request` to every target concurrently. Returns the number of
/// targets and the channel their replies arrive on, in completion order.
pub fn fan_out(
    transport: &Arc<dyn Transport>,
    targets: impl IntoIterator<Item = Process>,
    request: &Request,
) -> (usize, Replies) {
    let targets: Vec<Process> = targets.into_iter().collect();
    let (tx, rx) = mpsc::channel(targets.len().max(1));
    let total = targets.len();
    for target in targets {
        let transport = transport.clone();
        let request = request.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = transport.call(&target, request).await;
            // The collector may have returned already; that's fine.
            let _ = tx.send((target, reply)).await;
        });
    }
    (total, rx)
}

/// Sends `request` to `targets` and waits for a majority of them to
/// acknowledge. A `Rejected` reply counts as a failure.
pub async fn broadcast(
    transport: &Arc<dyn Transport>,
    targets: Vec<Process>,
    request: Request,
) -> Result<()> {
    let (total, mut replies) = fan_out(transport, targets, &request);
    let mut tally = Tally::new(total);
    if tally.progress() == Progress::Unreachable {
        return Err(tally.unreachable());
    }
    while let Some((from, reply)) = replies.recv().await {
        let progress = match reply {
            Ok(Response::Rejected(e)) | Err(e) => {
                debug!("broadcast to {} failed: {}", from, e);
                tally.failure()
            }
            Ok(_) => tally.success(),
        };
        match progress {
            Progress::Reached => return Ok(()),
            Progress::Unreachable => return Err(tally.unreachable()),
            Progress::Pending => (),
        }
    }
    Err(tally.unreachable())
}

/// Fire-and-forget `broadcast`, logging when no majority acknowledged.
pub fn spawn_broadcast(
    transport: Arc<dyn Transport>,
    targets: Vec<Process>,
    request: Request,
    what: &'static str,
) {
    tokio::spawn(async move {
        if let Err(e) = broadcast(&transport, targets, request).await {
            error!("{} broadcast failed: {}", what, e);
        }
    });
}
