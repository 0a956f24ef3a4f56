// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The seam between the protocols and the network. Protocol code only ever
//! makes one kind of call: send a request to a process, await its response.
//! A failed call means the process is unreachable (crashed, partitioned or
//! gone); protocol-level refusals come back as `Response::Rejected`.

use crate::message::{Request, Response};
use crate::server::Server;
use crate::{Error, Process, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::trace;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: &Process, request: Request) -> Result<Response>;
}

#[derive(Default)]
struct Net {
    servers: HashMap<Process, Weak<Server>>,
    down: HashSet<Process>,
    delays: HashMap<Process, Duration>,
}

/// In-process network for tests and simulations. Every message is passed
/// through the wire codec, so anything that works here also serializes.
/// Processes can be taken down (calls to them fail) or slowed down (calls
/// to them are delivered late).
#[derive(Default)]
pub struct LocalNetwork {
    net: Mutex<Net>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalNetwork::default())
    }

    fn net(&self) -> std::sync::MutexGuard<'_, Net> {
        // A poisoned lock only means another test thread panicked.
        self.net.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, server: &Arc<Server>) {
        let me = server.me().clone();
        self.net().servers.insert(me, Arc::downgrade(server));
    }

    pub fn set_down(&self, process: &Process, down: bool) {
        let mut net = self.net();
        if down {
            net.down.insert(process.clone());
        } else {
            net.down.remove(process);
        }
    }

    pub fn set_delay(&self, process: &Process, delay: Option<Duration>) {
        let mut net = self.net();
        match delay {
            Some(d) => net.delays.insert(process.clone(), d),
            None => net.delays.remove(process),
        };
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn call(&self, to: &Process, request: Request) -> Result<Response> {
        let (server, delay) = {
            let net = self.net();
            if net.down.contains(to) {
                return Err(Error::Networking(format!("{} is down", to)));
            }
            let server = net.servers.get(to).and_then(Weak::upgrade);
            (server, net.delays.get(to).copied())
        };
        let server = server.ok_or_else(|| Error::Networking(format!("no route to {}", to)))?;
        if server.is_terminated() {
            return Err(Error::Networking(format!("{} has terminated", to)));
        }
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let bytes = rmp_serde::to_vec(&request)?;
        let request: Request = rmp_serde::from_slice(&bytes)?;
        trace!("local call to {}: {:?}", to, request);
        let response = server.handle(request).await;
        let bytes = rmp_serde::to_vec(&response)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}
