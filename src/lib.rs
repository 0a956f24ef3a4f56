// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a fault-tolerant replicated _register_ -- a single
 * timestamped value, stored on a group of processes -- whose group can be
 * changed while it's running, without stopping reads and writes for longer
 * than the state transfer takes and without needing consensus to do it.
 *
 *   - Reads and writes are the classic majority-quorum ones: a read asks a
 *     quorum for their values and repairs any replica that lags behind, a
 *     write stores a value with a higher timestamp at a quorum.
 *
 *   - The group membership is a _view_: a set of join and leave updates,
 *     which forms a lattice. Concurrent reconfigurations produce
 *     incomparable views, and the members of the old view agree on a
 *     _sequence_ of views to move through by gossip alone. An optional
 *     single-decree Paxos instance can decide the sequence instead.
 *
 *   - Every request carries a reference to the view it was made in. A
 *     replica that has moved on refuses it and answers with the newer view,
 *     and the client moves on too.
 *
 * The price is that every process has to keep the whole update history of
 * the group in its view, and a process that has left the group can never
 * rejoin under the same address.
 *
 * The protocol logic lives in plain state machines (`view`, `consensus`,
 * `generator`) wrapped in one tokio task per instance; `Server` ties them
 * together behind a `Transport`, of which there is an in-process one for
 * tests and a TCP one.
 *
 * ## Reference
 *
 * Eduardo Alchieri, Alysson Bessani, Fabíola Greve, Joni da Silva Fraga.
 * Efficient and Modular Consensus-Free Reconfiguration for Fault-Tolerant
 * Storage. OPODIS 2017.
 *
 * https://arxiv.org/abs/1607.05344
 */

mod client;
mod config;
mod consensus;
mod error;
mod generator;
mod message;
mod quorum;
mod reconfig;
mod register;
mod server;
mod store;
mod tcp;
mod transport;
mod view;

#[cfg(test)]
mod tests;

pub use client::Client;
pub use config::Config;
pub use consensus::{choose_value, next_proposal_number, Acceptor, Learner};
pub use error::{Error, Result};
pub use generator::{resolve, Generation};
pub use message::{
    AdminRequest, ConsensusId, ConsensusRequest, GeneratorRequest, ReconfigRequest,
    RegisterRequest, Request, Response,
};
pub use quorum::quorum_size;
pub use register::{Register, RegisterValue};
pub use server::Server;
pub use store::{DurableStore, FileStore, MemStore};
pub use tcp::{serve, TcpTransport};
pub use transport::{LocalNetwork, Transport};
pub use view::{Process, Update, UpdateKind, View, ViewRef, ViewSeq};

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber writing to stderr, filtered by
/// `RUST_LOG` (default `info`). Does nothing if one is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
