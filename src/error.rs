// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Process, View};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors are values: the protocol ones (`OldView`, `OldProposalNumber`)
/// travel inside otherwise-successful responses, so the whole enum is
/// serializable and owns only plain data.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    #[error("request made in a stale view, current view is {0}")]
    OldView(View),
    #[error("proposal number is older than the last promise")]
    OldProposalNumber,
    #[error("quorum unreachable: {failures} of {total} replicas failed")]
    QuorumUnreachable { failures: usize, total: usize },
    #[error("process {0} is not a member of the view")]
    NotMember(Process),
    #[error("networking error: {0}")]
    Networking(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("process has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
