// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Per-process tunables, parsed from TOML. Any field left out takes its
//! default; any field not listed here is an error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Wait this long after start before the first reconfiguration attempt.
    pub reconfig_delay_ms: u64,
    /// Then attempt one every period.
    pub reconfig_period_ms: u64,
    /// Generate view sequences with Paxos instead of the consensus-free
    /// convergence protocol.
    pub use_consensus: bool,
    /// Bound on queued, not yet handled, reconfiguration events.
    pub queue_capacity: usize,
    /// First reconnect delay on a broken TCP link; doubled per attempt.
    pub backoff_initial_ms: u64,
    /// Give up on a link once the delay would exceed this.
    pub backoff_cap_ms: u64,
    /// Largest TCP frame accepted; a longer one closes the connection.
    pub max_frame_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reconfig_delay_ms: 1000,
            reconfig_period_ms: 1000,
            use_consensus: false,
            queue_capacity: 1024,
            backoff_initial_ms: 1000,
            backoff_cap_ms: 32000,
            max_frame_bytes: 64 << 20,
        }
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconfig_period_ms == 0 {
            return Err(Error::Config("reconfig_period_ms must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue_capacity must be positive".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(Error::Config("max_frame_bytes must be positive".into()));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_cap_ms {
            return Err(Error::Config(format!(
                "backoff_initial_ms ({}) must be in 1..=backoff_cap_ms ({})",
                self.backoff_initial_ms, self.backoff_cap_ms
            )));
        }
        Ok(())
    }

    pub fn reconfig_delay(&self) -> Duration {
        Duration::from_millis(self.reconfig_delay_ms)
    }

    pub fn reconfig_period(&self) -> Duration {
        Duration::from_millis(self.reconfig_period_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }
}
