// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The local replica of the register: one timestamped value, only ever
//! replaced by a value with a strictly greater timestamp.
//!
//! While a reconfiguration is transferring state the replica is _locked_:
//! reads and writes wait for the unlock instead of being served from a
//! snapshot that is about to be superseded. Locking takes the write guard,
//! so a lock never overlaps an in-flight write, and the snapshot taken
//! after locking is final for the old view.

use crate::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::trace;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterValue {
    pub value: Vec<u8>,
    pub timestamp: u64,
}

impl RegisterValue {
    pub fn new(value: Vec<u8>, timestamp: u64) -> Self {
        RegisterValue { value, timestamp }
    }

    /// Highest timestamp wins; ties keep `self`.
    pub fn newest(self, other: RegisterValue) -> RegisterValue {
        if other.timestamp > self.timestamp {
            other
        } else {
            self
        }
    }
}

#[derive(Debug)]
pub struct Register {
    slot: RwLock<RegisterValue>,
    locked: watch::Sender<bool>,
}

impl Register {
    pub fn new(locked: bool) -> Self {
        let (tx, _) = watch::channel(locked);
        Register {
            slot: RwLock::new(RegisterValue::default()),
            locked: tx,
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    async fn wait_unlocked(&self) {
        let mut rx = self.locked.subscribe();
        // Only fails if the sender is gone, and we own the sender.
        let _ = rx.wait_for(|locked| !locked).await;
    }

    /// Returns the stored value once unlocked, if `admit` accepts the
    /// caller's view. `admit` runs under the guard so the view cannot move
    /// between the check and the read.
    pub async fn read(&self, admit: impl Fn() -> Result<()>) -> Result<RegisterValue> {
        loop {
            self.wait_unlocked().await;
            let slot = self.slot.read().await;
            if self.is_locked() {
                continue;
            }
            admit()?;
            return Ok(slot.clone());
        }
    }

    /// Stores `value` if it is newer. A stale write is still acknowledged.
    pub async fn write(&self, value: RegisterValue, admit: impl Fn() -> Result<()>) -> Result<()> {
        loop {
            self.wait_unlocked().await;
            let mut slot = self.slot.write().await;
            if self.is_locked() {
                continue;
            }
            admit()?;
            if value.timestamp > slot.timestamp {
                trace!("register write ts={}", value.timestamp);
                *slot = value;
            }
            return Ok(());
        }
    }

    pub async fn lock(&self) {
        let _slot = self.slot.write().await;
        self.locked.send_replace(true);
    }

    pub fn unlock(&self) {
        self.locked.send_replace(false);
    }

    pub async fn snapshot(&self) -> RegisterValue {
        self.slot.read().await.clone()
    }

    /// Adopts transferred state, bypassing the lock.
    pub async fn install(&self, state: RegisterValue) {
        let mut slot = self.slot.write().await;
        if state.timestamp > slot.timestamp {
            *slot = state;
        }
    }
}
