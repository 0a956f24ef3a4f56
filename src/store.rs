// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Durable key/value storage for the consensus acceptor state. The only
//! guarantee that matters is that a `set` has reached stable storage before
//! it returns, since acceptors reply only after persisting.

use crate::{Error, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
}

pub async fn load<T: DeserializeOwned>(store: &dyn DurableStore, key: &str) -> Result<Option<T>> {
    match store.get(key.as_bytes()).await? {
        Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn save<T: Serialize>(store: &dyn DurableStore, key: &str, value: &T) -> Result<()> {
    let bytes = rmp_serde::to_vec(value)?;
    store.set(key.as_bytes(), &bytes).await
}

/// Volatile store, for tests and for processes that accept losing their
/// acceptor state on restart.
#[derive(Debug, Default)]
pub struct MemStore {
    table: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }
}

#[async_trait]
impl DurableStore for MemStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.table.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.table.lock().await.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

struct FileInner {
    file: File,
    table: HashMap<Vec<u8>, Vec<u8>>,
}

/// Append-only log of `(key, value)` records, each a big-endian u32 length
/// followed by that many bytes of msgpack. Replayed in full on open; the
/// last record for a key wins. A torn record at the tail is discarded.
pub struct FileStore {
    inner: Mutex<FileInner>,
}

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut table = HashMap::new();
        let mut pos = 0;
        let mut records = 0;
        while pos + 4 <= buf.len() {
            let len = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
            let end = pos + 4 + len;
            if end > buf.len() {
                break;
            }
            let (k, v): (Vec<u8>, Vec<u8>) = match rmp_serde::from_slice(&buf[pos + 4..end]) {
                Ok(kv) => kv,
                Err(e) => return Err(Error::Storage(format!("corrupt record at {}: {}", pos, e))),
            };
            table.insert(k, v);
            pos = end;
            records += 1;
        }
        if pos < buf.len() {
            warn!("dropping {} trailing bytes in '{}'", buf.len() - pos, path.display());
            file.set_len(pos as u64).await?;
        }
        info!("opened store '{}' with {} records", path.display(), records);
        Ok(FileStore {
            inner: Mutex::new(FileInner { file, table }),
        })
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().await.table.get(key).cloned())
    }

    async fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = rmp_serde::to_vec(&(key, value))?;
        let len = u32::try_from(record.len())
            .map_err(|_| Error::Storage(format!("record of {} bytes too large", record.len())))?;
        let mut frame = Vec::with_capacity(4 + record.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&record);

        let mut inner = self.inner.lock().await;
        inner.file.write_all(&frame).await?;
        inner.file.sync_data().await?;
        inner.table.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
