// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! TCP transport. Each remote process gets one long-lived link task owning
//! one connection; calls are tagged with an id and multiplexed over it, so
//! a slow reply never holds up the calls behind it. Frames are a big-endian
//! u64 length followed by msgpack; a length over the configured limit ends
//! the connection before anything is allocated for it.
//!
//! A link that cannot connect fails the calls queued on it and backs off,
//! doubling the delay each time. Once the delay passes the cap the link is
//! dropped, and the next call to that process starts a fresh one.

use crate::config::Config;
use crate::message::{Request, Response};
use crate::server::Server;
use crate::transport::Transport;
use crate::{Error, Process, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = rmp_serde::to_vec(msg)?;
    w.write_u64(bytes.len() as u64).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R, T>(r: &mut R, max_len: u64) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match r.read_u64().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max_len {
        return Err(Error::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, max_len
        )));
    }
    let mut buf = vec![0; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Some(rmp_serde::from_slice(&buf)?))
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    id: u64,
    body: Request,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    id: u64,
    body: Response,
}

struct Call {
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Response>>>>>;

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct TcpTransport {
    backoff_initial: Duration,
    backoff_cap: Duration,
    max_frame: u64,
    links: Mutex<HashMap<Process, mpsc::Sender<Call>>>,
}

impl TcpTransport {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(TcpTransport {
            backoff_initial: config.backoff_initial(),
            backoff_cap: config.backoff_cap(),
            max_frame: config.max_frame_bytes,
            links: Mutex::new(HashMap::new()),
        })
    }

    fn link(&self, to: &Process) -> mpsc::Sender<Call> {
        let mut links = locked(&self.links);
        if let Some(tx) = links.get(to) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run_link(
            to.clone(),
            rx,
            self.backoff_initial,
            self.backoff_cap,
            self.max_frame,
        ));
        links.insert(to.clone(), tx.clone());
        tx
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: &Process, request: Request) -> Result<Response> {
        let (reply, rx) = oneshot::channel();
        let call = Call { request, reply };
        if let Err(mpsc::error::SendError(call)) = self.link(to).send(call).await {
            // The link was evicted between lookup and send.
            self.link(to)
                .send(call)
                .await
                .map_err(|_| Error::Networking(format!("link to {} closed", to)))?;
        }
        rx.await
            .map_err(|_| Error::Networking(format!("link to {} dropped call", to)))?
    }
}

async fn run_link(
    to: Process,
    mut rx: mpsc::Receiver<Call>,
    initial: Duration,
    cap: Duration,
    max_frame: u64,
) {
    let mut delay = initial;
    while let Some(call) = rx.recv().await {
        let stream = match TcpStream::connect(to.addr()).await {
            Ok(stream) => stream,
            Err(e) => {
                let err = Error::Networking(format!("connecting to {}: {}", to, e));
                warn!("{}", err);
                let _ = call.reply.send(Err(err.clone()));
                while let Ok(call) = rx.try_recv() {
                    let _ = call.reply.send(Err(err.clone()));
                }
                if delay > cap {
                    debug!("evicting link to {}", to);
                    return;
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
                continue;
            }
        };
        delay = initial;
        debug!("connected to {}", to);
        match run_session(stream, call, &mut rx, max_frame).await {
            Ok(()) => return,
            Err(e) => debug!("session with {} ended: {}", to, e),
        }
    }
}

/// Returns `Ok` only when the transport hung up on this link.
async fn run_session(
    stream: TcpStream,
    first: Call,
    rx: &mut mpsc::Receiver<Call>,
    max_frame: u64,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let mut reader = tokio::spawn(read_replies(read_half, pending.clone(), max_frame));
    let mut next = Some(first);
    let mut next_id = 0u64;
    let result = loop {
        let call = match next.take() {
            Some(call) => call,
            None => tokio::select! {
                call = rx.recv() => match call {
                    Some(call) => call,
                    None => break Ok(()),
                },
                _ = &mut reader => break Err(Error::Networking("connection closed".into())),
            },
        };
        let id = next_id;
        next_id += 1;
        locked(&pending).insert(id, call.reply);
        let envelope = Envelope {
            id,
            body: call.request,
        };
        if let Err(e) = write_frame(&mut write_half, &envelope).await {
            break Err(e);
        }
    };
    reader.abort();
    for (_, reply) in locked(&pending).drain() {
        let _ = reply.send(Err(Error::Networking("connection lost".into())));
    }
    result
}

async fn read_replies(mut r: OwnedReadHalf, pending: Pending, max_frame: u64) -> Result<()> {
    while let Some(reply) = read_frame::<_, Reply>(&mut r, max_frame).await? {
        if let Some(tx) = locked(&pending).remove(&reply.id) {
            let _ = tx.send(Ok(reply.body));
        }
    }
    Ok(())
}

/// Accepts connections for `server` until it shuts down.
pub async fn serve(listener: TcpListener, server: Arc<Server>) -> Result<()> {
    info!("{} listening on {}", server.me(), listener.local_addr()?);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                trace!("{} accepted {}", server.me(), addr);
                tokio::spawn(serve_connection(stream, server.clone()));
            }
            _ = server.stopped() => {
                info!("{} stopped listening", server.me());
                return Ok(());
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, server: Arc<Server>) {
    let max_frame = server.config().max_frame_bytes;
    let (mut r, mut w) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Reply>(64);
    let writer = tokio::spawn(async move {
        while let Some(reply) = rx.recv().await {
            if let Err(e) = write_frame(&mut w, &reply).await {
                debug!("reply write failed: {}", e);
                break;
            }
        }
    });
    loop {
        match read_frame::<_, Envelope>(&mut r, max_frame).await {
            Ok(Some(envelope)) => {
                if server.is_terminated() {
                    break;
                }
                let server = server.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let body = server.handle(envelope.body).await;
                    let _ = tx.send(Reply { id: envelope.id, body }).await;
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!("request read failed: {}", e);
                break;
            }
        }
    }
    drop(tx);
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RegisterRequest;
    use crate::store::MemStore;
    use crate::{Update, View};

    const LIMIT: u64 = 1 << 20;

    #[tokio::test]
    async fn frames_survive_a_pipe() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = Envelope {
            id: 7,
            body: Request::Register(RegisterRequest::GetCurrentView),
        };
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &sent).await?;
            drop(a);
            Ok::<_, Error>(())
        });
        let got: Envelope = read_frame(&mut b, LIMIT)
            .await?
            .ok_or_else(|| Error::Codec("stream ended early".into()))?;
        assert_eq!(got.id, 7);
        assert_eq!(got.body, Request::Register(RegisterRequest::GetCurrentView));
        assert!(read_frame::<_, Envelope>(&mut b, LIMIT).await?.is_none());
        writer.await.map_err(|e| Error::Io(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() -> Result<()> {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u64(u64::MAX).await?;
        let r = read_frame::<_, Envelope>(&mut b, LIMIT).await;
        assert!(matches!(r, Err(Error::Codec(_))));
        Ok(())
    }

    #[tokio::test]
    async fn garbage_header_drops_only_that_connection() -> Result<()> {
        let l = TcpListener::bind("127.0.0.1:0").await?;
        let me = Process::from(l.local_addr()?.to_string());
        let view = View::with_updates(vec![Update::join(me.clone())]);
        let config = Config::default();
        let transport = TcpTransport::new(&config);
        let server = Server::start(
            me.clone(),
            view,
            config,
            transport.clone(),
            Arc::new(MemStore::new()),
        );
        tokio::spawn(serve(l, server.clone()));

        let mut raw = TcpStream::connect(me.addr()).await?;
        raw.write_all(&[0xff; 8]).await?;
        let mut rest = Vec::new();
        raw.read_to_end(&mut rest).await?;
        assert!(rest.is_empty());

        let ping = Request::Admin(crate::message::AdminRequest::Ping);
        assert_eq!(transport.call(&me, ping).await?, Response::Pong);
        server.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_process_fails_fast() {
        let config = Config {
            backoff_initial_ms: 10,
            backoff_cap_ms: 20,
            ..Config::default()
        };
        let t = TcpTransport::new(&config);
        let nobody = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Process::from(l.local_addr().unwrap().to_string())
        };
        let r = t.call(&nobody, Request::Admin(crate::message::AdminRequest::Ping)).await;
        assert!(matches!(r, Err(Error::Networking(_))));
    }

    #[tokio::test]
    async fn three_servers_over_tcp() -> Result<()> {
        let mut listeners = Vec::new();
        let mut procs = Vec::new();
        for _ in 0..3 {
            let l = TcpListener::bind("127.0.0.1:0").await?;
            procs.push(Process::from(l.local_addr()?.to_string()));
            listeners.push(l);
        }
        let view = View::with_updates(procs.iter().cloned().map(Update::join));
        let config = Config::default();
        let transport = TcpTransport::new(&config);
        let mut servers = Vec::new();
        for (p, l) in procs.iter().zip(listeners) {
            let s = Server::start(
                p.clone(),
                view.clone(),
                config.clone(),
                transport.clone(),
                Arc::new(MemStore::new()),
            );
            tokio::spawn(serve(l, s.clone()));
            servers.push(s);
        }
        let client = servers[0].client();
        client.write(vec![1, 2, 3]).await?;
        let other = crate::Client::new(transport.clone(), view.clone());
        assert_eq!(other.read().await?.value, vec![1, 2, 3]);
        for s in &servers {
            s.shutdown();
        }
        Ok(())
    }
}
