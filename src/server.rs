// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A storage process: the register replica, its current view, and the
//! services that answer requests for them. Nothing in here knows about the
//! network; `handle` maps one request to one response and a transport
//! decides how requests arrive.

use crate::config::Config;
use crate::consensus::Consensus;
use crate::generator::Generator;
use crate::message::{
    AdminRequest, ConsensusRequest, GeneratorRequest, ReconfigRequest, RegisterRequest, Request,
    Response,
};
use crate::quorum::{fan_out, Progress, Tally};
use crate::reconfig::{Event, Reconfigurer};
use crate::register::Register;
use crate::store::DurableStore;
use crate::transport::Transport;
use crate::view::CurrentView;
use crate::{Client, Error, Process, Result, Update, View};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// State shared by every task of one process.
pub struct Context {
    pub me: Process,
    pub config: Config,
    pub transport: Arc<dyn Transport>,
    pub view: CurrentView,
    pub register: Register,
    pub shutdown: watch::Sender<bool>,
}

impl Context {
    /// Resolves once the process has shut down.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await.map(|_| ());
    }

    pub fn is_terminated(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Asks the members of the current view to apply `update`, moving on to
    /// newer views as they are reported. A process that is a member waits
    /// for its own view to catch up instead of taking the report on trust.
    async fn request_update(&self, update: Update) -> Result<()> {
        loop {
            let snap = self.view.snapshot();
            if snap.view.contains(&update) {
                return Ok(());
            }
            let request = Request::Reconfiguration(ReconfigRequest::Reconfig {
                update: update.clone(),
                view_ref: snap.view_ref,
            });
            let (total, mut replies) = fan_out(&self.transport, snap.view.members().cloned(), &request);
            let mut tally = Tally::new(total);
            let mut progress = tally.progress();
            let mut newer = None;
            while progress == Progress::Pending {
                let reply = match replies.recv().await {
                    Some((_, reply)) => reply,
                    None => break,
                };
                progress = match reply {
                    Ok(Response::Ack) => tally.success(),
                    Ok(Response::Rejected(Error::OldView(v))) if snap.view.less_updated_than(&v) => {
                        newer = Some(v);
                        break;
                    }
                    _ => tally.failure(),
                };
            }
            match newer {
                Some(v) if snap.view.has_member(&self.me) => {
                    let mut rx = self.view.subscribe();
                    rx.wait_for(|s| !s.view.less_updated_than(&v))
                        .await
                        .map(|_| ())
                        .map_err(|_| Error::Shutdown)?;
                }
                Some(v) => {
                    self.view.advance(v);
                }
                None if progress == Progress::Reached => return Ok(()),
                None => return Err(tally.unreachable()),
            }
        }
    }
}

pub struct Server {
    ctx: Arc<Context>,
    consensus: Arc<Consensus>,
    generator: Arc<Generator>,
    events: mpsc::Sender<Event>,
}

impl Server {
    /// Starts a process believing `initial` is the current view. If it is
    /// not a member of `initial` its register stays locked until a view
    /// including it is installed.
    pub fn start(
        me: Process,
        initial: View,
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
    ) -> Arc<Server> {
        let (events, events_rx) = mpsc::channel(config.queue_capacity);
        let locked = !initial.has_member(&me);
        info!("{} starting in {}{}", me, initial, if locked { " (locked)" } else { "" });
        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(Context {
            me: me.clone(),
            config: config.clone(),
            transport: transport.clone(),
            view: CurrentView::new(initial),
            register: Register::new(locked),
            shutdown,
        });
        let consensus = Arc::new(Consensus::new(
            me.clone(),
            transport.clone(),
            store,
            events.clone(),
        ));
        let generator = Arc::new(Generator::new(
            me,
            config.use_consensus,
            transport,
            consensus.clone(),
            events.clone(),
        ));
        let reconfigurer = Reconfigurer::new(ctx.clone(), generator.clone(), consensus.clone());
        tokio::spawn(reconfigurer.run(events_rx));
        Arc::new(Server {
            ctx,
            consensus,
            generator,
            events,
        })
    }

    pub fn me(&self) -> &Process {
        &self.ctx.me
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn current_view(&self) -> View {
        self.ctx.view.get()
    }

    pub fn register(&self) -> &Register {
        &self.ctx.register
    }

    /// A client starting from this process's current view.
    pub fn client(&self) -> Client {
        Client::new(self.ctx.transport.clone(), self.current_view())
    }

    pub fn is_terminated(&self) -> bool {
        self.ctx.is_terminated()
    }

    /// Moves the current view forward as if an install had finished here.
    #[cfg(test)]
    pub(crate) fn advance_view(&self, view: View) -> bool {
        self.ctx.view.advance(view)
    }

    #[cfg(test)]
    pub(crate) fn consensus_instances(&self) -> usize {
        self.consensus.instance_count()
    }

    pub fn shutdown(&self) {
        if !self.ctx.shutdown.send_replace(true) {
            info!("{} shutting down", self.me());
        }
    }

    pub async fn stopped(&self) {
        self.ctx.stopped().await
    }

    /// Joins the group and waits until a view including this process is
    /// installed here.
    pub async fn join(&self) -> Result<()> {
        let me = self.me().clone();
        self.ctx.request_update(Update::join(me.clone())).await?;
        let mut rx = self.ctx.view.subscribe();
        let member = async { rx.wait_for(|s| s.view.has_member(&me)).await.map(|_| ()) };
        tokio::select! {
            r = member => r.map_err(|_| Error::Shutdown),
            _ = self.ctx.stopped() => Err(Error::Shutdown),
        }
    }

    /// Leaves the group; resolves once the remaining members have installed
    /// a view without this process and it has shut down.
    pub async fn leave(&self) -> Result<()> {
        self.ctx.request_update(Update::leave(self.me().clone())).await?;
        self.stopped().await;
        Ok(())
    }

    fn is_stale(&self, associated: &View) -> bool {
        associated.less_updated_than(&self.ctx.view.get())
    }

    async fn enqueue(&self, event: Event) -> Response {
        match self.events.send(event).await {
            Ok(()) => Response::Ack,
            Err(_) => Response::Rejected(Error::Shutdown),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        if self.is_terminated() {
            return Response::Rejected(Error::Shutdown);
        }
        match request {
            Request::Register(r) => {
                tokio::select! {
                    resp = self.on_register(r) => resp,
                    _ = self.ctx.stopped() => Response::Rejected(Error::Shutdown),
                }
            }
            Request::Consensus(r) => self.on_consensus(r).await,
            Request::Reconfiguration(r) => self.on_reconfig(r).await,
            Request::ViewGenerator(r) => self.on_generator(r).await,
            Request::Admin(r) => self.on_admin(r),
        }
    }

    async fn on_register(&self, request: RegisterRequest) -> Response {
        let view = &self.ctx.view;
        match request {
            RegisterRequest::Read { view_ref } => {
                self.ctx.register.read(|| view.admit(&view_ref)).await.into()
            }
            RegisterRequest::Write { value, view_ref } => self
                .ctx
                .register
                .write(value, || view.admit(&view_ref))
                .await
                .into(),
            RegisterRequest::GetCurrentView => Response::View(view.get()),
        }
    }

    /// Instances for views older than the current one are retired and stay
    /// retired: late ballots are refused and late learns dropped.
    async fn on_consensus(&self, request: ConsensusRequest) -> Response {
        if self.is_stale(request.associated()) {
            return match request {
                ConsensusRequest::Learn { .. } => Response::Ack,
                _ => Response::Rejected(Error::OldView(self.current_view())),
            };
        }
        self.consensus.on_request(request).await
    }

    async fn on_reconfig(&self, request: ReconfigRequest) -> Response {
        match request {
            ReconfigRequest::Reconfig { update, view_ref } => match self.ctx.view.admit(&view_ref) {
                Ok(()) => self.enqueue(Event::Update(update)).await,
                Err(e) => Response::Rejected(e),
            },
            ReconfigRequest::InstallSeq(m) => self.enqueue(Event::InstallSeq(m)).await,
            ReconfigRequest::StateUpdate(m) => self.enqueue(Event::StateUpdate(m)).await,
            ReconfigRequest::ViewInstalled(m) => self.enqueue(Event::ViewInstalled(m)).await,
        }
    }

    async fn on_generator(&self, request: GeneratorRequest) -> Response {
        let associated = request.associated();
        if self.is_stale(associated) || !associated.has_member(self.me()) {
            return Response::Ack;
        }
        self.generator.on_request(request).await
    }

    fn on_admin(&self, request: AdminRequest) -> Response {
        match request {
            AdminRequest::Ping => Response::Pong,
            AdminRequest::Terminate => {
                self.shutdown();
                Response::Ack
            }
            AdminRequest::Leave => {
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    let me = ctx.me.clone();
                    if let Err(e) = ctx.request_update(Update::leave(me.clone())).await {
                        warn!("{} could not leave: {}", me, e);
                    }
                });
                Response::Ack
            }
        }
    }
}
