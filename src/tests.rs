// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::message::{Ballot, Proposal};
use crate::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const PATIENCE: Duration = Duration::from_secs(20);

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

fn view_of(names: &[&str]) -> View {
    View::with_updates(names.iter().map(|n| Update::join(*n)))
}

fn fast_config(use_consensus: bool) -> Config {
    Config {
        reconfig_delay_ms: 50,
        reconfig_period_ms: 100,
        use_consensus,
        ..Config::default()
    }
}

struct Cluster {
    net: Arc<LocalNetwork>,
    config: Config,
    servers: BTreeMap<Process, Arc<Server>>,
}

impl Cluster {
    fn new(config: Config) -> Self {
        Cluster {
            net: LocalNetwork::new(),
            config,
            servers: BTreeMap::new(),
        }
    }

    fn add_server(&mut self, name: &str, initial: &View) -> Arc<Server> {
        let server = Server::start(
            Process::from(name),
            initial.clone(),
            self.config.clone(),
            self.net.clone(),
            Arc::new(MemStore::new()),
        );
        self.net.register(&server);
        self.servers.insert(server.me().clone(), server.clone());
        server
    }

    fn with_servers(config: Config, names: &[&str]) -> (Self, View) {
        let view = view_of(names);
        let mut cluster = Cluster::new(config);
        for n in names {
            cluster.add_server(n, &view);
        }
        (cluster, view)
    }

    fn server(&self, name: &str) -> &Arc<Server> {
        &self.servers[&Process::from(name)]
    }

    fn client(&self, view: &View) -> Client {
        Client::new(self.net.clone(), view.clone())
    }

    /// Waits until every named server has installed a view satisfying `f`.
    async fn settle_on<F: Fn(&View) -> bool>(&self, names: &[&str], f: F) {
        let deadline = Instant::now() + PATIENCE;
        loop {
            let views: Vec<View> = names.iter().map(|n| self.server(n).current_view()).collect();
            if views.iter().all(|v| f(v)) {
                return;
            }
            assert!(Instant::now() < deadline, "views never settled: {:?}", views);
            sleep(Duration::from_millis(10)).await;
        }
    }

    fn shutdown(&self) {
        for s in self.servers.values() {
            s.shutdown();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn read_survives_one_failure() -> Result<()> {
    trace_init();
    let (cluster, view) = Cluster::with_servers(Config::default(), &["a", "b", "c"]);
    let client = cluster.client(&view);
    timeout(PATIENCE, client.write(vec![5])).await.expect("write")?;
    cluster.net.set_down(&Process::from("c"), true);
    let v = timeout(PATIENCE, client.read()).await.expect("read")?;
    assert_eq!(v.value, vec![5]);
    assert_eq!(v.timestamp, 1);

    // Two down is one too many for three replicas.
    cluster.net.set_down(&Process::from("b"), true);
    let r = timeout(PATIENCE, client.read()).await.expect("read");
    assert!(matches!(r, Err(Error::QuorumUnreachable { .. })));
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_client_adopts_newer_view() -> Result<()> {
    trace_init();
    let old = view_of(&["a", "b"]);
    let new = old.copy_with_updates(vec![Update::join("c")]);
    let mut cluster = Cluster::new(Config::default());
    for n in &["a", "b", "c"] {
        cluster.add_server(n, &new);
    }
    let client = cluster.client(&old);
    timeout(PATIENCE, client.write(vec![1])).await.expect("write")?;
    assert_eq!(client.view(), new);
    let fresh = cluster.client(&new);
    assert_eq!(timeout(PATIENCE, fresh.read()).await.expect("read")?.value, vec![1]);
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_read_repairs() -> Result<()> {
    trace_init();
    let (cluster, view) = Cluster::with_servers(Config::default(), &["a", "b", "c"]);
    for (n, ts) in &[("a", 3), ("b", 3), ("c", 2)] {
        let value = RegisterValue::new(vec![*ts as u8], *ts);
        cluster.server(n).register().install(value).await;
    }
    cluster
        .net
        .set_delay(&Process::from("b"), Some(Duration::from_millis(100)));
    let v = timeout(PATIENCE, cluster.client(&view).read())
        .await
        .expect("read")?;
    assert_eq!(v.timestamp, 3);
    assert_eq!(v.value, vec![3]);

    let deadline = Instant::now() + PATIENCE;
    while cluster.server("c").register().snapshot().await.timestamp != 3 {
        assert!(Instant::now() < deadline, "c never repaired");
        sleep(Duration::from_millis(10)).await;
    }
    cluster.shutdown();
    Ok(())
}

/// Moves every server to `newer`, holding `value`, before any register
/// write is delivered.
struct ViewChangeBeforeWrite {
    net: Arc<LocalNetwork>,
    servers: Vec<Arc<Server>>,
    newer: View,
    value: RegisterValue,
    fired: tokio::sync::Mutex<bool>,
}

#[async_trait]
impl Transport for ViewChangeBeforeWrite {
    async fn call(&self, to: &Process, request: Request) -> Result<Response> {
        if let Request::Register(RegisterRequest::Write { .. }) = &request {
            let mut fired = self.fired.lock().await;
            if !*fired {
                for s in &self.servers {
                    s.register().install(self.value.clone()).await;
                    assert!(s.advance_view(self.newer.clone()));
                }
                *fired = true;
            }
        }
        self.net.call(to, request).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_restarts_from_read_in_newer_view() -> Result<()> {
    trace_init();
    let (cluster, v0) = Cluster::with_servers(Config::default(), &["a", "b", "c"]);
    let v1 = v0.copy_with_updates(vec![Update::join("d")]);
    let transport = Arc::new(ViewChangeBeforeWrite {
        net: cluster.net.clone(),
        servers: cluster.servers.values().cloned().collect(),
        newer: v1.clone(),
        value: RegisterValue::new(b"other".to_vec(), 7),
        fired: tokio::sync::Mutex::new(false),
    });
    let client = Client::new(transport, v0);
    timeout(PATIENCE, client.write(b"mine".to_vec()))
        .await
        .expect("write")?;
    assert_eq!(client.view(), v1);

    let v = timeout(PATIENCE, cluster.client(&v1).read()).await.expect("read")?;
    assert_eq!(v.value, b"mine".to_vec());
    assert_eq!(v.timestamp, 8);
    cluster.shutdown();
    Ok(())
}

async fn join_one(use_consensus: bool) -> Result<()> {
    let (mut cluster, v0) = Cluster::with_servers(fast_config(use_consensus), &["a", "b", "c"]);
    assert_eq!(v0.quorum_size(), 2);
    timeout(PATIENCE, cluster.client(&v0).write(vec![9]))
        .await
        .expect("write")?;

    let d = cluster.add_server("d", &v0);
    assert!(d.register().is_locked());
    timeout(PATIENCE, d.join()).await.expect("join")?;
    debug!("d joined: {}", d.current_view());

    let names = ["a", "b", "c", "d"];
    cluster.settle_on(&names, |v| v.n() == 4).await;
    let v1 = d.current_view();
    assert_eq!(v1.quorum_size(), 3);
    assert!(v0.less_updated_than(&v1));
    for n in &names {
        assert_eq!(cluster.server(n).current_view(), v1);
    }
    // The view moves first, the register unlocks right after.
    let deadline = Instant::now() + PATIENCE;
    while d.register().is_locked() {
        assert!(Instant::now() < deadline, "d never unlocked");
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(d.register().snapshot().await.value, vec![9]);

    // A client still holding the old view gets moved along.
    let old_client = cluster.client(&v0);
    let v = timeout(PATIENCE, old_client.read()).await.expect("read")?;
    assert_eq!(v.value, vec![9]);
    assert_eq!(old_client.view(), v1);
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_joins_by_convergence() -> Result<()> {
    trace_init();
    join_one(false).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_joins_by_consensus() -> Result<()> {
    trace_init();
    join_one(true).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_converge() -> Result<()> {
    trace_init();
    let (mut cluster, v0) = Cluster::with_servers(fast_config(false), &["a", "b", "c"]);
    timeout(PATIENCE, cluster.client(&v0).write(vec![3]))
        .await
        .expect("write")?;

    let d = cluster.add_server("d", &v0);
    let e = cluster.add_server("e", &v0);
    let (rd, re) = timeout(PATIENCE, async { tokio::join!(d.join(), e.join()) })
        .await
        .expect("joins");
    rd?;
    re?;

    let names = ["a", "b", "c", "d", "e"];
    cluster.settle_on(&names, |v| v.n() == 5).await;
    let v = cluster.server("a").current_view();
    for n in &names {
        assert_eq!(cluster.server(n).current_view(), v);
    }
    let client = cluster.client(&v);
    assert_eq!(timeout(PATIENCE, client.read()).await.expect("read")?.value, vec![3]);
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn process_leaves_and_terminates() -> Result<()> {
    trace_init();
    let (cluster, v0) = Cluster::with_servers(fast_config(false), &["a", "b", "c", "d"]);
    timeout(PATIENCE, cluster.client(&v0).write(vec![4]))
        .await
        .expect("write")?;

    let d = cluster.server("d").clone();
    timeout(PATIENCE, d.leave()).await.expect("leave")?;
    assert!(d.is_terminated());

    cluster.settle_on(&["a", "b", "c"], |v| v.n() == 3).await;
    let v1 = cluster.server("a").current_view();
    assert!(!v1.has_member(&Process::from("d")));
    assert!(v1.contains(&Update::leave("d")));

    let client = cluster.client(&v1);
    assert_eq!(timeout(PATIENCE, client.read()).await.expect("read")?.value, vec![4]);
    timeout(PATIENCE, client.write(vec![5])).await.expect("write")?;
    assert_eq!(timeout(PATIENCE, client.read()).await.expect("read")?.value, vec![5]);
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admin_requests() -> Result<()> {
    trace_init();
    let (cluster, _) = Cluster::with_servers(Config::default(), &["a", "b", "c"]);
    let c = Process::from("c");
    let ping = Request::Admin(AdminRequest::Ping);
    assert_eq!(cluster.net.call(&c, ping.clone()).await?, Response::Pong);
    let pongs = futures::future::join_all(
        cluster
            .servers
            .keys()
            .map(|p| cluster.net.call(p, ping.clone())),
    )
    .await;
    assert!(pongs.iter().all(|r| matches!(r, Ok(Response::Pong))));

    assert_eq!(
        cluster.net.call(&c, Request::Admin(AdminRequest::Terminate)).await?,
        Response::Ack
    );
    assert!(cluster.server("c").is_terminated());
    assert!(matches!(
        cluster.net.call(&c, ping).await,
        Err(Error::Networking(_))
    ));
    cluster.shutdown();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn requests_in_stale_views_are_refused() -> Result<()> {
    trace_init();
    let old = view_of(&["a", "b"]);
    let new = old.copy_with_updates(vec![Update::join("c")]);
    let mut cluster = Cluster::new(Config::default());
    cluster.add_server("a", &new);
    let a = Process::from("a");
    let read = Request::Register(RegisterRequest::Read {
        view_ref: old.view_ref(),
    });
    assert_eq!(
        cluster.net.call(&a, read).await?,
        Response::Rejected(Error::OldView(new.clone()))
    );
    let reconfig = Request::Reconfiguration(ReconfigRequest::Reconfig {
        update: Update::join("d"),
        view_ref: old.view_ref(),
    });
    assert_eq!(
        cluster.net.call(&a, reconfig).await?,
        Response::Rejected(Error::OldView(new.clone()))
    );
    let prepare = Request::Consensus(ConsensusRequest::Prepare(Ballot {
        consensus_id: crate::consensus::consensus_id(&old),
        associated: old.clone(),
        n: 1,
    }));
    assert_eq!(
        cluster.net.call(&a, prepare).await?,
        Response::Rejected(Error::OldView(new.clone()))
    );
    let accept = Request::Consensus(ConsensusRequest::Accept(Proposal {
        consensus_id: crate::consensus::consensus_id(&old),
        associated: old.clone(),
        n: 1,
        value: ViewSeq::from(vec![new.clone()]),
    }));
    assert_eq!(
        cluster.net.call(&a, accept).await?,
        Response::Rejected(Error::OldView(new.clone()))
    );
    assert_eq!(cluster.server("a").consensus_instances(), 0);

    let get = Request::Register(RegisterRequest::GetCurrentView);
    assert_eq!(cluster.net.call(&a, get).await?, Response::View(new));
    cluster.shutdown();
    Ok(())
}
