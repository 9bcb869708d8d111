//! Daemon-side handle for one supervised process.
//!
//! The handle connects lazily. Calls made while disconnected are queued and
//! replayed in order once the remote announces its methods; if the connect
//! fails every queued call fails with the same connection error. At most one
//! connect attempt is in flight: concurrent callers attach to it through a
//! shared future. Calls in flight on a channel fail with a connection error
//! once that channel is lost or closed.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use guvnor_process::{
    ConnectionState, ProcessId, ProcessInfo, ProcessStatus, StatusReport, WorkerInfo, WorkerRoster,
};
use guvnor_rpc::{ChannelError, ChannelEvent, ChannelFactory, Connected, RpcChannel};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

use crate::error::ProxyError;
use crate::timeout::TimeoutPolicy;

const EVENT_BUFFER: usize = 64;
const DISCONNECTED: &str = "disconnected before the process connected";
const CHANNEL_LOST: &str = "channel lost";

/// Operations a supervised process can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessMethod {
    Kill,
    Restart,
    Send,
    ReportStatus,
    DumpHeap,
    ForceGc,
    Write,
    SetClusterWorkers,
}

impl ProcessMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMethod::Kill => "kill",
            ProcessMethod::Restart => "restart",
            ProcessMethod::Send => "send",
            ProcessMethod::ReportStatus => "reportStatus",
            ProcessMethod::DumpHeap => "dumpHeap",
            ProcessMethod::ForceGc => "forceGc",
            ProcessMethod::Write => "write",
            ProcessMethod::SetClusterWorkers => "setClusterWorkers",
        }
    }
}

impl FromStr for ProcessMethod {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "kill" => ProcessMethod::Kill,
            "restart" => ProcessMethod::Restart,
            "send" => ProcessMethod::Send,
            "reportStatus" => ProcessMethod::ReportStatus,
            "dumpHeap" => ProcessMethod::DumpHeap,
            "forceGc" => ProcessMethod::ForceGc,
            "write" => ProcessMethod::Write,
            "setClusterWorkers" => ProcessMethod::SetClusterWorkers,
            other => {
                return Err(ProxyError::Invocation {
                    method: other.to_string(),
                    message: "unknown method".to_string(),
                });
            }
        })
    }
}

/// Event emitted by the remote process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub name: String,
    pub args: Vec<Value>,
}

/// Completion of a process call.
///
/// The call is issued whether or not this is awaited; dropping it discards the
/// outcome.
#[must_use = "dropping a PendingCall discards the call's outcome"]
pub struct PendingCall {
    inner: BoxFuture<'static, Result<Value, ProxyError>>,
}

impl PendingCall {
    fn new(fut: impl Future<Output = Result<Value, ProxyError>> + Send + 'static) -> Self {
        Self { inner: fut.boxed() }
    }

    fn failed(err: ProxyError) -> Self {
        Self::new(futures_util::future::ready(Err(err)))
    }
}

impl Future for PendingCall {
    type Output = Result<Value, ProxyError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), ProxyError>>>;

struct Attempt {
    epoch: u64,
    future: ConnectAttempt,
    // Dropping this abandons the attempt.
    _cancel: oneshot::Sender<()>,
}

struct Session {
    channel: Arc<dyn RpcChannel>,
    methods: HashMap<String, Option<Duration>>,
    generation: u64,
    // Dropped with the session; calls still waiting on the channel observe it.
    alive: watch::Sender<()>,
}

struct Queued {
    method: String,
    args: Vec<Value>,
    reply: oneshot::Sender<Result<Value, ProxyError>>,
}

struct State {
    connection: ConnectionState,
    attempt: Option<Attempt>,
    epoch: u64,
    session: Option<Session>,
    queue: VecDeque<Queued>,
    status: ProcessStatus,
    // `None` once the process is known not to be a cluster. Never comes back.
    roster: Option<WorkerRoster>,
    generation: u64,
}

struct Inner {
    id: ProcessId,
    target: String,
    factory: Arc<dyn ChannelFactory>,
    policy: TimeoutPolicy,
    state: Mutex<State>,
    events: broadcast::Sender<ProcessEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ProcessProxy {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessProxy")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("connection", &self.connection())
            .finish()
    }
}

impl ProcessProxy {
    pub fn new(
        id: ProcessId,
        target: impl Into<String>,
        cluster: bool,
        factory: Arc<dyn ChannelFactory>,
        policy: TimeoutPolicy,
    ) -> Self {
        let status = ProcessStatus {
            cluster: Some(cluster),
            ..Default::default()
        };
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                id,
                target: target.into(),
                factory,
                policy,
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    attempt: None,
                    epoch: 0,
                    session: None,
                    queue: VecDeque::new(),
                    status,
                    roster: cluster.then(WorkerRoster::default),
                    generation: 0,
                }),
                events,
            }),
        }
    }

    pub fn id(&self) -> &ProcessId {
        &self.inner.id
    }

    pub fn connection(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.inner.events.subscribe()
    }

    pub fn info(&self) -> ProcessInfo {
        let st = self.inner.lock();
        ProcessInfo {
            id: self.inner.id.clone(),
            endpoint: self.inner.target.clone(),
            connection: st.connection,
            cluster: st.roster.is_some(),
            reported: st.status.clone(),
            workers: st.roster.as_ref().map(|r| r.workers().to_vec()),
        }
    }

    pub fn kill(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::Kill, args)
    }

    pub fn restart(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::Restart, args)
    }

    pub fn send(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::Send, args)
    }

    pub fn report_status(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::ReportStatus, args)
    }

    pub fn dump_heap(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::DumpHeap, args)
    }

    pub fn force_gc(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::ForceGc, args)
    }

    pub fn write(&self, args: Vec<Value>) -> PendingCall {
        self.call(ProcessMethod::Write, args)
    }

    /// Invokes `method` on the remote. `setClusterWorkers` is refused with
    /// [`ProxyError::NotCluster`] unless the process is a cluster.
    pub fn call(&self, method: ProcessMethod, args: Vec<Value>) -> PendingCall {
        if method == ProcessMethod::SetClusterWorkers && self.inner.lock().roster.is_none() {
            return PendingCall::failed(ProxyError::NotCluster);
        }
        self.invoke(method.as_str(), args)
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> PendingCall {
        let mut st = self.inner.lock();
        if let Some(session) = &st.session {
            return PendingCall::new(dispatch(session, method, args));
        }

        let (reply, rx) = oneshot::channel();
        st.queue.push_back(Queued {
            method: method.to_string(),
            args,
            reply,
        });
        tracing::debug!(process = %self.inner.id, %method, queued = st.queue.len(), "queued call until connected");
        self.ensure_attempt(&mut st);

        PendingCall::new(async move {
            rx.await
                .unwrap_or_else(|_| Err(ProxyError::Connection("process handle dropped".to_string())))
        })
    }

    /// Connects if needed. Concurrent callers share one attempt.
    pub async fn connect(&self) -> Result<(), ProxyError> {
        let attempt = {
            let mut st = self.inner.lock();
            if st.session.is_some() {
                return Ok(());
            }
            self.ensure_attempt(&mut st)
        };
        attempt.await
    }

    fn ensure_attempt(&self, st: &mut State) -> ConnectAttempt {
        if let Some(attempt) = &st.attempt {
            return attempt.future.clone();
        }

        st.connection = ConnectionState::Connecting;
        st.epoch += 1;
        let epoch = st.epoch;
        let (cancel, cancelled) = oneshot::channel();
        let proxy = self.clone();
        let future = async move { proxy.establish(epoch, cancelled).await }.boxed().shared();
        st.attempt = Some(Attempt {
            epoch,
            future: future.clone(),
            _cancel: cancel,
        });

        let span = tracing::info_span!("connect", process = %self.inner.id, target = %self.inner.target);
        tokio::spawn(future.clone().instrument(span));
        future
    }

    async fn establish(&self, epoch: u64, cancelled: oneshot::Receiver<()>) -> Result<(), ProxyError> {
        let (sink, events) = mpsc::unbounded_channel();
        let connect = self.inner.factory.connect(&self.inner.target, sink);
        let result = tokio::select! {
            result = connect => result,
            _ = cancelled => {
                tracing::debug!("connect attempt abandoned");
                return Err(ProxyError::Connection(DISCONNECTED.to_string()));
            }
        };

        // `disconnect` may have abandoned this attempt after the factory
        // finished; the channel then belongs to nobody.
        let orphan = {
            let mut st = self.inner.lock();
            if st.attempt.as_ref().is_some_and(|a| a.epoch == epoch) {
                st.attempt = None;
                return self.settle(st, result, events);
            }
            result.ok().map(|c| c.channel)
        };
        if let Some(channel) = orphan {
            channel.close().await;
        }
        Err(ProxyError::Connection(DISCONNECTED.to_string()))
    }

    fn settle(
        &self,
        mut st: MutexGuard<'_, State>,
        result: Result<Connected, ChannelError>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Result<(), ProxyError> {
        match result {
            Ok(Connected { channel, methods }) => {
                st.generation += 1;
                let (alive, _) = watch::channel(());
                let session = Session {
                    channel,
                    methods: self.inner.policy.bind(&methods),
                    generation: st.generation,
                    alive,
                };

                let queued: Vec<Queued> = st.queue.drain(..).collect();
                let replayed = queued.len();
                for q in queued {
                    let call = dispatch(&session, &q.method, q.args);
                    tokio::spawn(async move {
                        let _ = q.reply.send(call.await);
                    });
                }

                let generation = session.generation;
                st.session = Some(session);
                st.connection = ConnectionState::Connected;
                drop(st);

                tokio::spawn(pump_events(Arc::downgrade(&self.inner), generation, events));
                tracing::info!(methods = methods.len(), replayed, "connected");
                Ok(())
            }
            Err(e) => {
                st.connection = ConnectionState::Disconnected;
                let queued: Vec<Queued> = st.queue.drain(..).collect();
                drop(st);

                let err = ProxyError::Connection(e.to_string());
                tracing::warn!(error = %e, failed_calls = queued.len(), "connect failed");
                for q in queued {
                    let _ = q.reply.send(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Closes the channel, if any, and returns without waiting for a connect
    /// attempt in flight. Such an attempt is abandoned and the calls queued
    /// behind it fail with [`ProxyError::Connection`].
    pub async fn disconnect(&self) {
        let (session, queued) = {
            let mut st = self.inner.lock();
            let abandoned = st.attempt.take().is_some();
            st.connection = ConnectionState::Disconnected;
            if abandoned {
                tracing::info!(process = %self.inner.id, queued = st.queue.len(), "abandoning connect attempt");
            }
            let queued: Vec<Queued> = st.queue.drain(..).collect();
            (st.session.take(), queued)
        };

        for q in queued {
            let _ = q.reply.send(Err(ProxyError::Connection(DISCONNECTED.to_string())));
        }
        if let Some(session) = session {
            session.channel.close().await;
            tracing::info!(process = %self.inner.id, "disconnected");
        }
    }

    /// Merges a status report pushed by the process. Unknown fields are
    /// dropped. A report that leaves the process a non-cluster revokes the
    /// cluster capability for good.
    pub fn update(&self, report: StatusReport) {
        let mut st = self.inner.lock();
        let rejected = st.status.reconcile(report);
        for key in &rejected {
            tracing::warn!(process = %self.inner.id, field = %key, "ignoring unknown status field");
        }
        if !st.status.is_cluster() && st.roster.take().is_some() {
            tracing::info!(process = %self.inner.id, "process is not a cluster; worker operations revoked");
        }
    }

    /// Cluster operations, present only while the process is a cluster.
    pub fn as_cluster(&self) -> Option<ClusterHandle> {
        self.inner.lock().roster.as_ref().map(|_| ClusterHandle {
            proxy: self.clone(),
        })
    }
}

fn dispatch(session: &Session, method: &str, args: Vec<Value>) -> BoxFuture<'static, Result<Value, ProxyError>> {
    let method = method.to_string();
    let Some(limit) = session.methods.get(&method).copied() else {
        return futures_util::future::ready(Err(ProxyError::Invocation {
            method,
            message: "method not offered by the remote".to_string(),
        }))
        .boxed();
    };

    let response = session.channel.call(&method, args);
    let mut alive = session.alive.subscribe();
    let name = method.clone();
    let outcome = async move {
        tokio::select! {
            result = response => result.map_err(|e| ProxyError::from_channel(&method, e)),
            _ = alive.changed() => Err(ProxyError::Connection(CHANNEL_LOST.to_string())),
        }
    };

    match limit {
        Some(after) => {
            let deadline = tokio::time::Instant::now() + after;
            async move {
                tokio::time::timeout_at(deadline, outcome)
                    .await
                    .unwrap_or_else(|_| Err(ProxyError::Timeout { method: name, after }))
            }
            .boxed()
        }
        None => outcome.boxed(),
    }
}

async fn pump_events(weak: Weak<Inner>, generation: u64, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match event {
            ChannelEvent::Event { name, args } => {
                let _ = inner.events.send(ProcessEvent { name, args });
            }
            ChannelEvent::Closed { reason } => {
                let mut st = inner.lock();
                if st.session.as_ref().is_some_and(|s| s.generation == generation) {
                    st.session = None;
                    if st.attempt.is_none() {
                        st.connection = ConnectionState::Disconnected;
                    }
                    tracing::warn!(process = %inner.id, reason = reason.as_deref().unwrap_or("closed"), "channel lost");
                }
                break;
            }
        }
    }
}

/// Worker operations of a cluster process.
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    proxy: ProcessProxy,
}

impl ClusterHandle {
    fn with_roster<T>(&self, f: impl FnOnce(&mut WorkerRoster) -> T) -> Result<T, ProxyError> {
        let mut st = self.proxy.inner.lock();
        st.roster.as_mut().map(f).ok_or(ProxyError::NotCluster)
    }

    pub fn workers(&self) -> Result<Vec<WorkerInfo>, ProxyError> {
        self.with_roster(|r| r.workers().to_vec())
    }

    /// Returns `false` when a worker with the same id is already known.
    pub fn add_worker(&self, worker: WorkerInfo) -> Result<bool, ProxyError> {
        let id = worker.id.clone();
        let added = self.with_roster(|r| r.add(worker))?;
        if added {
            tracing::debug!(process = %self.proxy.id(), worker = %id, "worker added");
        }
        Ok(added)
    }

    pub fn remove_worker(&self, id: &str) -> Result<Option<WorkerInfo>, ProxyError> {
        self.with_roster(|r| r.remove(id))
    }

    pub fn set_cluster_workers(&self, args: Vec<Value>) -> PendingCall {
        self.proxy.call(ProcessMethod::SetClusterWorkers, args)
    }
}
