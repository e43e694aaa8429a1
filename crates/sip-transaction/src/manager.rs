// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The transaction agent.
//!
//! A single task owns every live client transaction. Application calls,
//! DNS answers, connection results, timer expiries and inbound responses all
//! arrive on one command channel and are applied in order, so the registry
//! needs no locking and a transaction never sees two events at once.
//!
//! Work that blocks (resolution, connecting, sleeping) runs in spawned tasks
//! that report back through the same channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Headers, Method, Request, RequestLine, Response, SipMessage, SipUri};
use sip_dns::{ResolveError, Resolver, SipResolver};
use sip_observe::{dispatch_metrics, span_for_transaction};
use sip_parse::{parse_message, serialize_request};
use sip_transport::{
    Candidate, ConnectError, Connection, ConnectionPool, Connector, DefaultTransportPolicy,
    InboundPacket, SendError, TransportPolicy,
};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::{
    cseq_method, generate_branch_id, AgentConfig, ClientAction, ClientEvent, ClientFsm,
    OutgoingRegistry, Outcome, TransactionKey, TransactionOptions, TransactionTimer,
};

/// Lower bound on the idle-connection sweep period.
const MIN_POOL_SWEEP: Duration = Duration::from_secs(1);

/// Receives the single outcome of a transaction.
pub type ResultCallback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// Refers to a transaction created through [`TransactionAgent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    key: TransactionKey,
}

impl TransactionHandle {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }
}

enum Command {
    Create {
        request: Request,
        options: TransactionOptions,
        on_result: ResultCallback,
        reply: oneshot::Sender<Result<TransactionKey>>,
    },
    Cancel(TransactionKey),
    Resolved {
        key: TransactionKey,
        result: Result<Vec<Candidate>, ResolveError>,
    },
    ConnectDone {
        key: TransactionKey,
        attempt: u32,
        candidate: Candidate,
        result: Result<Connection, ConnectError>,
    },
    TimerFired {
        key: TransactionKey,
        timer: TransactionTimer,
        attempt: u32,
    },
    Incoming(Response),
    Count(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

struct ClientEntry {
    fsm: ClientFsm,
    connection: Option<Connection>,
    timers: HashMap<TransactionTimer, oneshot::Sender<()>>,
    on_result: Option<ResultCallback>,
    span: Span,
}

impl ClientEntry {
    fn cancel_timer(&mut self, timer: TransactionTimer) {
        if let Some(tx) = self.timers.remove(&timer) {
            let _ = tx.send(());
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, tx) in self.timers.drain() {
            let _ = tx.send(());
        }
    }
}

/// Sends requests statefully: resolves the destination, picks a transport,
/// connects with fallback and retransmits until a final response, timeout
/// or cancellation.
///
/// Cloning is cheap; all clones drive the same agent task. The agent must be
/// created inside a Tokio runtime.
#[derive(Clone)]
pub struct TransactionAgent {
    cmd_tx: mpsc::UnboundedSender<Command>,
    pool: Arc<ConnectionPool>,
}

impl TransactionAgent {
    /// Agent with the default transport policy and a pool sized from `config`.
    pub fn new(
        config: AgentConfig,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let policy = Arc::new(DefaultTransportPolicy::new(config.udp_mtu));
        let pool = Arc::new(ConnectionPool::with_limits(
            config.pool_max_size,
            config.pool_idle_timeout,
        ));
        Self::with_parts(config, resolver, connector, policy, pool)
    }

    /// Agent resolving through the system DNS configuration.
    pub fn with_system_dns(config: AgentConfig, connector: Arc<dyn Connector>) -> Self {
        let resolver = SipResolver::from_system()
            .with_naptr(config.use_naptr)
            .with_srv(config.use_srv);
        Self::new(config, Arc::new(resolver), connector)
    }

    pub fn with_parts(
        config: AgentConfig,
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn TransportPolicy>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let core = AgentCore {
            config,
            resolver,
            connector,
            policy,
            pool: pool.clone(),
            registry: OutgoingRegistry::new(),
            cmd_tx: cmd_tx.clone(),
            cseq: 0,
        };
        tokio::spawn(core.run(cmd_rx));
        Self { cmd_tx, pool }
    }

    /// Builds a request for `target` and starts a transaction for it.
    ///
    /// The agent fills in Via, Max-Forwards, From, To, Call-ID and CSeq.
    pub async fn create_transaction<F>(
        &self,
        method: Method,
        target: SipUri,
        body: Bytes,
        on_result: F,
    ) -> Result<TransactionHandle>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let request = Request::new(RequestLine::new(method, target), Headers::new(), body);
        self.send_request(request, TransactionOptions::default(), on_result)
            .await
    }

    /// Starts a transaction for a caller-built request.
    ///
    /// A new top Via is always pushed; headers the request already carries
    /// are left alone. ACK and CANCEL are rejected: the INVITE transaction
    /// sends those itself.
    pub async fn send_request<F>(
        &self,
        request: Request,
        options: TransactionOptions,
        on_result: F,
    ) -> Result<TransactionHandle>
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Create {
                request,
                options,
                on_result: Box::new(on_result),
                reply,
            })
            .map_err(|_| anyhow!("transaction agent has shut down"))?;
        let key = rx
            .await
            .map_err(|_| anyhow!("transaction agent has shut down"))??;
        Ok(TransactionHandle { key })
    }

    /// Abandons a transaction. Its callback receives [`Outcome::Cancelled`]
    /// unless an outcome was already delivered.
    pub fn cancel_transaction(&self, handle: &TransactionHandle) {
        self.send(Command::Cancel(handle.key.clone()));
    }

    /// Hands a parsed response to the matching transaction.
    pub fn deliver_incoming(&self, response: Response) {
        self.send(Command::Incoming(response));
    }

    /// Parses raw bytes from a transport and delivers responses.
    ///
    /// Requests are not handled by the client side and are dropped.
    pub fn deliver_bytes(&self, payload: Bytes) -> Result<()> {
        match parse_message(&payload) {
            Some(SipMessage::Response(response)) => {
                self.deliver_incoming(response);
                Ok(())
            }
            Some(SipMessage::Request(request)) => {
                debug!(method = %request.start.method, "ignoring inbound request");
                Ok(())
            }
            None => Err(anyhow!("unparsable SIP message ({} bytes)", payload.len())),
        }
    }

    /// Feeds packets from a connector's inbound channel into the agent until
    /// the channel closes.
    pub fn spawn_inbound(&self, mut inbound: mpsc::Receiver<InboundPacket>) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                if let Err(e) = agent.deliver_bytes(packet.payload) {
                    debug!(
                        peer = %packet.peer,
                        transport = %packet.transport,
                        error = %e,
                        "dropping inbound packet"
                    );
                }
            }
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Number of transactions still registered, including those lingering
    /// in Completed.
    pub async fn active_transactions(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stops the agent. Transactions without an outcome receive
    /// [`Outcome::Cancelled`].
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, command: Command) {
        if self.cmd_tx.send(command).is_err() {
            debug!("transaction agent has shut down; command dropped");
        }
    }
}

struct AgentCore {
    config: AgentConfig,
    resolver: Arc<dyn Resolver>,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn TransportPolicy>,
    pool: Arc<ConnectionPool>,
    registry: OutgoingRegistry<ClientEntry>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cseq: u32,
}

impl AgentCore {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        let period = self.pool.idle_timeout().max(MIN_POOL_SWEEP);
        let mut sweep = time::interval_at(time::Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(other) => self.handle(other),
                    None => break,
                },
                _ = sweep.tick() => {
                    let removed = self.pool.cleanup_idle();
                    if removed > 0 {
                        debug!(removed, "swept idle connections");
                    }
                }
            }
        }
        debug!("transaction agent stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Create {
                request,
                options,
                on_result,
                reply,
            } => {
                let created = self.create(request, options, on_result);
                let key = created.as_ref().ok().cloned();
                let _ = reply.send(created);
                if let Some(key) = key {
                    self.drive(&key, ClientEvent::Start);
                }
            }
            Command::Cancel(key) => {
                if self.registry.contains(&key) {
                    self.drive(&key, ClientEvent::Cancel);
                } else {
                    debug!(%key, "cancel for unknown transaction");
                }
            }
            Command::Resolved { key, result } => self.on_resolved(key, result),
            Command::ConnectDone {
                key,
                attempt,
                candidate,
                result,
            } => self.on_connect_done(key, attempt, candidate, result),
            Command::TimerFired {
                key,
                timer,
                attempt,
            } => self.drive(&key, ClientEvent::TimerFired { timer, attempt }),
            Command::Incoming(response) => self.on_incoming(response),
            Command::Count(reply) => {
                let _ = reply.send(self.registry.len());
            }
            Command::Shutdown(_) => {}
        }
    }

    fn create(
        &mut self,
        request: Request,
        options: TransactionOptions,
        on_result: ResultCallback,
    ) -> Result<TransactionKey> {
        let method = request.start.method.clone();
        if matches!(method, Method::Ack | Method::Cancel) {
            return Err(anyhow!("{method} is sent by its INVITE transaction"));
        }
        if self.registry.len() >= self.config.max_client_transactions {
            warn!(
                limit = self.config.max_client_transactions,
                "client transaction limit reached"
            );
            return Err(anyhow!(
                "client transaction limit ({}) reached",
                self.config.max_client_transactions
            ));
        }

        let target = options
            .proxy
            .or_else(|| self.config.default_proxy.clone())
            .unwrap_or_else(|| request.start.uri.clone());
        let branch = generate_branch_id();
        self.cseq = self.cseq.wrapping_add(1);
        let request = prepare_request(request, &branch, self.cseq, &self.config);

        let key = TransactionKey::new(branch.clone(), method);
        let span = span_for_transaction(key.method.as_str(), &branch);
        span.in_scope(|| debug!(destination = %target, "client transaction created"));

        let entry = ClientEntry {
            fsm: ClientFsm::new(request, target, self.config.timer_defaults()),
            connection: None,
            timers: HashMap::new(),
            on_result: Some(on_result),
            span,
        };
        self.registry.register(key.clone(), entry)?;
        Ok(key)
    }

    /// Runs an event through the machine, then any events the resulting
    /// actions produced, until the transaction settles.
    fn drive(&mut self, key: &TransactionKey, event: ClientEvent) {
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            let Some(entry) = self.registry.get_mut(key) else {
                return;
            };
            let span = entry.span.clone();
            let _guard = span.enter();
            let actions = entry.fsm.on_event(event);
            for action in actions {
                self.apply(key, action, &mut pending);
            }
        }
    }

    fn apply(
        &mut self,
        key: &TransactionKey,
        action: ClientAction,
        pending: &mut VecDeque<ClientEvent>,
    ) {
        match action {
            ClientAction::Resolve { target } => self.spawn_resolve(key, target),
            ClientAction::Connect { candidate, attempt } => {
                self.connect(key, candidate, attempt, pending)
            }
            ClientAction::Release { candidate } => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.connection = None;
                }
                dispatch_metrics().on_fallback(candidate.transport.as_str());
                debug!(%candidate, "candidate failed, trying next");
            }
            ClientAction::Transmit { bytes, retransmit } => {
                self.transmit(key, bytes, retransmit, pending)
            }
            ClientAction::Schedule { timer, duration } => self.schedule_timer(key, timer, duration),
            ClientAction::Cancel(timer) => {
                if let Some(entry) = self.registry.get_mut(key) {
                    entry.cancel_timer(timer);
                }
            }
            ClientAction::Complete(outcome) => self.complete(key, outcome),
            ClientAction::Terminate => {
                if let Some(mut entry) = self.registry.unregister(key) {
                    entry.cancel_all_timers();
                    debug!("client transaction terminated");
                }
            }
        }
    }

    fn spawn_resolve(&self, key: &TransactionKey, target: SipUri) {
        let resolver = self.resolver.clone();
        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.config.dns_timeout;
        let key = key.clone();
        tokio::spawn(
            async move {
                let result = match time::timeout(timeout, resolver.resolve(&target)).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(destination = %target, "DNS resolution timed out");
                        Err(ResolveError::Unresolvable(target.host.clone()))
                    }
                };
                let _ = cmd_tx.send(Command::Resolved { key, result });
            }
            .instrument(Span::current()),
        );
    }

    fn on_resolved(&mut self, key: TransactionKey, result: Result<Vec<Candidate>, ResolveError>) {
        let event = match result {
            Ok(candidates) => {
                let Some(entry) = self.registry.get(&key) else {
                    return;
                };
                let size = serialize_request(entry.fsm.request()).len();
                let selected = self.policy.select(&candidates, size);
                entry.span.in_scope(|| {
                    debug!(
                        resolved = candidates.len(),
                        selected = selected.len(),
                        size,
                        "destination resolved"
                    )
                });
                ClientEvent::Resolved(selected)
            }
            Err(e) => {
                warn!(%key, error = %e, "destination unresolvable");
                ClientEvent::Unresolvable
            }
        };
        self.drive(&key, event);
    }

    fn connect(
        &mut self,
        key: &TransactionKey,
        candidate: Candidate,
        attempt: u32,
        pending: &mut VecDeque<ClientEvent>,
    ) {
        if let Some(connection) = self.pool.get(&candidate.key()) {
            debug!(%candidate, "reusing pooled connection");
            if let Some(entry) = self.registry.get_mut(key) {
                entry.connection = Some(connection);
            }
            pending.push_back(ClientEvent::Connected { attempt });
            return;
        }

        debug!(%candidate, attempt, "connecting");
        let connector = self.connector.clone();
        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.config.connect_timeout;
        let key = key.clone();
        tokio::spawn(
            async move {
                let result = match time::timeout(timeout, connector.connect(&candidate)).await {
                    Ok(result) => result,
                    Err(_) => {
                        dispatch_metrics().on_error(candidate.transport.as_str(), "timeout");
                        Err(ConnectError::TimedOut(candidate.addr))
                    }
                };
                let _ = cmd_tx.send(Command::ConnectDone {
                    key,
                    attempt,
                    candidate,
                    result,
                });
            }
            .instrument(Span::current()),
        );
    }

    fn on_connect_done(
        &mut self,
        key: TransactionKey,
        attempt: u32,
        candidate: Candidate,
        result: Result<Connection, ConnectError>,
    ) {
        match result {
            Ok(connection) => {
                self.pool.insert(connection.clone());
                let accepted = match self.registry.get_mut(&key) {
                    Some(entry) if entry.fsm.attempt() == attempt => {
                        entry.connection = Some(connection);
                        true
                    }
                    _ => false,
                };
                if accepted {
                    self.drive(&key, ClientEvent::Connected { attempt });
                } else {
                    debug!(%key, %candidate, "connection completed after transaction moved on");
                }
            }
            Err(e) => {
                warn!(%key, %candidate, error = %e, "connect failed");
                self.drive(&key, ClientEvent::ConnectFailed { attempt });
            }
        }
    }

    fn transmit(
        &mut self,
        key: &TransactionKey,
        bytes: Bytes,
        retransmit: bool,
        pending: &mut VecDeque<ClientEvent>,
    ) {
        let Some(entry) = self.registry.get_mut(key) else {
            return;
        };
        let attempt = entry.fsm.attempt();
        let Some(connection) = entry.connection.clone() else {
            warn!("no connection to transmit on");
            pending.push_back(ClientEvent::TransportFailed { attempt });
            return;
        };

        let len = bytes.len();
        match connection.send(bytes) {
            Ok(()) => {
                if retransmit {
                    dispatch_metrics().on_retransmit(connection.transport().as_str());
                    debug!(peer = %connection.peer(), len, "retransmitted");
                } else {
                    debug!(
                        peer = %connection.peer(),
                        transport = %connection.transport(),
                        len,
                        "sent"
                    );
                }
            }
            Err(e) => {
                warn!(peer = %connection.peer(), error = %e, "send failed");
                if e == SendError::Closed {
                    self.pool.close(&connection.key());
                }
                entry.connection = None;
                pending.push_back(ClientEvent::TransportFailed { attempt });
            }
        }
    }

    fn schedule_timer(&mut self, key: &TransactionKey, timer: TransactionTimer, duration: Duration) {
        let Some(entry) = self.registry.get_mut(key) else {
            return;
        };
        entry.cancel_timer(timer);
        let attempt = entry.fsm.attempt();
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        entry.timers.insert(timer, cancel_tx);

        let cmd_tx = self.cmd_tx.clone();
        let key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(duration) => {
                    let _ = cmd_tx.send(Command::TimerFired { key, timer, attempt });
                }
                _ = &mut cancel_rx => {}
            }
        });
    }

    fn complete(&mut self, key: &TransactionKey, outcome: Outcome) {
        let status = outcome.status();
        dispatch_metrics().on_outcome(&status.to_string());
        match &outcome {
            Outcome::Final(_) => debug!(status, "final response"),
            other => info!(status, outcome = ?other, "transaction failed"),
        }
        let callback = self
            .registry
            .get_mut(key)
            .and_then(|entry| entry.on_result.take());
        match callback {
            Some(callback) => callback(outcome),
            None => error!(%key, "outcome produced twice"),
        }
    }

    fn on_incoming(&mut self, response: Response) {
        if cseq_method(&response.headers) == Some(Method::Cancel) {
            debug!(status = response.code(), "response to CANCEL ignored");
            return;
        }
        match self.registry.lookup_key(&response) {
            Some(key) => self.drive(&key, ClientEvent::Response(response)),
            None => {
                dispatch_metrics().on_unmatched_response();
                debug!(
                    status = response.code(),
                    cseq = ?response.headers.get("CSeq"),
                    "no client transaction for response, dropping"
                );
            }
        }
    }

    fn shutdown(&mut self) {
        let mut cancelled = 0usize;
        for (_, mut entry) in self.registry.drain() {
            entry.cancel_all_timers();
            if let Some(callback) = entry.on_result.take() {
                cancelled += 1;
                callback(Outcome::Cancelled);
            }
        }
        info!(cancelled, "transaction agent shutting down");
    }
}

/// Adds the headers a stateful client request needs.
fn prepare_request(mut request: Request, branch: &str, cseq: u32, config: &AgentConfig) -> Request {
    let host = &config.via_host;
    let headers = &mut request.headers;
    headers.push_front("Via", format!("SIP/2.0/UDP {host};branch={branch};rport"));
    if !headers.contains("Max-Forwards") {
        headers.push("Max-Forwards", config.max_forwards.to_string());
    }
    if !headers.contains("From") {
        headers.push("From", format!("<sip:anonymous@{host}>;tag={}", token(10)));
    }
    if !headers.contains("To") {
        headers.push("To", format!("<{}>", request.start.uri));
    }
    if !headers.contains("Call-ID") {
        headers.push("Call-ID", format!("{}@{host}", token(16)));
    }
    if !headers.contains("CSeq") {
        headers.push("CSeq", format!("{cseq} {}", request.start.method));
    }
    if let Some(agent) = &config.user_agent {
        if !headers.contains("User-Agent") {
            headers.push("User-Agent", agent.clone());
        }
    }
    request
}

fn token(len: usize) -> SmolStr {
    let s: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    SmolStr::new(s)
}
