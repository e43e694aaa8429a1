// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the client side of the stack.
//!
//! Provides builders for unsent requests, a helper that answers a captured
//! request, and [`FarEnd`], a scripted [`Connector`] that stands in for the
//! network. Each `(transport, address)` has a scripted [`Behaviour`], accepted
//! connections can be closed from the far side, and everything written to
//! an accepted connection is captured.
//!
//! # Example
//! ```
//! use sip_testkit::{build_options, response_for};
//! let req = build_options("sip:test@example.com");
//! assert_eq!(req.start.method.as_str(), "OPTIONS");
//! let res = response_for(&req, 200);
//! assert_eq!(res.headers.get("CSeq").unwrap(), "1 OPTIONS");
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use sip_core::{default_reason, Headers, Method, Request, RequestLine, Response, SipUri, StatusLine};
use sip_parse::{parse_request, serialize_request, serialize_response};
use sip_transport::{Candidate, ConnectError, Connection, Connector, PoolKey, TransportKind};
use smol_str::SmolStr;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

fn request(method: Method, uri: &str, call_id: &str, body: Bytes) -> Request {
    let mut headers = Headers::new();
    headers.push(
        SmolStr::new("From"),
        SmolStr::new("<sip:alice@example.com>;tag=1234"),
    );
    headers.push(SmolStr::new("To"), SmolStr::new(format!("<{}>", uri)));
    headers.push(SmolStr::new("Call-ID"), SmolStr::new(call_id.to_owned()));
    headers.push(
        SmolStr::new("CSeq"),
        SmolStr::new(format!("1 {}", method.as_str())),
    );

    Request::new(
        RequestLine::new(method, SipUri::parse(uri).unwrap()),
        headers,
        body,
    )
}

/// Constructs an OPTIONS request without a Via, ready to hand to an agent.
pub fn build_options(uri: &str) -> Request {
    request(Method::Options, uri, "options-callid@example.com", Bytes::new())
}

/// Constructs an INVITE request without a Via.
pub fn build_invite(uri: &str, call_id: &str) -> Request {
    let mut req = request(Method::Invite, uri, call_id, Bytes::new());
    req.headers.push(
        SmolStr::new("Contact"),
        SmolStr::new("<sip:alice@client.example.com:5060>"),
    );
    req
}

/// Constructs a MESSAGE request carrying `body` as `text/plain`.
pub fn build_message(uri: &str, body: Bytes) -> Request {
    let mut req = request(Method::Message, uri, "message-callid@example.com", body);
    req.headers
        .push(SmolStr::new("Content-Type"), SmolStr::new("text/plain"));
    req
}

/// A body of exactly `len` printable bytes.
pub fn filler_body(len: usize) -> Bytes {
    Bytes::from(vec![b'x'; len])
}

/// Builds the response a UAS would send for `request`.
///
/// Via, From, Call-ID and CSeq are copied; a To tag is added to anything
/// but 100 Trying.
pub fn response_for(request: &Request, code: u16) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push(SmolStr::new("Via"), via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        let Some(value) = request.headers.get(name) else {
            continue;
        };
        let value = if name == "To" && code > 100 && !value.contains(";tag=") {
            SmolStr::new(format!("{};tag=uas-{}", value, code))
        } else {
            value.clone()
        };
        headers.push(SmolStr::new(name), value);
    }
    headers.push(SmolStr::new("Content-Length"), SmolStr::new("0"));

    Response::new(
        StatusLine::new(code, default_reason(code)),
        headers,
        Bytes::new(),
    )
}

/// Serializes a request to bytes for transport-layer testing.
pub fn as_bytes(request: &Request) -> Bytes {
    serialize_request(request)
}

/// Serializes a response to bytes for transport-layer testing.
pub fn response_as_bytes(response: &Response) -> Bytes {
    serialize_response(response)
}

/// How the far end treats connection attempts to one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    /// Connect succeeds and writes are captured.
    Accept,
    /// Connect fails immediately with [`ConnectError::Refused`].
    Refuse,
    /// Connect never completes.
    Hang,
    /// Connect succeeds but the connection is already closed, so the first
    /// write fails.
    Reset,
    /// Connect succeeds after the given delay.
    Delay(Duration),
}

/// Bytes written to an accepted connection.
#[derive(Debug, Clone)]
pub struct Sent {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
}

impl Sent {
    pub fn request(&self) -> Option<Request> {
        parse_request(&self.payload)
    }

    pub fn method(&self) -> Option<Method> {
        self.request().map(|req| req.start.method)
    }
}

#[derive(Debug, Default)]
struct Capture {
    sent: Mutex<Vec<Sent>>,
    notify: Notify,
}

impl Capture {
    fn sent(&self) -> MutexGuard<'_, Vec<Sent>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, sent: Sent) {
        self.sent().push(sent);
        self.notify.notify_waiters();
    }
}

/// A scripted network for [`Connector`] consumers.
///
/// Addresses without an explicit behaviour get the default, which is
/// [`Behaviour::Accept`] unless changed with [`FarEnd::with_default`].
#[derive(Debug)]
pub struct FarEnd {
    default: Behaviour,
    behaviours: DashMap<PoolKey, Behaviour>,
    attempts: Mutex<Vec<PoolKey>>,
    closers: DashMap<PoolKey, Vec<oneshot::Sender<()>>>,
    capture: Arc<Capture>,
}

impl Default for FarEnd {
    fn default() -> Self {
        Self::new()
    }
}

impl FarEnd {
    pub fn new() -> Self {
        Self::with_default(Behaviour::Accept)
    }

    pub fn with_default(default: Behaviour) -> Self {
        Self {
            default,
            behaviours: DashMap::new(),
            attempts: Mutex::new(Vec::new()),
            closers: DashMap::new(),
            capture: Arc::new(Capture::default()),
        }
    }

    pub fn set(&self, transport: TransportKind, addr: &str, behaviour: Behaviour) -> &Self {
        self.behaviours
            .insert(PoolKey::new(transport, addr.parse().unwrap()), behaviour);
        self
    }

    pub fn refuse(&self, transport: TransportKind, addr: &str) -> &Self {
        self.set(transport, addr, Behaviour::Refuse)
    }

    pub fn hang(&self, transport: TransportKind, addr: &str) -> &Self {
        self.set(transport, addr, Behaviour::Hang)
    }

    pub fn reset(&self, transport: TransportKind, addr: &str) -> &Self {
        self.set(transport, addr, Behaviour::Reset)
    }

    /// Closes every accepted connection to `(transport, addr)`. Later writes
    /// on them fail with `SendError::Closed`.
    pub fn close(&self, transport: TransportKind, addr: &str) {
        let key = PoolKey::new(transport, addr.parse().unwrap());
        if let Some((_, closers)) = self.closers.remove(&key) {
            for closer in closers {
                let _ = closer.send(());
            }
        }
    }

    /// Every connect call seen so far, in order.
    pub fn connect_attempts(&self) -> Vec<(TransportKind, SocketAddr)> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|key| (key.transport, key.addr))
            .collect()
    }

    /// Everything written so far, in order.
    pub fn sent(&self) -> Vec<Sent> {
        self.capture.sent().clone()
    }

    /// Waits until at least `count` writes have been captured.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<Sent> {
        loop {
            let notified = self.capture.notify.notified();
            {
                let sent = self.capture.sent();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }

    /// Waits for the `n`th write (1-based) and parses it as a request.
    pub async fn nth_request(&self, n: usize) -> Request {
        let sent = self.wait_for_sent(n).await;
        sent[n - 1].request().unwrap()
    }

    fn behaviour(&self, key: &PoolKey) -> Behaviour {
        self.behaviours
            .get(key)
            .map(|b| *b)
            .unwrap_or(self.default)
    }

    fn accept(&self, candidate: &Candidate) -> Connection {
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        let (close_tx, mut close_rx) = oneshot::channel();
        self.closers.entry(candidate.key()).or_default().push(close_tx);
        let capture = self.capture.clone();
        let transport = candidate.transport;
        let peer = candidate.addr;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = rx.recv() => match payload {
                        Some(payload) => capture.push(Sent {
                            transport,
                            peer,
                            payload,
                        }),
                        None => break,
                    },
                    _ = &mut close_rx => break,
                }
            }
        });
        Connection::new(transport, peer, tx)
    }
}

#[async_trait]
impl Connector for FarEnd {
    async fn connect(&self, candidate: &Candidate) -> Result<Connection, ConnectError> {
        let key = candidate.key();
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
        let behaviour = self.behaviour(&key);
        debug!(%candidate, ?behaviour, "far end connect");
        match behaviour {
            Behaviour::Accept => Ok(self.accept(candidate)),
            Behaviour::Refuse => Err(ConnectError::Refused(candidate.addr)),
            Behaviour::Hang => std::future::pending().await,
            Behaviour::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept(candidate))
            }
            Behaviour::Reset => {
                let (tx, _) = mpsc::channel(1);
                Ok(Connection::new(candidate.transport, candidate.addr, tx))
            }
        }
    }
}
