// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transactions for outbound SIP requests.
//!
//! A [`TransactionAgent`] owns every live client transaction. Each one
//! resolves its destination, filters the candidates by message size, tries
//! them strictly in order and reports exactly one [`Outcome`] to the
//! application.

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use sip_core::{Headers, Method, Request, Response};
use smol_str::SmolStr;

pub mod config;
pub mod fsm;
pub mod manager;
pub mod registry;
pub mod timers;

pub use config::{AgentConfig, TransactionOptions};
pub use fsm::{ClientAction, ClientEvent, ClientFsm};
pub use manager::{ResultCallback, TransactionAgent, TransactionHandle};
pub use registry::{DuplicateKey, OutgoingRegistry};

/// RFC 3261 magic cookie that prefixes every branch this stack generates.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Returns the top-most Via entry, splitting comma-joined values.
pub fn top_via(headers: &Headers) -> Option<&str> {
    let value = headers.get("Via").or_else(|| headers.get("v"))?;
    value.split(',').next().map(str::trim)
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Returns the branch ID for the given request, if one is present.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = top_via(&req.headers)?;
    branch_from_via(via).map(SmolStr::new)
}

/// Method named by the CSeq header (`"1 INVITE"` yields `INVITE`).
pub fn cseq_method(headers: &Headers) -> Option<Method> {
    let cseq = headers.get("CSeq")?;
    let token = cseq.split_whitespace().nth(1)?;
    Some(Method::from_token(token))
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{BRANCH_MAGIC_COOKIE}{suffix}"))
}

/// Client timers (RFC 3261 §17.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    /// INVITE retransmission.
    A,
    /// INVITE timeout.
    B,
    /// Wait for retransmitted INVITE final responses.
    D,
    /// Non-INVITE retransmission.
    E,
    /// Non-INVITE timeout.
    F,
    /// Wait for retransmitted non-INVITE final responses.
    K,
}

/// Identifies a client transaction: top Via branch plus method.
///
/// ACK and CANCEL share the key of the INVITE they refer to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
}

impl TransactionKey {
    pub fn new(branch: impl Into<SmolStr>, method: Method) -> Self {
        let method = match method {
            Method::Ack | Method::Cancel => Method::Invite,
            other => other,
        };
        Self {
            branch: branch.into(),
            method,
        }
    }

    /// Builds a key from a request, deriving the branch parameter.
    pub fn from_request(req: &Request) -> Option<Self> {
        let branch = request_branch_id(req)?;
        Some(Self::new(branch, req.start.method.clone()))
    }

    /// Builds the key a response correlates to: its top Via branch and the
    /// method in its CSeq.
    pub fn from_response(res: &Response) -> Option<Self> {
        let via = top_via(&res.headers)?;
        let branch = branch_from_via(via)?;
        let method = cseq_method(&res.headers)?;
        Some(Self::new(branch, method))
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.method)
    }
}

/// Client transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Created,
    Resolving,
    /// Waiting for the connection manager on candidate `index`.
    Attempting { index: usize },
    /// Request sent, nothing heard yet.
    AwaitingResponse,
    /// A provisional response arrived.
    Proceeding,
    /// Outcome delivered; absorbing retransmitted final responses.
    Completed,
    Terminated,
}

impl ClientState {
    /// True once the outcome has been produced.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Completed | ClientState::Terminated)
    }
}

/// Terminal result of a client transaction, delivered once through the
/// `on_result` callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A final (>= 200) response from the far end.
    Final(Response),
    /// DNS produced no candidate for the target.
    Unresolvable { target: SmolStr },
    /// Every candidate failed to connect or accept the request.
    ServiceUnavailable,
    /// Connected, but no final response before Timer B/F.
    TimedOut { status: u16 },
    /// The application cancelled the transaction.
    Cancelled,
}

impl Outcome {
    /// Status code the application should treat this outcome as.
    pub fn status(&self) -> u16 {
        match self {
            Outcome::Final(response) => response.code(),
            Outcome::Unresolvable { .. } | Outcome::ServiceUnavailable => 503,
            Outcome::TimedOut { status } => *status,
            Outcome::Cancelled => 487,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Final(response) if response.is_success())
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            Outcome::Final(response) => Some(response),
            _ => None,
        }
    }
}
