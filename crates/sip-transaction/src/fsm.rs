// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client transaction state machine.
//!
//! The machine performs no I/O. The agent feeds it [`ClientEvent`]s
//! (resolution results, connection results, responses, timer expiries) and
//! carries out the [`ClientAction`]s it returns.
//!
//! ```text
//! Created -> Resolving -> Attempting(i) -> AwaitingResponse -> Proceeding
//!                             |   ^               |               |
//!                             +---+ (i + 1)       +---------------+--> Completed -> Terminated
//! ```
//!
//! Every connection attempt gets a fresh attempt number. Connection results
//! and timers carry the attempt they belong to, and anything tagged with an
//! older attempt is ignored.

use std::time::Duration;

use bytes::Bytes;
use sip_core::{Headers, Method, Request, RequestLine, Response, SipUri};
use sip_parse::serialize_request;
use sip_transport::{Candidate, TransportKind};
use smol_str::SmolStr;

use crate::{
    timers::{TimerDefaults, TransportAwareTimers},
    top_via, ClientState, Outcome, TransactionTimer,
};

/// Inputs to [`ClientFsm::on_event`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Start,
    /// Candidates after transport selection, in attempt order.
    Resolved(Vec<Candidate>),
    Unresolvable,
    Connected { attempt: u32 },
    ConnectFailed { attempt: u32 },
    /// The connection rejected bytes after it was established.
    TransportFailed { attempt: u32 },
    Response(Response),
    TimerFired {
        timer: TransactionTimer,
        attempt: u32,
    },
    Cancel,
}

/// Work the agent performs on behalf of the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAction {
    Resolve {
        target: SipUri,
    },
    Connect {
        candidate: Candidate,
        attempt: u32,
    },
    /// The current candidate failed; drop its connection reference.
    Release {
        candidate: Candidate,
    },
    /// Send over the current connection.
    Transmit {
        bytes: Bytes,
        retransmit: bool,
    },
    Schedule {
        timer: TransactionTimer,
        duration: Duration,
    },
    Cancel(TransactionTimer),
    /// Deliver the outcome to the application. Emitted at most once.
    Complete(Outcome),
    /// Remove the transaction and everything it holds.
    Terminate,
}

/// One outgoing request and its progress through the candidate list.
#[derive(Debug)]
pub struct ClientFsm {
    state: ClientState,
    request: Request,
    target: SipUri,
    defaults: TimerDefaults,
    candidates: Vec<Candidate>,
    cursor: usize,
    attempt: u32,
    timers: Option<TransportAwareTimers>,
    interval: Duration,
    last_request: Option<Bytes>,
    ack: Option<Bytes>,
}

impl ClientFsm {
    /// `request` must already carry its top Via; `target` is where it is
    /// routed (a proxy or the Request-URI).
    pub fn new(request: Request, target: SipUri, defaults: TimerDefaults) -> Self {
        Self {
            state: ClientState::Created,
            request,
            target,
            defaults,
            candidates: Vec::new(),
            cursor: 0,
            attempt: 0,
            timers: None,
            interval: defaults.t1,
            last_request: None,
            ack: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn target(&self) -> &SipUri {
        &self.target
    }

    pub fn method(&self) -> &Method {
        &self.request.start.method
    }

    /// Number of the current connection attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn current_candidate(&self) -> Option<&Candidate> {
        match self.state {
            ClientState::Created | ClientState::Resolving => None,
            _ => self.candidates.get(self.cursor),
        }
    }

    fn is_invite(&self) -> bool {
        self.request.start.method.is_invite()
    }

    fn retransmit_timer(&self) -> TransactionTimer {
        if self.is_invite() {
            TransactionTimer::A
        } else {
            TransactionTimer::E
        }
    }

    fn timeout_timer(&self) -> TransactionTimer {
        if self.is_invite() {
            TransactionTimer::B
        } else {
            TransactionTimer::F
        }
    }

    /// Handles an event and returns the actions for the runtime.
    pub fn on_event(&mut self, event: ClientEvent) -> Vec<ClientAction> {
        use ClientState::*;
        match (self.state, event) {
            (Created, ClientEvent::Start) => {
                self.state = Resolving;
                vec![ClientAction::Resolve {
                    target: self.target.clone(),
                }]
            }
            (Resolving, ClientEvent::Resolved(candidates)) => {
                if candidates.is_empty() {
                    return self.unresolvable();
                }
                self.candidates = candidates;
                self.try_candidate(0)
            }
            (Resolving, ClientEvent::Unresolvable) => self.unresolvable(),
            (Attempting { .. }, ClientEvent::Connected { attempt }) if attempt == self.attempt => {
                self.send_request()
            }
            (Attempting { .. }, ClientEvent::ConnectFailed { attempt })
                if attempt == self.attempt =>
            {
                self.fall_back()
            }
            (Attempting { .. } | AwaitingResponse, ClientEvent::TransportFailed { attempt })
                if attempt == self.attempt =>
            {
                self.fall_back()
            }
            (Proceeding, ClientEvent::TransportFailed { attempt }) if attempt == self.attempt => {
                // The far end has seen the request; do not repeat it elsewhere.
                self.finish(Outcome::ServiceUnavailable)
            }
            (
                state @ (Attempting { .. } | AwaitingResponse | Proceeding | Completed),
                ClientEvent::Response(response),
            ) => self.handle_response(state, response),
            (_, ClientEvent::TimerFired { timer, attempt }) if attempt == self.attempt => {
                self.handle_timer(timer)
            }
            (Completed | Terminated, ClientEvent::Cancel) => Vec::new(),
            (Proceeding, ClientEvent::Cancel) if self.is_invite() => {
                let cancel = serialize_request(&self.build_cancel());
                let mut actions = vec![ClientAction::Transmit {
                    bytes: cancel,
                    retransmit: false,
                }];
                actions.extend(self.finish(Outcome::Cancelled));
                actions
            }
            (_, ClientEvent::Cancel) => self.finish(Outcome::Cancelled),
            _ => Vec::new(),
        }
    }

    fn unresolvable(&mut self) -> Vec<ClientAction> {
        let target = self.target.host.clone();
        self.finish(Outcome::Unresolvable { target })
    }

    fn try_candidate(&mut self, index: usize) -> Vec<ClientAction> {
        self.cursor = index;
        self.timers = None;
        let Some(candidate) = self.candidates.get(index).cloned() else {
            return self.finish(Outcome::ServiceUnavailable);
        };
        self.state = ClientState::Attempting { index };
        self.attempt += 1;
        vec![ClientAction::Connect {
            candidate,
            attempt: self.attempt,
        }]
    }

    fn fall_back(&mut self) -> Vec<ClientAction> {
        let mut actions = vec![
            ClientAction::Cancel(self.retransmit_timer()),
            ClientAction::Cancel(self.timeout_timer()),
        ];
        if let Some(candidate) = self.candidates.get(self.cursor).cloned() {
            actions.push(ClientAction::Release { candidate });
        }
        actions.extend(self.try_candidate(self.cursor + 1));
        actions
    }

    fn send_request(&mut self) -> Vec<ClientAction> {
        let Some(transport) = self.candidates.get(self.cursor).map(|c| c.transport) else {
            return self.finish(Outcome::ServiceUnavailable);
        };
        set_via_transport(&mut self.request.headers, transport);
        let bytes = serialize_request(&self.request);
        self.last_request = Some(bytes.clone());

        let timers = TransportAwareTimers::with_defaults(transport, self.defaults);
        self.timers = Some(timers);
        self.state = ClientState::AwaitingResponse;

        let retransmit = self.retransmit_timer();
        self.interval = timers.duration(retransmit);
        let mut actions = vec![ClientAction::Transmit {
            bytes,
            retransmit: false,
        }];
        if !self.interval.is_zero() {
            actions.push(ClientAction::Schedule {
                timer: retransmit,
                duration: self.interval,
            });
        }
        let timeout = self.timeout_timer();
        actions.push(ClientAction::Schedule {
            timer: timeout,
            duration: timers.duration(timeout),
        });
        actions
    }

    fn handle_response(&mut self, state: ClientState, response: Response) -> Vec<ClientAction> {
        if response.is_provisional() {
            // A provisional seen while attempting belongs to a transport that
            // already failed; the request has not reached the current candidate.
            return match state {
                ClientState::AwaitingResponse | ClientState::Proceeding => {
                    self.handle_provisional()
                }
                _ => Vec::new(),
            };
        }

        if state == ClientState::Completed {
            // Retransmitted final response; repeat the ACK if there was one.
            return match &self.ack {
                Some(ack) => vec![ClientAction::Transmit {
                    bytes: ack.clone(),
                    retransmit: true,
                }],
                None => Vec::new(),
            };
        }

        let mut actions = vec![
            ClientAction::Cancel(self.retransmit_timer()),
            ClientAction::Cancel(self.timeout_timer()),
        ];

        if self.is_invite() && response.is_success() {
            // The ACK for 2xx belongs to the dialog, not the transaction.
            self.state = ClientState::Terminated;
            actions.push(ClientAction::Complete(Outcome::Final(response)));
            actions.push(ClientAction::Terminate);
            return actions;
        }

        let wait_timer = if self.is_invite() {
            let ack = serialize_request(&self.build_ack(&response));
            self.ack = Some(ack.clone());
            actions.push(ClientAction::Transmit {
                bytes: ack,
                retransmit: false,
            });
            TransactionTimer::D
        } else {
            TransactionTimer::K
        };

        self.state = ClientState::Completed;
        actions.push(ClientAction::Complete(Outcome::Final(response)));
        let wait = self
            .timers
            .map(|timers| timers.duration(wait_timer))
            .unwrap_or_default();
        if wait.is_zero() {
            self.state = ClientState::Terminated;
            actions.push(ClientAction::Terminate);
        } else {
            actions.push(ClientAction::Schedule {
                timer: wait_timer,
                duration: wait,
            });
        }
        actions
    }

    fn handle_provisional(&mut self) -> Vec<ClientAction> {
        self.state = ClientState::Proceeding;
        if self.is_invite() {
            vec![ClientAction::Cancel(TransactionTimer::A)]
        } else {
            if let Some(timers) = self.timers {
                self.interval = timers.proceeding_interval();
            }
            Vec::new()
        }
    }

    fn handle_timer(&mut self, timer: TransactionTimer) -> Vec<ClientAction> {
        use ClientState::*;
        match (self.state, timer) {
            (AwaitingResponse, TransactionTimer::A) => {
                if let Some(timers) = self.timers {
                    self.interval = timers.next_invite_interval(self.interval);
                }
                self.retransmit(TransactionTimer::A)
            }
            (AwaitingResponse, TransactionTimer::E) => {
                if let Some(timers) = self.timers {
                    self.interval = timers.next_non_invite_interval(self.interval);
                }
                self.retransmit(TransactionTimer::E)
            }
            (Proceeding, TransactionTimer::E) => self.retransmit(TransactionTimer::E),
            (AwaitingResponse | Proceeding, TransactionTimer::B | TransactionTimer::F) => {
                self.finish(Outcome::TimedOut { status: 408 })
            }
            (Completed, TransactionTimer::D | TransactionTimer::K) => {
                self.state = Terminated;
                vec![ClientAction::Terminate]
            }
            _ => Vec::new(),
        }
    }

    fn retransmit(&mut self, timer: TransactionTimer) -> Vec<ClientAction> {
        let Some(bytes) = self.last_request.clone() else {
            return Vec::new();
        };
        vec![
            ClientAction::Transmit {
                bytes,
                retransmit: true,
            },
            ClientAction::Schedule {
                timer,
                duration: self.interval,
            },
        ]
    }

    /// Moves straight to `Terminated` with `outcome`.
    fn finish(&mut self, outcome: Outcome) -> Vec<ClientAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.state = ClientState::Terminated;
        vec![
            ClientAction::Cancel(self.retransmit_timer()),
            ClientAction::Cancel(self.timeout_timer()),
            ClientAction::Complete(outcome),
            ClientAction::Terminate,
        ]
    }

    /// ACK for a non-2xx final response (RFC 3261 §17.1.1.3).
    fn build_ack(&self, response: &Response) -> Request {
        let to = response
            .headers
            .get("To")
            .or_else(|| self.request.headers.get("To"));
        self.build_hop_request(Method::Ack, to)
    }

    /// CANCEL for the pending INVITE (RFC 3261 §9.1).
    fn build_cancel(&self) -> Request {
        self.build_hop_request(Method::Cancel, self.request.headers.get("To"))
    }

    fn build_hop_request(&self, method: Method, to: Option<&SmolStr>) -> Request {
        let original = &self.request.headers;
        let mut headers = Headers::new();
        if let Some(via) = top_via(original) {
            headers.push("Via", via);
        }
        if let Some(max_forwards) = original.get("Max-Forwards") {
            headers.push("Max-Forwards", max_forwards.clone());
        }
        for route in original.get_all("Route") {
            headers.push("Route", route.clone());
        }
        if let Some(from) = original.get("From") {
            headers.push("From", from.clone());
        }
        if let Some(to) = to {
            headers.push("To", to.clone());
        }
        if let Some(call_id) = original.get("Call-ID") {
            headers.push("Call-ID", call_id.clone());
        }
        let seq = original
            .get("CSeq")
            .and_then(|cseq| cseq.split_whitespace().next())
            .unwrap_or("1");
        headers.push("CSeq", format!("{seq} {}", method.as_str()));
        Request::new(
            RequestLine::new(method, self.request.start.uri.clone()),
            headers,
            Bytes::new(),
        )
    }
}

/// Rewrites the transport token of the top Via (`SIP/2.0/UDP` -> `SIP/2.0/TCP`).
pub fn set_via_transport(headers: &mut Headers, transport: TransportKind) {
    let Some(via) = headers.get_mut("Via") else {
        return;
    };
    let Some((protocol, rest)) = via.split_once(char::is_whitespace) else {
        return;
    };
    let Some(prefix_len) = protocol.rfind('/') else {
        return;
    };
    let updated = format!(
        "{}{} {}",
        &protocol[..=prefix_len],
        transport.via_transport(),
        rest.trim_start()
    );
    *via = SmolStr::new(updated);
}
