// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types shared by the client-transaction dispatcher.
//!
//! - **Messages**: [`Request`], [`Response`], [`SipMessage`]
//! - **Start lines**: [`RequestLine`], [`StatusLine`]
//! - **Addressing**: [`SipUri`]
//! - **Headers**: [`Headers`], [`Header`]
//!
//! Header values are kept as raw text; only the fields the transaction layer
//! correlates on (Via branch, CSeq) are ever interpreted, and that happens in
//! `sip-transaction`.

pub mod headers;
pub mod method;
pub mod msg;
pub mod uri;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    default_reason, Request, RequestLine, Response, SipMessage, StatusLine, SIP_VERSION,
};
pub use uri::{InvalidUri, SipUri, SIPS_DEFAULT_PORT, SIP_DEFAULT_PORT};
