// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire codec for SIP messages.
//!
//! Parsing is deliberately shallow: start line, header fields (with folding
//! and compact names) and a `Content-Length`-bounded body. Serialization
//! always recomputes `Content-Length` and inserts `Max-Forwards` on requests
//! that lack one, so the byte length returned here is the size the transport
//! selector compares against the path MTU.

use std::fmt::Write;

use bytes::{Bytes, BytesMut};
use memchr::memmem;
use sip_core::{
    Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, StatusLine, SIP_VERSION,
};
use smol_str::SmolStr;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_FORWARDS: u32 = 70;

/// Parses a SIP request from raw network bytes.
pub fn parse_request(data: &Bytes) -> Option<Request> {
    match parse_message(data)? {
        SipMessage::Request(req) => Some(req),
        SipMessage::Response(_) => None,
    }
}

/// Parses a SIP response from raw network bytes.
pub fn parse_response(data: &Bytes) -> Option<Response> {
    match parse_message(data)? {
        SipMessage::Response(res) => Some(res),
        SipMessage::Request(_) => None,
    }
}

/// Parses either a request or a response, deciding on the start line.
pub fn parse_message(data: &Bytes) -> Option<SipMessage> {
    if data.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    let (head, body_bytes) = split_head_body(data)?;
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    if first.is_empty() {
        return None;
    }

    let is_response = first
        .get(..SIP_VERSION.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(SIP_VERSION));
    if is_response {
        let status = parse_status_line(first)?;
        let headers = parse_headers(lines)?;
        let body = extract_body(body_bytes, &headers)?;
        Some(SipMessage::Response(Response::new(status, headers, body)))
    } else {
        let (method, uri) = parse_request_line(first)?;
        let headers = parse_headers(lines)?;
        if !cseq_matches(&headers, &method)? {
            return None;
        }
        let body = extract_body(body_bytes, &headers)?;
        Some(SipMessage::Request(Request::new(
            RequestLine::new(method, uri),
            headers,
            body,
        )))
    }
}

/// Serializes a SIP request, normalising `Content-Length` and defaulting `Max-Forwards`.
pub fn serialize_request(req: &Request) -> Bytes {
    let mut buf = String::with_capacity(256);
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.start.method.as_str(),
        req.start.uri.as_str(),
        SIP_VERSION
    );

    let mut has_max_forwards = false;
    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if header.name.eq_ignore_ascii_case("Max-Forwards") {
            has_max_forwards = true;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    if !has_max_forwards {
        let _ = write!(buf, "Max-Forwards: {}\r\n", DEFAULT_MAX_FORWARDS);
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", req.body.len());

    let mut out = BytesMut::with_capacity(buf.len() + req.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(&req.body);
    out.freeze()
}

/// Serializes a SIP response, normalising `Content-Length`.
pub fn serialize_response(res: &Response) -> Bytes {
    let mut buf = String::with_capacity(256);
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        SIP_VERSION, res.start.code, res.start.reason
    );
    for header in res.headers.iter() {
        if header.name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n\r\n", res.body.len());

    let mut out = BytesMut::with_capacity(buf.len() + res.body.len());
    out.extend_from_slice(buf.as_bytes());
    out.extend_from_slice(&res.body);
    out.freeze()
}

/// Returns the first header value matching `name`, accepting compact forms.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a SmolStr> {
    headers
        .get(name)
        .or_else(|| headers.get(canonical_header_name(name).as_str()))
}

fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(|c: char| !c.is_whitespace()),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line).ok()?;

    if !version_token.trim().eq_ignore_ascii_case(SIP_VERSION) {
        return None;
    }
    Some((Method::from_token(method_token), SipUri::parse(uri_token)?))
}

fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space0, space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>(SIP_VERSION),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space0::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line).ok()?;
    if !(100..=699).contains(&code) {
        return None;
    }
    Some(StatusLine::new(code, reason.trim()))
}

/// Splits raw bytes at the blank line separating headers from body.
fn split_head_body(data: &[u8]) -> Option<(&str, &[u8])> {
    match memmem::find(data, b"\r\n\r\n") {
        Some(pos) => Some((std::str::from_utf8(&data[..pos]).ok()?, &data[pos + 4..])),
        None => Some((std::str::from_utf8(data).ok()?, &[])),
    }
}

/// Parses header lines, joining folded continuations (RFC 3261 §7.3.1).
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    let mut current: Option<(SmolStr, String)> = None;

    for line in lines.into_iter().filter(|l| !l.is_empty()) {
        if line.starts_with(' ') || line.starts_with('\t') {
            let (_, value) = current.as_mut()?;
            let folded = line.trim();
            if !folded.is_empty() {
                value.push(' ');
                value.push_str(folded);
            }
            continue;
        }

        let (name, value) = line.split_once(':')?;
        if let Some((prev_name, prev_value)) = current.take() {
            headers.push(prev_name, prev_value.trim());
        }
        current = Some((canonical_header_name(name.trim()), value.trim().to_owned()));
    }

    if let Some((name, value)) = current {
        headers.push(name, value.trim());
    }
    Some(headers)
}

fn canonical_header_name(name: &str) -> SmolStr {
    let canonical = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "v" => "Via",
        "k" => "Supported",
        _ => return SmolStr::new(name),
    };
    SmolStr::new(canonical)
}

/// Body truncated to the declared `Content-Length`, or `None` if shorter.
fn extract_body(body_bytes: &[u8], headers: &Headers) -> Option<Bytes> {
    let declared = headers
        .get("Content-Length")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(body_bytes.len());
    if declared > body_bytes.len() {
        return None;
    }
    Some(Bytes::copy_from_slice(&body_bytes[..declared]))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '%' | '\'' | '*' | '+' | '-' | '.' | '^' | '_' | '`' | '~'
        )
}

fn cseq_matches(headers: &Headers, method: &Method) -> Option<bool> {
    let Some(cseq) = headers.get("CSeq") else {
        return Some(true);
    };
    let mut parts = cseq.split_whitespace();
    parts.next()?.parse::<u32>().ok()?;
    Some(parts.next().map(Method::from_token).as_ref() == Some(method))
}
