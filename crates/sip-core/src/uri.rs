// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Default port for `sip:` URIs (RFC 3261 §19.1.2).
pub const SIP_DEFAULT_PORT: u16 = 5060;
/// Default port for `sips:` URIs.
pub const SIPS_DEFAULT_PORT: u16 = 5061;

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19).
///
/// Only the parts the dispatcher routes on are broken out: scheme, user,
/// host, port and URI parameters. The original text is kept in `raw` and is
/// what goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub raw: SmolStr,
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl SipUri {
    /// Attempts to parse a SIP or SIPS URI. Headers after `?` are ignored.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (scheme, rest) = input.split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let addr_part = rest.split_once('?').map_or(rest, |(addr, _)| addr);
        let mut segments = addr_part.split(';');
        let base = segments.next()?.trim();

        let mut params = BTreeMap::new();
        for param in segments.map(str::trim).filter(|p| !p.is_empty()) {
            match param.split_once('=') {
                Some((k, v)) => {
                    params.insert(
                        SmolStr::new(k.trim().to_ascii_lowercase()),
                        Some(SmolStr::new(v.trim())),
                    );
                }
                None => {
                    params.insert(SmolStr::new(param.to_ascii_lowercase()), None);
                }
            }
        }

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => (
                percent_decode_str(user)
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref())),
                host,
            ),
            None => (None, base),
        };
        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return None;
        }

        Some(Self {
            raw: SmolStr::new(input),
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
        })
    }

    /// Returns the original textual representation of the URI.
    pub fn as_str(&self) -> &str {
        self.raw.as_str()
    }

    /// Looks up a URI parameter by (lowercase) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .and_then(|value| value.as_ref())
            .map(SmolStr::as_str)
    }

    /// Value of the `transport=` parameter, lowercased.
    pub fn transport_param(&self) -> Option<SmolStr> {
        self.param("transport")
            .map(|t| SmolStr::new(t.to_ascii_lowercase()))
    }

    /// Port to use when the URI carries none.
    pub fn default_port(&self) -> u16 {
        if self.sips {
            SIPS_DEFAULT_PORT
        } else {
            SIP_DEFAULT_PORT
        }
    }

    /// Explicit port or the scheme default.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or_else(|| self.default_port())
    }

    /// Returns the host as an IP address when it is a numeric literal.
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl FromStr for SipUri {
    type Err = InvalidUri;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SipUri::parse(s).ok_or_else(|| InvalidUri(s.to_owned()))
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`SipUri::from_str`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidUri(pub String);

impl fmt::Display for InvalidUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid SIP URI: {}", self.0)
    }
}

impl std::error::Error for InvalidUri {}

/// Splits `host[:port]` or `[v6]:port`.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        match &stripped[end + 1..] {
            "" => Some((host, None)),
            rest => Some((host, Some(rest.strip_prefix(':')?.parse().ok()?))),
        }
    } else {
        match input.split_once(':') {
            // Bare IPv6 must be bracketed.
            Some((_, port)) if port.contains(':') => None,
            Some((host, port)) => Some((host, Some(port.parse().ok()?))),
            None => Some((input, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_host_port_and_params() {
        let uri = SipUri::parse("sip:alice@Example.COM:5070;transport=TCP;lr").unwrap();
        assert!(!uri.sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.transport_param().as_deref(), Some("tcp"));
        assert!(uri.params.contains_key("lr"));
    }

    #[test]
    fn sips_defaults_to_5061() {
        let uri = SipUri::parse("sips:bob@example.org").unwrap();
        assert!(uri.sips);
        assert_eq!(uri.port_or_default(), 5061);
    }

    #[test]
    fn bracketed_ipv6_host_is_numeric() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5062").unwrap();
        assert_eq!(uri.port, Some(5062));
        assert!(uri.host_ip().unwrap().is_ipv6());
    }

    #[test]
    fn rejects_unbracketed_ipv6_host() {
        assert!(SipUri::parse("sip:2001:db8::1").is_none());
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(SipUri::parse("tel:+15551234567").is_none());
        assert!("http://example.com".parse::<SipUri>().is_err());
    }
}
