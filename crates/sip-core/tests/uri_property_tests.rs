// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use proptest::prelude::*;
use sip_core::SipUri;

proptest! {
    /// Host, user, port and scheme survive parsing.
    #[test]
    fn uri_components_parse(
        scheme in prop::bool::ANY,
        user in proptest::option::of("[a-z0-9]{1,8}"),
        host in "[a-z0-9][a-z0-9\\-]{0,10}(\\.[a-z]{2,4})?",
        port in proptest::option::of(1024u16..65535),
    ) {
        let scheme_str = if scheme { "sips" } else { "sip" };
        let user_part = user.as_ref().map(|u| format!("{}@", u)).unwrap_or_default();
        let port_part = port.map(|p| format!(":{}", p)).unwrap_or_default();
        let uri_str = format!("{}:{}{}{}", scheme_str, user_part, host, port_part);

        let uri = SipUri::parse(&uri_str);
        prop_assert!(uri.is_some(), "Failed to parse: {}", uri_str);
        let uri = uri.unwrap();

        prop_assert_eq!(uri.sips, scheme);
        prop_assert_eq!(uri.user.as_deref(), user.as_deref());
        prop_assert_eq!(uri.host.as_str(), host.as_str());
        prop_assert_eq!(uri.port, port);
        prop_assert_eq!(uri.as_str(), uri_str.as_str());
    }

    /// The transport parameter is normalised to lowercase.
    #[test]
    fn transport_param_is_lowercased(
        host in "[a-z]{2,8}",
        transport in prop::sample::select(vec!["udp", "UDP", "tcp", "Tcp", "tls"]),
    ) {
        let uri = SipUri::parse(&format!("sip:{};transport={}", host, transport)).unwrap();
        let lower = transport.to_ascii_lowercase();
        let transport_param = uri.transport_param();
        prop_assert_eq!(transport_param.as_deref(), Some(lower.as_str()));
    }

    /// Dotted-quad hosts are recognised as numeric.
    #[test]
    fn ipv4_hosts_are_numeric(a in 1u8..=254, b: u8, c: u8, d in 1u8..=254) {
        let uri = SipUri::parse(&format!("sip:{}.{}.{}.{}", a, b, c, d)).unwrap();
        prop_assert!(uri.host_ip().is_some());
    }
}
