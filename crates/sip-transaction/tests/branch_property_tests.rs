// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashSet;

use bytes::Bytes;
use proptest::prelude::*;
use sip_core::{Headers, Method, Response, StatusLine};
use sip_transaction::{branch_from_via, generate_branch_id, top_via, TransactionKey, BRANCH_MAGIC_COOKIE};

fn response(vias: &[String], cseq: &str) -> Response {
    let mut headers = Headers::new();
    for via in vias {
        headers.push("Via", via.clone());
    }
    headers.push("CSeq", cseq);
    Response::new(StatusLine::new(200, "OK"), headers, Bytes::new())
}

proptest! {
    /// Generated branch IDs always carry the magic cookie.
    #[test]
    fn generated_branch_has_magic_cookie(_iteration in 0..100) {
        let branch = generate_branch_id();
        prop_assert!(branch.starts_with(BRANCH_MAGIC_COOKIE), "Branch: {}", branch);
        prop_assert!(branch.len() > BRANCH_MAGIC_COOKIE.len(), "Branch too short: {}", branch);
    }

    #[test]
    fn branch_extraction_from_via(
        host in "[a-z]{3,10}",
        branch_suffix in "[a-zA-Z0-9]{8,16}"
    ) {
        let branch = format!("z9hG4bK{}", branch_suffix);
        let via = format!("SIP/2.0/UDP {};branch={}", host, branch);
        prop_assert_eq!(branch_from_via(&via), Some(branch.as_str()));
    }

    #[test]
    fn branch_with_multiple_params(
        host in "[a-z]{3,10}",
        branch_suffix in "[a-zA-Z0-9]{8}",
        received in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}",
        rport in 1024u16..65535,
    ) {
        let branch = format!("z9hG4bK{}", branch_suffix);
        let via = format!(
            "SIP/2.0/UDP {};rport={};branch={};received={}",
            host, rport, branch, received
        );
        prop_assert_eq!(branch_from_via(&via), Some(branch.as_str()));
    }

    #[test]
    fn branch_param_case_insensitive(
        branch_suffix in "[a-zA-Z0-9]{8}",
        case_variant in 0u8..4,
    ) {
        let branch = format!("z9hG4bK{}", branch_suffix);
        let param_name = match case_variant {
            0 => "branch",
            1 => "Branch",
            2 => "BRANCH",
            _ => "BrAnCh",
        };
        let via = format!("SIP/2.0/UDP host;{}={}", param_name, branch);
        prop_assert_eq!(branch_from_via(&via), Some(branch.as_str()));
    }

    /// Responses correlate on the top Via only, whether the Vias arrive as
    /// separate headers or comma-joined.
    #[test]
    fn response_key_uses_top_via(
        ours in "[a-zA-Z0-9]{8,16}",
        theirs in "[a-zA-Z0-9]{8,16}",
        joined in any::<bool>(),
    ) {
        let top = format!("SIP/2.0/UDP uac.invalid;branch=z9hG4bK{}", ours);
        let lower = format!("SIP/2.0/TCP proxy.invalid;branch=z9hG4bK{}", theirs);
        let vias = if joined {
            vec![format!("{}, {}", top, lower)]
        } else {
            vec![top, lower]
        };
        let res = response(&vias, "7 MESSAGE");
        let key = TransactionKey::from_response(&res).unwrap();
        prop_assert_eq!(key.branch.as_str(), format!("z9hG4bK{}", ours));
        prop_assert_eq!(key.method, Method::Message);
    }
}

#[test]
fn branch_from_via_without_branch_param() {
    let via = "SIP/2.0/UDP host.example.com:5060";
    assert_eq!(branch_from_via(via), None);
}

#[test]
fn branch_from_via_with_empty_branch() {
    assert_eq!(branch_from_via("SIP/2.0/UDP host;branch="), Some(""));
}

#[test]
fn top_via_ignores_later_entries() {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP a.invalid;branch=z9hG4bKa , SIP/2.0/UDP b.invalid;branch=z9hG4bKb");
    assert_eq!(top_via(&headers), Some("SIP/2.0/UDP a.invalid;branch=z9hG4bKa"));
}

#[test]
fn branch_generation_uniqueness() {
    let mut branches = HashSet::new();
    for _ in 0..1000 {
        let branch = generate_branch_id();
        assert!(
            branches.insert(branch.to_string()),
            "Generated duplicate branch"
        );
    }
}
