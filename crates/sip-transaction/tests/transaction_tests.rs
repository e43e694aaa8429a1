// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end agent scenarios against a scripted far end and an in-memory
//! DNS zone. Time is paused, so timer-driven paths run instantly.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use sip_core::{Method, SipUri};
use sip_dns::{SipResolver, StaticZone};
use sip_observe::{set_dispatch_metrics, CountingDispatchMetrics};
use sip_testkit::{
    as_bytes, build_invite, build_message, build_options, filler_body, response_for, Behaviour,
    FarEnd,
};
use sip_transaction::{
    branch_from_via, top_via, AgentConfig, Outcome, TransactionAgent, TransactionOptions,
};
use sip_transport::TransportKind;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::time::Instant;

const SERVER: &str = "192.0.2.10:5060";

fn metrics() -> &'static Arc<CountingDispatchMetrics> {
    static METRICS: OnceLock<Arc<CountingDispatchMetrics>> = OnceLock::new();
    METRICS.get_or_init(|| {
        let metrics = Arc::new(CountingDispatchMetrics::new());
        set_dispatch_metrics(metrics.clone());
        metrics
    })
}

/// `example.com` offering UDP and TCP through NAPTR and SRV, both landing
/// on 192.0.2.10:5060.
fn zone(udp_pref: u16, tcp_pref: u16) -> Arc<StaticZone> {
    let zone = Arc::new(StaticZone::new());
    zone.naptr("example.com", 10, udp_pref, "s", "SIP+D2U", "_sip._udp.example.com")
        .naptr("example.com", 10, tcp_pref, "s", "SIP+D2T", "_sip._tcp.example.com")
        .srv("_sip._udp.example.com", 0, 0, 5060, "sip.example.com")
        .srv("_sip._tcp.example.com", 0, 0, 5060, "sip.example.com")
        .address("sip.example.com", "192.0.2.10".parse().unwrap());
    zone
}

fn agent(zone: Arc<StaticZone>, far: &Arc<FarEnd>, config: AgentConfig) -> TransactionAgent {
    metrics();
    TransactionAgent::new(config, Arc::new(SipResolver::new(zone)), far.clone())
}

fn outcomes() -> (
    impl FnOnce(Outcome) + Send + 'static,
    mpsc::UnboundedReceiver<Outcome>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |outcome| {
            let _ = tx.send(outcome);
        },
        rx,
    )
}

fn server() -> std::net::SocketAddr {
    SERVER.parse().unwrap()
}

fn uri(s: &str) -> SipUri {
    SipUri::parse(s).unwrap()
}

#[tokio::test(start_paused = true)]
async fn small_message_goes_over_udp() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    let message = build_message("sip:bob@example.com", filler_body(200));
    agent
        .send_request(message, TransactionOptions::default(), on_result)
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Udp);
    assert_eq!(sent[0].peer, server());
    let req = sent[0].request().expect("request");
    assert!(top_via(&req.headers).unwrap().starts_with("SIP/2.0/UDP "));
    assert_eq!(req.body.len(), 200);

    agent.deliver_incoming(response_for(&req, 200));
    let outcome = results.recv().await.unwrap();
    assert_eq!(outcome.status(), 200);
    assert!(outcome.is_success());
    assert_eq!(far.connect_attempts(), vec![(TransportKind::Udp, server())]);
}

#[tokio::test(start_paused = true)]
async fn oversized_message_skips_udp() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    let message = build_message("sip:bob@example.com", filler_body(2048));
    agent
        .send_request(message, TransactionOptions::default(), on_result)
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Tcp);
    let req = sent[0].request().expect("request");
    assert!(top_via(&req.headers).unwrap().starts_with("SIP/2.0/TCP "));
    assert_eq!(far.connect_attempts(), vec![(TransportKind::Tcp, server())]);

    agent.deliver_incoming(response_for(&req, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
}

#[tokio::test(start_paused = true)]
async fn refused_tcp_falls_back_to_udp() {
    let before = metrics().get("fallback:tcp");
    let far = Arc::new(FarEnd::new());
    far.refuse(TransportKind::Tcp, SERVER);
    let agent = agent(zone(20, 10), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Udp);
    assert_eq!(
        far.connect_attempts(),
        vec![(TransportKind::Tcp, server()), (TransportKind::Udp, server())]
    );
    let req = sent[0].request().unwrap();
    assert!(top_via(&req.headers).unwrap().starts_with("SIP/2.0/UDP "));

    agent.deliver_incoming(response_for(&req, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
    assert!(metrics().get("fallback:tcp") > before);
}

#[tokio::test(start_paused = true)]
async fn hanging_tcp_connect_times_out_then_udp() {
    let far = Arc::new(FarEnd::new());
    far.hang(TransportKind::Tcp, SERVER);
    let agent = agent(zone(20, 10), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();
    let start = Instant::now();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Udp);
    assert!(start.elapsed() >= Duration::from_secs(4));

    agent.deliver_incoming(response_for(&sent[0].request().unwrap(), 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
}

#[tokio::test(start_paused = true)]
async fn tcp_only_server_with_udp_naptr_gets_oversized_request_over_tcp() {
    let far = Arc::new(FarEnd::new());
    // UDP is advertised but nothing listens.
    far.hang(TransportKind::Udp, SERVER);
    let agent = agent(zone(10, 10), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_message("sip:bob@example.com", filler_body(1500)),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Tcp);
    assert_eq!(far.connect_attempts(), vec![(TransportKind::Tcp, server())]);

    agent.deliver_incoming(response_for(&sent[0].request().unwrap(), 202));
    assert_eq!(results.recv().await.unwrap().status(), 202);
}

#[tokio::test(start_paused = true)]
async fn all_candidates_failing_yields_single_503() {
    let far = Arc::new(FarEnd::new());
    far.refuse(TransportKind::Udp, SERVER)
        .refuse(TransportKind::Tcp, SERVER);
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let outcome = results.recv().await.unwrap();
    assert!(matches!(outcome, Outcome::ServiceUnavailable));
    assert_eq!(outcome.status(), 503);
    assert_eq!(
        far.connect_attempts(),
        vec![(TransportKind::Udp, server()), (TransportKind::Tcp, server())]
    );

    tokio::time::sleep(Duration::from_secs(64)).await;
    assert!(results.try_recv().is_err());
    assert!(far.sent().is_empty());
    assert_eq!(agent.active_transactions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_udp_request_times_out_with_408() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();
    let start = Instant::now();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let outcome = results.recv().await.unwrap();
    assert!(matches!(outcome, Outcome::TimedOut { status: 408 }));
    assert_eq!(start.elapsed(), Duration::from_secs(32));

    // Initial send plus Timer E firings at 0.5, 1.5, 3.5, 7.5 and then
    // every 4s up to 31.5s.
    let sent = far.sent();
    assert_eq!(sent.len(), 11);
    assert!(sent.iter().all(|s| s.payload == sent[0].payload));
    assert_eq!(agent.active_transactions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn invite_failure_is_acked_and_retransmissions_absorbed() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_invite("sip:bob@example.com", "invite-486@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let invite = far.nth_request(1).await;
    agent.deliver_incoming(response_for(&invite, 180));
    let busy = response_for(&invite, 486);
    agent.deliver_incoming(busy.clone());

    let outcome = results.recv().await.unwrap();
    assert_eq!(outcome.status(), 486);
    assert_eq!(outcome.response().unwrap().code(), 486);

    let ack = far.nth_request(2).await;
    assert_eq!(ack.start.method, Method::Ack);
    assert_eq!(ack.start.uri, invite.start.uri);
    let invite_branch = branch_from_via(top_via(&invite.headers).unwrap()).unwrap();
    assert_eq!(
        branch_from_via(top_via(&ack.headers).unwrap()),
        Some(invite_branch)
    );
    assert_eq!(ack.headers.get("To"), busy.headers.get("To"));
    assert_eq!(ack.headers.get("CSeq").unwrap(), "1 ACK");

    // A retransmitted 486 is answered with the same ACK and nothing else.
    agent.deliver_incoming(busy);
    let third = far.nth_request(3).await;
    assert_eq!(third.start.method, Method::Ack);
    assert!(results.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(33)).await;
    assert_eq!(agent.active_transactions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn invite_success_terminates_without_ack() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_invite("sip:bob@example.com", "invite-200@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let invite = far.nth_request(1).await;
    agent.deliver_incoming(response_for(&invite, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
    assert_eq!(agent.active_transactions().await, 0);
    assert_eq!(far.sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelling_ringing_invite_sends_cancel() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    let handle = agent
        .send_request(
            build_invite("sip:bob@example.com", "invite-cancel@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    assert_eq!(handle.key().method, Method::Invite);

    let invite = far.nth_request(1).await;
    agent.deliver_incoming(response_for(&invite, 180));
    agent.cancel_transaction(&handle);

    let outcome = results.recv().await.unwrap();
    assert!(matches!(outcome, Outcome::Cancelled));
    assert_eq!(outcome.status(), 487);

    let cancel = far.nth_request(2).await;
    assert_eq!(cancel.start.method, Method::Cancel);
    assert_eq!(cancel.headers.get("CSeq").unwrap(), "1 CANCEL");
    assert_eq!(
        branch_from_via(top_via(&cancel.headers).unwrap()),
        Some(handle.key().branch.as_str())
    );

    // Late responses to the CANCEL and the INVITE change nothing.
    agent.deliver_incoming(response_for(&cancel, 200));
    agent.deliver_incoming(response_for(&invite, 487));
    assert_eq!(agent.active_transactions().await, 0);
    assert!(results.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn default_proxy_is_resolved_through_cname_chain() {
    let zone = Arc::new(StaticZone::new());
    zone.cname("proxy.example.net", "edge.example.net")
        .address("edge.example.net", "198.51.100.7".parse().unwrap());
    let far = Arc::new(FarEnd::new());
    let config = AgentConfig::default()
        .with_default_proxy(uri("sip:proxy.example.net"))
        .with_via_host("uac.example.org");
    let agent = agent(zone, &far, config);
    let (on_result, mut results) = outcomes();

    agent
        .create_transaction(Method::Options, uri("sip:bob@example.com"), Bytes::new(), on_result)
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Udp);
    assert_eq!(sent[0].peer, "198.51.100.7:5060".parse().unwrap());
    let req = sent[0].request().unwrap();
    assert_eq!(req.start.uri.as_str(), "sip:bob@example.com");
    assert_eq!(req.headers.get("To").unwrap(), "<sip:bob@example.com>");
    assert!(top_via(&req.headers).unwrap().contains("uac.example.org"));

    agent.deliver_incoming(response_for(&req, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
}

#[tokio::test(start_paused = true)]
async fn unmatched_responses_are_dropped() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    let req = far.nth_request(1).await;

    let before = metrics().get("unmatched:response");
    let mut stray = response_for(&req, 200);
    stray
        .headers
        .set("Via", "SIP/2.0/UDP elsewhere.invalid;branch=z9hG4bKstray");
    agent.deliver_incoming(stray);
    // Round trip through the agent so the stray has been handled.
    assert_eq!(agent.active_transactions().await, 1);
    assert!(results.try_recv().is_err());
    assert!(metrics().get("unmatched:response") > before);

    agent.deliver_incoming(response_for(&req, 404));
    assert_eq!(results.recv().await.unwrap().status(), 404);
}

#[tokio::test(start_paused = true)]
async fn connections_are_reused_between_transactions() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());

    for n in 1..=2 {
        let (on_result, mut results) = outcomes();
        agent
            .send_request(
                build_options("sip:bob@example.com"),
                TransactionOptions::default(),
                on_result,
            )
            .await
            .expect("create");
        let req = far.nth_request(n).await;
        agent.deliver_incoming(response_for(&req, 200));
        assert_eq!(results.recv().await.unwrap().status(), 200);
    }

    assert_eq!(far.connect_attempts().len(), 1);
    assert_eq!(agent.pool().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_swept_from_pool() {
    let far = Arc::new(FarEnd::new());
    let config = AgentConfig::default().with_pool_limits(100, Duration::from_secs(10));
    let agent = agent(zone(20, 10), &far, config);
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    let req = far.nth_request(1).await;
    assert_eq!(far.sent()[0].transport, TransportKind::Tcp);
    agent.deliver_incoming(response_for(&req, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(agent.pool().len(), 1);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(agent.pool().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transaction_limit_is_enforced() {
    let far = Arc::new(FarEnd::new());
    let config = AgentConfig::default().with_max_client_transactions(1);
    let agent = agent(zone(10, 20), &far, config);
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    let over = agent
        .send_request(
            build_options("sip:carol@example.com"),
            TransactionOptions::default(),
            |_| {},
        )
        .await;
    assert!(over.is_err());

    let req = far.nth_request(1).await;
    agent.deliver_incoming(response_for(&req, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);

    // The slot frees once Timer K has run.
    tokio::time::sleep(Duration::from_secs(6)).await;
    agent
        .send_request(
            build_options("sip:carol@example.com"),
            TransactionOptions::default(),
            |_| {},
        )
        .await
        .expect("slot free again");
}

#[tokio::test(start_paused = true)]
async fn unknown_host_is_unresolvable() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .create_transaction(
            Method::Options,
            uri("sip:nobody@unknown.invalid"),
            Bytes::new(),
            on_result,
        )
        .await
        .expect("create");

    let outcome = results.recv().await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Unresolvable {
            target: SmolStr::new("unknown.invalid")
        }
    );
    assert_eq!(outcome.status(), 503);
    assert!(far.connect_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_dns_is_bounded_by_dns_timeout() {
    let zone = zone(10, 20);
    zone.set_latency(Duration::from_secs(30));
    let far = Arc::new(FarEnd::new());
    let config = AgentConfig::default().with_dns_timeout(Duration::from_secs(2));
    let agent = agent(zone, &far, config);
    let (on_result, mut results) = outcomes();
    let start = Instant::now();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let outcome = results.recv().await.unwrap();
    assert!(matches!(outcome, Outcome::Unresolvable { .. }));
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn closed_connection_falls_back_to_next_candidate() {
    let far = Arc::new(FarEnd::new());
    far.reset(TransportKind::Tcp, SERVER);
    let agent = agent(zone(20, 10), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");

    let sent = far.wait_for_sent(1).await;
    assert_eq!(sent[0].transport, TransportKind::Udp);
    agent.deliver_incoming(response_for(&sent[0].request().unwrap(), 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
    // The dead TCP connection is not kept for reuse.
    assert_eq!(agent.pool().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn late_provisional_does_not_stall_fallback() {
    let far = Arc::new(FarEnd::new());
    far.set(
        TransportKind::Tcp,
        SERVER,
        Behaviour::Delay(Duration::from_secs(1)),
    );
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    let first = far.nth_request(1).await;
    assert_eq!(far.sent()[0].transport, TransportKind::Udp);

    // The UDP retransmission at 500ms fails and the agent moves to TCP, whose
    // connect takes a second. A 100 for the UDP send lands in between.
    far.close(TransportKind::Udp, SERVER);
    tokio::time::sleep(Duration::from_millis(700)).await;
    agent.deliver_incoming(response_for(&first, 100));

    let sent = far.wait_for_sent(2).await;
    assert_eq!(sent[1].transport, TransportKind::Tcp);
    let second = sent[1].request().unwrap();
    assert!(top_via(&second.headers).unwrap().starts_with("SIP/2.0/TCP "));

    agent.deliver_incoming(response_for(&second, 200));
    assert_eq!(results.recv().await.unwrap().status(), 200);
    assert_eq!(agent.active_transactions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn ack_and_cancel_cannot_start_transactions() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    for method in [Method::Ack, Method::Cancel] {
        let created = agent
            .create_transaction(method, uri("sip:bob@example.com"), Bytes::new(), |_| {})
            .await;
        assert!(created.is_err());
    }
    assert_eq!(agent.active_transactions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn inbound_bytes_are_parsed_and_routed() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    let req = far.nth_request(1).await;

    assert!(agent.deliver_bytes(Bytes::from_static(b"not sip at all")).is_err());
    agent
        .deliver_bytes(as_bytes(&build_options("sip:uac@example.org")))
        .expect("requests are ignored");
    agent
        .deliver_bytes(sip_testkit::response_as_bytes(&response_for(&req, 200)))
        .expect("response");
    assert_eq!(results.recv().await.unwrap().status(), 200);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_transactions() {
    let far = Arc::new(FarEnd::new());
    let agent = agent(zone(10, 20), &far, AgentConfig::default());
    let (on_result, mut results) = outcomes();

    agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            on_result,
        )
        .await
        .expect("create");
    far.wait_for_sent(1).await;

    agent.shutdown().await;
    assert!(matches!(results.recv().await.unwrap(), Outcome::Cancelled));

    let after = agent
        .send_request(
            build_options("sip:bob@example.com"),
            TransactionOptions::default(),
            |_| {},
        )
        .await;
    assert!(after.is_err());
}
