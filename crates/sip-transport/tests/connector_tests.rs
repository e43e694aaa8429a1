// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use sip_transport::{Candidate, ConnectError, Connector, TokioConnector, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;

const REQUEST: &[u8] = b"OPTIONS sip:far.example.org SIP/2.0\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
const RESPONSE: &[u8] = b"SIP/2.0 200 OK\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";

fn candidate(transport: TransportKind, addr: SocketAddr) -> Candidate {
    Candidate::new(transport, addr, "far.example.org")
}

#[tokio::test]
async fn tcp_connect_to_closed_port_is_refused() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, _rx) = mpsc::channel(8);
    let connector = TokioConnector::new(tx);
    let err = connector
        .connect(&candidate(TransportKind::Tcp, addr))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::Refused(addr));
}

#[tokio::test]
async fn tcp_connection_writes_and_frames_replies() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut buf).await.unwrap();
        // Keep-alive first, then the response split across two writes.
        stream.write_all(b"\r\n\r\n").await.unwrap();
        stream.write_all(&RESPONSE[..10]).await.unwrap();
        stream.write_all(&RESPONSE[10..]).await.unwrap();
        buf
    });

    let (tx, mut rx) = mpsc::channel(8);
    let connector = TokioConnector::new(tx);
    let conn = connector
        .connect(&candidate(TransportKind::Tcp, addr))
        .await
        .expect("connect");
    conn.send(Bytes::from_static(REQUEST)).unwrap();

    let received = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(received, REQUEST);

    let packet = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet.transport, TransportKind::Tcp);
    assert_eq!(packet.peer, addr);
    assert_eq!(packet.payload.as_ref(), RESPONSE);
}

#[tokio::test]
async fn udp_connection_sends_datagrams_and_receives_replies() {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let connector = TokioConnector::new(tx);
    let local = connector.bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let conn = connector
        .connect(&candidate(TransportKind::Udp, addr))
        .await
        .expect("udp connect never fails");
    conn.send(Bytes::from_static(REQUEST)).unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], REQUEST);
    assert_eq!(from, local);

    server.send_to(RESPONSE, from).await.unwrap();
    let packet = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(packet.transport, TransportKind::Udp);
    assert_eq!(packet.peer, addr);
    assert_eq!(packet.payload.as_ref(), RESPONSE);
}

#[cfg(not(feature = "tls"))]
#[tokio::test]
async fn tls_without_feature_is_unsupported() {
    let (tx, _rx) = mpsc::channel(8);
    let connector = TokioConnector::new(tx);
    let addr: SocketAddr = "127.0.0.1:5061".parse().unwrap();
    let err = connector
        .connect(&candidate(TransportKind::Tls, addr))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::Unsupported(TransportKind::Tls));
}
