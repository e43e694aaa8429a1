// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sip_observe::{dispatch_metrics, span_with_transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{debug, error, warn, Instrument};

use crate::{
    drain_sip_frames, Candidate, ConnectError, Connection, Connector, InboundPacket,
    TransportKind, MAX_BUFFER_SIZE,
};

const WRITER_QUEUE: usize = 64;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

/// [`Connector`] backed by tokio sockets.
///
/// UDP traffic shares one unconnected socket per address family; every
/// datagram received on it is forwarded to the inbound channel. Each TCP or
/// TLS connection gets a writer task and a reader task that frames messages
/// onto the same channel.
pub struct TokioConnector {
    inbound: mpsc::Sender<InboundPacket>,
    udp_v4: OnceCell<Arc<UdpSocket>>,
    udp_v6: OnceCell<Arc<UdpSocket>>,
    connect_timeout: Duration,
    #[cfg(feature = "tls")]
    tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl TokioConnector {
    pub fn new(inbound: mpsc::Sender<InboundPacket>) -> Self {
        Self {
            inbound,
            udp_v4: OnceCell::new(),
            udp_v6: OnceCell::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enables TLS candidates using the given rustls client configuration.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<tokio_rustls::rustls::ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Binds the shared UDP socket explicitly instead of on first use.
    /// Returns the local address actually bound.
    pub async fn bind_udp(&self, local: SocketAddr) -> anyhow::Result<SocketAddr> {
        let cell = if local.is_ipv4() {
            &self.udp_v4
        } else {
            &self.udp_v6
        };
        let socket = cell
            .get_or_try_init(|| self.open_udp(local))
            .await?;
        Ok(socket.local_addr()?)
    }

    async fn open_udp(&self, local: SocketAddr) -> io::Result<Arc<UdpSocket>> {
        let socket = Arc::new(UdpSocket::bind(local).await?);
        debug!(bind = %socket.local_addr()?, "udp socket bound");
        tokio::spawn(
            run_udp(socket.clone(), self.inbound.clone())
                .instrument(span_with_transport("udp_recv", TransportKind::Udp.as_str())),
        );
        Ok(socket)
    }

    async fn udp_socket(&self, peer: SocketAddr) -> Result<Arc<UdpSocket>, ConnectError> {
        let (cell, any) = if peer.is_ipv4() {
            (&self.udp_v4, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        } else {
            (&self.udp_v6, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        };
        cell.get_or_try_init(|| self.open_udp(SocketAddr::new(any, 0)))
            .await
            .cloned()
            .map_err(|e| ConnectError::Io(e.to_string()))
    }

    async fn connect_udp(&self, candidate: &Candidate) -> Result<Connection, ConnectError> {
        let socket = self.udp_socket(candidate.addr).await?;
        let peer = candidate.addr;
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
        tokio::spawn(async move {
            while let Some(buf) = rx.recv().await {
                if let Err(e) = socket.send_to(&buf, peer).await {
                    warn!(%peer, error = %e, "udp send_to failed");
                    dispatch_metrics().on_error(TransportKind::Udp.as_str(), "write");
                    break;
                }
            }
        });
        Ok(Connection::new(TransportKind::Udp, peer, tx))
    }

    async fn open_tcp(&self, addr: SocketAddr) -> Result<TcpStream, ConnectError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(classify_io_error(addr, e)),
            Err(_) => Err(ConnectError::TimedOut(addr)),
        }
    }

    async fn connect_tcp(&self, candidate: &Candidate) -> Result<Connection, ConnectError> {
        let stream = self.open_tcp(candidate.addr).await?;
        let writer = spawn_stream_session(
            candidate.addr,
            stream,
            TransportKind::Tcp,
            self.inbound.clone(),
        );
        Ok(Connection::new(TransportKind::Tcp, candidate.addr, writer))
    }

    #[cfg(feature = "tls")]
    async fn connect_tls(&self, candidate: &Candidate) -> Result<Connection, ConnectError> {
        use tokio_rustls::rustls::pki_types::ServerName;
        use tokio_rustls::TlsConnector;

        let Some(config) = self.tls.clone() else {
            return Err(ConnectError::Unsupported(TransportKind::Tls));
        };
        let server_name = ServerName::try_from(candidate.host.to_string())
            .map_err(|_| ConnectError::Io(format!("invalid TLS server name {}", candidate.host)))?;
        let stream = self.open_tcp(candidate.addr).await?;
        let handshake = TlsConnector::from(config).connect(server_name, stream);
        let tls_stream = match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ConnectError::Io(format!("tls handshake: {e}"))),
            Err(_) => return Err(ConnectError::TimedOut(candidate.addr)),
        };
        let writer = spawn_stream_session(
            candidate.addr,
            tls_stream,
            TransportKind::Tls,
            self.inbound.clone(),
        );
        Ok(Connection::new(TransportKind::Tls, candidate.addr, writer))
    }

    #[cfg(not(feature = "tls"))]
    async fn connect_tls(&self, _candidate: &Candidate) -> Result<Connection, ConnectError> {
        Err(ConnectError::Unsupported(TransportKind::Tls))
    }
}

#[async_trait]
impl Connector for TokioConnector {
    async fn connect(&self, candidate: &Candidate) -> Result<Connection, ConnectError> {
        let transport = candidate.transport;
        let result = match transport {
            TransportKind::Udp => self.connect_udp(candidate).await,
            TransportKind::Tcp => self.connect_tcp(candidate).await,
            TransportKind::Tls => self.connect_tls(candidate).await,
        };
        match &result {
            Ok(_) => dispatch_metrics().on_connect(transport.as_str()),
            Err(e) => {
                dispatch_metrics().on_error(transport.as_str(), e.stage());
                debug!(%candidate, error = %e, "connect failed");
            }
        }
        result
    }
}

fn classify_io_error(addr: SocketAddr, err: io::Error) -> ConnectError {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ConnectError::Refused(addr),
        io::ErrorKind::TimedOut => ConnectError::TimedOut(addr),
        _ => ConnectError::Io(err.to_string()),
    }
}

/// Receive loop for a shared UDP socket.
async fn run_udp(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) {
    let mut buf = vec![0u8; 65_535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                dispatch_metrics().on_packet_received(TransportKind::Udp.as_str());
                let packet = InboundPacket {
                    transport: TransportKind::Udp,
                    peer,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(packet).await.is_err() {
                    debug!("inbound receiver dropped; stopping udp loop");
                    break;
                }
            }
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms.
                debug!(error = %e, "udp recv_from error");
                dispatch_metrics().on_error(TransportKind::Udp.as_str(), "read");
            }
        }
    }
}

/// Spawns writer and reader tasks for an established stream and returns the
/// writer queue. Either side finishing tears the other down.
fn spawn_stream_session<S>(
    peer: SocketAddr,
    stream: S,
    transport: TransportKind,
    inbound: mpsc::Sender<InboundPacket>,
) -> mpsc::Sender<Bytes>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE);
    let (reader_done_tx, mut reader_done_rx) = oneshot::channel::<()>();
    let (writer_done_tx, mut writer_done_rx) = oneshot::channel::<()>();

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    next = writer_rx.recv() => {
                        let Some(buf) = next else { break };
                        if let Err(e) = writer.write_all(&buf).await {
                            warn!(%peer, error = %e, "stream write failed");
                            dispatch_metrics().on_error(transport.as_str(), "write");
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    _ = &mut reader_done_rx => break,
                }
            }
            let _ = writer.shutdown().await;
            drop(writer_done_tx);
        }
        .instrument(span_with_transport("stream_write", transport.as_str())),
    );

    tokio::spawn(
        async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                if buf.len() >= MAX_BUFFER_SIZE {
                    error!(%peer, size = buf.len(), "unframed data exceeds buffer limit, closing");
                    dispatch_metrics().on_error(transport.as_str(), "framing");
                    break;
                }
                tokio::select! {
                    read = reader.read_buf(&mut buf) => match read {
                        Ok(0) => {
                            debug!(%peer, "connection closed by peer");
                            break;
                        }
                        Ok(_) => {
                            let frames = match drain_sip_frames(&mut buf) {
                                Ok(frames) => frames,
                                Err(e) => {
                                    error!(%peer, error = %e, "unframeable stream data, closing");
                                    dispatch_metrics().on_error(transport.as_str(), "framing");
                                    break;
                                }
                            };
                            for payload in frames {
                                dispatch_metrics().on_packet_received(transport.as_str());
                                let packet = InboundPacket { transport, peer, payload };
                                if inbound.send(packet).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            warn!(%peer, error = %e, "stream read failed");
                            dispatch_metrics().on_error(transport.as_str(), "read");
                            break;
                        }
                    },
                    _ = &mut writer_done_rx => break,
                }
            }
            drop(reader_done_tx);
        }
        .instrument(span_with_transport("stream_read", transport.as_str())),
    );

    writer_tx
}
