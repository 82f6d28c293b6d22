use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::{Duration, SystemTime},
};

use quinn::{Connection, RecvStream, SendStream};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tokio::runtime::Runtime;
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{wrong_side, Transport};
use crate::{config::QuicConfig, protocol::wire::MAX_FRAME_LEN, Error, Rank, CONTROLLER};

/// Name in the controller's self-signed certificate.
const SERVER_NAME: &str = "pmi-controller";

const RETRY_INTERVAL: Duration = Duration::from_millis(250);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Length-prefixed frames on a QUIC send stream: `len: u32 LE | bytes`.
struct FrameSendStream(SendStream);

impl FrameSendStream {
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        // the peer would refuse it after the stream is already out of sync
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::Encode);
        }
        let mut buf = Vec::with_capacity(4 + frame.len());
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);
        self.0.write_all(&buf).await?;
        Ok(())
    }
}

struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let mut len_buf = [0u8; 4];
        self.0.read_exact(&mut len_buf).await?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Decode);
        }
        let mut frame = vec![0u8; len];
        self.0.read_exact(&mut frame).await?;
        Ok(frame)
    }
}

/// One controller-worker connection and its single bidirectional stream.
struct Link {
    conn: Connection,
    send: FrameSendStream,
    recv: FrameRecvStream,
}

enum Links {
    /// Index `i` is rank `i + 1`.
    Controller(Vec<Link>),
    Worker(Link),
}

/// One process per rank, each worker connected to the controller over QUIC.
///
/// The controller listens on `controller_addr` with a freshly generated
/// self-signed certificate; workers do not verify it, so the transport is
/// only meant for trusted cluster networks. A private tokio runtime drives
/// the connections and the protocol thread blocks on it for each collective.
///
/// Every collective blocks the calling thread, so a `QuicTransport` must not
/// be created, driven or dropped from inside an async runtime.
pub struct QuicTransport {
    rank: Rank,
    size: usize,
    endpoint: quinn::Endpoint,
    links: Links,
    // dropped last, the endpoint's driver runs on it
    runtime: Runtime,
}

impl QuicTransport {
    /// Establishes the star topology. On the controller this blocks until
    /// every worker has connected; on a worker, until the controller has
    /// accepted it or `connect_timeout` has passed.
    pub fn connect(config: QuicConfig) -> Result<Self, Error> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pmi-quic")
            .enable_all()
            .build()?;

        let (endpoint, links) = if config.rank == CONTROLLER {
            runtime.block_on(Self::accept_workers(&config))?
        } else {
            runtime.block_on(Self::dial_controller(&config))?
        };

        Ok(QuicTransport {
            rank: config.rank,
            size: config.size,
            endpoint,
            links,
            runtime,
        })
    }

    fn transport_config(config: &QuicConfig) -> Arc<quinn::TransportConfig> {
        let mut transport_config = quinn::TransportConfig::default();
        // workers idle for as long as the controller computes locally
        transport_config.keep_alive_interval(Some(config.keep_alive_interval));
        Arc::new(transport_config)
    }

    async fn accept_workers(config: &QuicConfig) -> Result<(quinn::Endpoint, Links), Error> {
        let span = debug_span!("quic", rank = CONTROLLER);
        async move {
            let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
            let cert_der = cert.serialize_der()?;
            let key_der = cert.serialize_private_key_der();
            let mut server_config = quinn::ServerConfig::with_single_cert(
                vec![Certificate(cert_der)],
                PrivateKey(key_der),
            )?;
            server_config.transport_config(Self::transport_config(config));

            let endpoint = quinn::Endpoint::server(server_config, config.controller_addr)?;
            debug!("listening on {}", config.controller_addr);

            let mut pending: Vec<Option<Link>> = (1..config.size).map(|_| None).collect();
            let mut remaining = pending.len();
            while remaining > 0 {
                let connecting = endpoint
                    .accept()
                    .await
                    .ok_or(Error::Disconnected { rank: CONTROLLER })?;
                let remote = connecting.remote_address();
                let conn = connecting.await?;
                let (send, recv) = conn.accept_bi().await?;
                let mut recv = FrameRecvStream(recv);

                let hello = recv.receive().await?;
                let rank = match <[u8; 4]>::try_from(hello.as_slice()) {
                    Ok(bytes) => u32::from_le_bytes(bytes) as usize,
                    Err(_) => return Err(Error::Decode),
                };
                let slot = match rank.checked_sub(1).and_then(|i| pending.get_mut(i)) {
                    Some(slot) if slot.is_none() => slot,
                    _ => {
                        warn!("rejecting connection from {} claiming rank {}", remote, rank);
                        conn.close(1u32.into(), b"unexpected rank");
                        continue;
                    }
                };
                *slot = Some(Link {
                    conn,
                    send: FrameSendStream(send),
                    recv,
                });
                remaining -= 1;
                debug!("worker {} connected from {}, {} to go", rank, remote, remaining);
            }

            let links = pending.into_iter().flatten().collect();
            Ok((endpoint, Links::Controller(links)))
        }
        .instrument(span)
        .await
    }

    async fn dial_controller(config: &QuicConfig) -> Result<(quinn::Endpoint, Links), Error> {
        let span = debug_span!("quic", rank = config.rank);
        async move {
            let crypto = rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(AcceptControllerCert))
                .with_no_client_auth();
            let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
            client_config.transport_config(Self::transport_config(config));

            let bind: SocketAddr = match config.controller_addr {
                SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
                SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            };
            let mut endpoint = quinn::Endpoint::client(bind)?;
            endpoint.set_default_client_config(client_config);

            let deadline = tokio::time::Instant::now() + config.connect_timeout;
            let conn = loop {
                match endpoint.connect(config.controller_addr, SERVER_NAME)?.await {
                    Ok(conn) => break conn,
                    Err(e) if tokio::time::Instant::now() < deadline => {
                        debug!("controller not reachable yet: {}", e);
                        tokio::time::sleep(RETRY_INTERVAL).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            debug!("connected to controller at {}", config.controller_addr);

            let (send, recv) = conn.open_bi().await?;
            let mut send = FrameSendStream(send);
            send.send(&(config.rank as u32).to_le_bytes()).await?;

            let link = Link {
                conn,
                send,
                recv: FrameRecvStream(recv),
            };
            Ok((endpoint, Links::Worker(link)))
        }
        .instrument(span)
        .await
    }
}

impl Transport for QuicTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&mut self, frame: &[u8]) -> Result<(), Error> {
        let rank = self.rank;
        let QuicTransport { runtime, links, .. } = self;
        let Links::Controller(links) = links else {
            return Err(wrong_side(rank, "broadcast"));
        };
        if frame.len() > MAX_FRAME_LEN {
            return Err(Error::Encode);
        }
        runtime.block_on(async {
            let mut first_error = None;
            for (i, link) in links.iter_mut().enumerate() {
                if let Err(e) = link.send.send(frame).await {
                    warn!("broadcast to rank {} failed: {}", i + 1, e);
                    first_error.get_or_insert(e);
                }
            }
            trace!("broadcast {} bytes to {} workers", frame.len(), links.len());
            first_error.map_or(Ok(()), Err)
        })
    }

    fn receive_broadcast(&mut self) -> Result<Vec<u8>, Error> {
        let rank = self.rank;
        let QuicTransport { runtime, links, .. } = self;
        let Links::Worker(link) = links else {
            return Err(wrong_side(rank, "receive_broadcast"));
        };
        runtime.block_on(link.recv.receive())
    }

    fn gather_root(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        let rank = self.rank;
        let QuicTransport { runtime, links, .. } = self;
        let Links::Controller(links) = links else {
            return Err(wrong_side(rank, "gather_root"));
        };
        runtime.block_on(async {
            let mut frames = Vec::with_capacity(links.len());
            for link in links.iter_mut() {
                frames.push(link.recv.receive().await?);
            }
            Ok(frames)
        })
    }

    fn gather_send(&mut self, frame: Vec<u8>) -> Result<(), Error> {
        let rank = self.rank;
        let QuicTransport { runtime, links, .. } = self;
        let Links::Worker(link) = links else {
            return Err(wrong_side(rank, "gather_send"));
        };
        runtime.block_on(link.send.send(&frame))
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        let QuicTransport {
            runtime,
            endpoint,
            links,
            ..
        } = self;
        let links: Vec<&mut Link> = match links {
            Links::Controller(links) => links.iter_mut().collect(),
            Links::Worker(link) => vec![link],
        };
        runtime.block_on(async {
            // the last frame may still be in flight, wait for the peer to ack it
            for link in links {
                if tokio::time::timeout(SHUTDOWN_GRACE, link.send.0.finish())
                    .await
                    .is_err()
                {
                    debug!("peer did not acknowledge the stream end in time");
                }
                link.conn.close(0u32.into(), b"done");
            }
            if tokio::time::timeout(SHUTDOWN_GRACE, endpoint.wait_idle())
                .await
                .is_err()
            {
                debug!("endpoint did not drain in time");
            }
        });
    }
}

/// Accepts whatever certificate the controller presents.
struct AcceptControllerCert;

impl ServerCertVerifier for AcceptControllerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
