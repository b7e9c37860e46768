//! One live MASQUE session.
//!
//! A session owns a single QUIC connection to the provider endpoint and the
//! CONNECT-IP request opened on it, then shuttles IP packets between the
//! virtual stack's packet face and the QUIC datagram channel until a fatal
//! error, the idle watchdog, or cancellation ends it. The packet face is
//! only borrowed; it goes back to the supervisor for the next session.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use quinn::SendDatagramError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::TunnelParams;
use crate::error::TunnelError;
use crate::masque::{connect_ip_request, IpDatagram, CONTEXT_ID_IP};
use crate::netstack::PacketFace;

const IDLE_TICK: Duration = Duration::from_millis(500);
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Session lifecycle, tracked for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Dialing,
    Connected,
    Draining,
    Closed,
}

struct Established {
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    // Held for the session's lifetime; dropping it closes the request.
    request_stream: h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    driver: tokio::task::JoinHandle<()>,
}

/// Run one session to completion. `Ok(())` means a clean end (cancellation
/// or stack shutdown); every other outcome is a classified error the
/// supervisor decides on.
pub async fn run_session(
    params: &TunnelParams,
    tls: quinn::ClientConfig,
    pin_mismatch: &Arc<AtomicBool>,
    packet_face: &mut PacketFace,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    debug!(state = ?SessionState::Dialing, endpoint = %params.endpoint, "opening session");

    let established = tokio::time::timeout(
        params.connect_timeout,
        establish(params, tls, pin_mismatch),
    )
    .await
    .map_err(|_| TunnelError::HandshakeTimeout(params.connect_timeout))??;

    info!(
        state = ?SessionState::Connected,
        remote = %established.connection.remote_address(),
        "tunnel established"
    );

    let result = pump(params, &established.connection, packet_face, cancel).await;

    debug!(state = ?SessionState::Draining, "closing session");
    established
        .connection
        .close(quinn::VarInt::from_u32(0), b"session closed");
    established.driver.abort();
    drop(established.request_stream);
    // Give the CONNECTION_CLOSE a moment to leave, then let go.
    let _ = tokio::time::timeout(CLOSE_GRACE, established.endpoint.wait_idle()).await;
    debug!(state = ?SessionState::Closed, "session closed");

    result
}

async fn establish(
    params: &TunnelParams,
    tls: quinn::ClientConfig,
    pin_mismatch: &Arc<AtomicBool>,
) -> Result<Established, TunnelError> {
    pin_mismatch.store(false, Ordering::SeqCst);

    let bind: SocketAddr = if params.endpoint.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind)?;
    endpoint.set_default_client_config(tls);

    let connection = match endpoint.connect(params.endpoint, &params.sni)?.await {
        Ok(connection) => connection,
        Err(e) => {
            // The verifier flags a failed pin before the handshake error
            // surfaces here; that distinction decides whether we ever retry.
            if pin_mismatch.swap(false, Ordering::SeqCst) {
                return Err(TunnelError::PinMismatch);
            }
            return Err(e.into());
        }
    };

    let (mut h3_conn, mut send_request): (
        h3::client::Connection<_, Bytes>,
        h3::client::SendRequest<_, Bytes>,
    ) = h3::client::builder()
        .enable_datagram(true)
        .enable_extended_connect(true)
        .build(h3_quinn::Connection::new(connection.clone()))
        .await?;

    let driver = tokio::spawn(async move {
        let _ = std::future::poll_fn(|cx| h3_conn.poll_close(cx)).await;
    });

    let request =
        connect_ip_request(&params.sni).map_err(|e| TunnelError::Config(e.to_string()))?;
    let mut request_stream = send_request.send_request(request).await?;
    let response = request_stream.recv_response().await?;
    let status = response.status();
    if !status.is_success() {
        driver.abort();
        return Err(classify_status(status));
    }
    debug!(%status, "connect-ip request accepted");

    Ok(Established {
        endpoint,
        connection,
        request_stream,
        driver,
    })
}

/// Non-2xx answers to the CONNECT-IP request: authentication problems are
/// terminal, anything else is worth retrying.
fn classify_status(status: http::StatusCode) -> TunnelError {
    if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
        TunnelError::AuthDenied(status)
    } else {
        TunnelError::Rejected(status)
    }
}

async fn pump(
    params: &TunnelParams,
    connection: &quinn::Connection,
    packet_face: &mut PacketFace,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let mut last_datagram = Instant::now();
    let mut idle = tokio::time::interval(IDLE_TICK);
    idle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let watchdog = params.idle_timeout > Duration::ZERO;

    let mut sent: u64 = 0;
    let mut received: u64 = 0;
    let mut dropped_oversize: u64 = 0;
    let mut dropped_parse: u64 = 0;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("session cancelled");
                break Ok(());
            }

            frame = packet_face.read() => {
                let Some(frame) = frame else {
                    debug!("packet face closed, ending session");
                    break Ok(());
                };
                match connection.send_datagram(IpDatagram::new(frame).encode()) {
                    Ok(()) => {
                        sent += 1;
                        last_datagram = Instant::now();
                    }
                    // Same outcome as a link with a smaller MTU.
                    Err(SendDatagramError::TooLarge) => {
                        dropped_oversize += 1;
                        trace!("frame exceeds datagram MTU, dropped");
                    }
                    Err(SendDatagramError::ConnectionLost(e)) => break Err(e.into()),
                    Err(SendDatagramError::UnsupportedByPeer) => {
                        break Err(TunnelError::Datagram(
                            "peer does not support QUIC datagrams".into(),
                        ))
                    }
                    Err(SendDatagramError::Disabled) => {
                        break Err(TunnelError::Datagram(
                            "datagrams disabled on this connection".into(),
                        ))
                    }
                }
            }

            datagram = connection.read_datagram() => {
                match datagram {
                    Ok(datagram) => {
                        last_datagram = Instant::now();
                        match IpDatagram::decode(datagram) {
                            Ok(d) if d.context_id == CONTEXT_ID_IP => {
                                received += 1;
                                packet_face.write(d.payload);
                            }
                            Ok(d) => {
                                dropped_parse += 1;
                                trace!(context = d.context_id, "foreign context dropped");
                            }
                            Err(e) => {
                                dropped_parse += 1;
                                debug!(%e, "undecodable datagram dropped");
                            }
                        }
                    }
                    Err(e) => break Err(e.into()),
                }
            }

            _ = idle.tick(), if watchdog => {
                if last_datagram.elapsed() >= params.idle_timeout {
                    break Err(TunnelError::IdleTimeout(params.idle_timeout));
                }
            }
        }
    };

    debug!(sent, received, dropped_oversize, dropped_parse, "datapath finished");
    result
}
