//! Keeps a session alive for as long as the caller's cancellation token does.
//!
//! The virtual stack is created by the caller and outlives every session;
//! only the packet face is lent out per attempt. That ordering is what lets
//! user TCP connections stall through an outage and resume on reconnect
//! instead of being torn down with the QUIC connection.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::TunnelParams;
use crate::error::TunnelError;
use crate::netstack::PacketFace;
use crate::session::run_session;

/// Establish and re-establish sessions until cancelled or a fatal error.
/// The fixed reconnect delay is the whole backoff story, deliberately.
pub async fn maintain_tunnel(
    params: TunnelParams,
    tls: quinn::ClientConfig,
    pin_mismatch: Arc<AtomicBool>,
    mut packet_face: PacketFace,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let started = Instant::now();
        match run_session(&params, tls.clone(), &pin_mismatch, &mut packet_face, &cancel).await {
            Ok(()) => {
                info!("tunnel shut down");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                error!(%e, "tunnel failed permanently");
                return Err(e);
            }
            Err(e) => {
                warn!(
                    %e,
                    uptime = ?started.elapsed(),
                    delay = ?params.reconnect_delay,
                    "session ended, reconnecting"
                );
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(params.reconnect_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnrollmentIdentity;
    use crate::netstack::VirtualStack;
    use std::time::Duration;

    fn test_setup() -> (TunnelParams, quinn::ClientConfig, Arc<AtomicBool>, PacketFace) {
        let identity = EnrollmentIdentity {
            private_key: p256::SecretKey::random(&mut rand::rngs::OsRng),
            endpoint_public_key: p256::SecretKey::random(&mut rand::rngs::OsRng).public_key(),
            inner_v4: Some("172.16.0.2".parse().unwrap()),
            inner_v6: None,
            endpoint_v4: Some("127.0.0.1".parse().unwrap()),
            endpoint_v6: None,
        };
        let params = TunnelParams {
            endpoint: "127.0.0.1:9".parse().unwrap(),
            sni: "endpoint.test".into(),
            keepalive_period: Duration::from_secs(30),
            initial_packet_size: 1242,
            mtu: 1280,
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            idle_timeout: Duration::ZERO,
        };
        let (tls, pin_mismatch) = crate::tls::build_client_config(&identity, &params).unwrap();
        let (packet_face, _socket_face) =
            VirtualStack::new(&["172.16.0.2".parse().unwrap()], vec![], 1280).unwrap();
        (params, tls, pin_mismatch, packet_face)
    }

    #[tokio::test]
    async fn cancelled_supervisor_exits_cleanly() {
        let (params, tls, pin_mismatch, packet_face) = test_setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = maintain_tunnel(params, tls, pin_mismatch, packet_face, cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn transient_failures_keep_retrying_until_cancelled() {
        let (params, tls, pin_mismatch, packet_face) = test_setup();
        let cancel = CancellationToken::new();

        let supervisor = tokio::spawn(maintain_tunnel(
            params,
            tls,
            pin_mismatch,
            packet_face,
            cancel.clone(),
        ));

        // Let it fail against the dead endpoint at least once, then stop it.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!supervisor.is_finished(), "transient errors must not exit");
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .expect("supervisor must exit after cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
