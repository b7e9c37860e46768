//! TLS context for the MASQUE handshake.
//!
//! Peer verification deliberately ignores WebPKI: the provider endpoint is
//! identified by the ECDSA public key recorded at enrollment, nothing else.
//! The client in turn authenticates with an ephemeral self-signed
//! certificate carrying the enrolled device key. The certificate is remade
//! every process run; there is nothing worth persisting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
use quinn::{ClientConfig as QuinnClientConfig, TransportConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use x509_parser::prelude::*;

use crate::config::{EnrollmentIdentity, TunnelParams};
use crate::error::TunnelError;

const DATAGRAM_BUFFER: usize = 65_536;
// QUIC floor; the transport rejects smaller initial packet sizes.
const MIN_INITIAL_PACKET: u16 = 1_200;

/// Ephemeral self-signed client certificate for the enrolled device key.
pub fn client_certificate(
    key: &p256::SecretKey,
) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>), TunnelError> {
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| TunnelError::KeyMaterial(format!("device key to PKCS#8: {e}")))?;
    let key_der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());

    let key_pair =
        rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| TunnelError::KeyMaterial(format!("device key unusable: {e}")))?;

    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "domino");
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TunnelError::KeyMaterial(format!("client certificate: {e}")))?;

    Ok((cert.der().clone(), key_der))
}

/// Verifier that accepts the peer iff the leaf certificate's subject public
/// key equals the pinned endpoint key. Handshake signatures are still
/// checked with the provider's algorithms, so a matching certificate without
/// the matching private key gets nowhere.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    pinned_spki: Vec<u8>,
    algorithms: WebPkiSupportedAlgorithms,
    mismatch: Arc<AtomicBool>,
}

impl PinnedServerVerifier {
    pub fn new(
        endpoint_key: &p256::PublicKey,
        algorithms: WebPkiSupportedAlgorithms,
    ) -> Result<(Self, Arc<AtomicBool>), TunnelError> {
        let pinned_spki = endpoint_key
            .to_public_key_der()
            .map_err(|e| TunnelError::KeyMaterial(format!("pinned endpoint key: {e}")))?
            .as_bytes()
            .to_vec();
        let mismatch = Arc::new(AtomicBool::new(false));
        Ok((
            Self {
                pinned_spki,
                algorithms,
                mismatch: mismatch.clone(),
            },
            mismatch,
        ))
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref())
            .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::BadEncoding))?;

        if cert.tbs_certificate.subject_pki.raw == self.pinned_spki.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            self.mismatch.store(true, Ordering::SeqCst);
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Assemble the QUIC client configuration: TLS 1.3 only, ALPN `h3`, pinned
/// peer verification, client certificate auth, keepalive and datagram
/// transport settings. Returns the config plus the pin-mismatch flag the
/// session consults when the handshake fails.
pub fn build_client_config(
    identity: &EnrollmentIdentity,
    params: &TunnelParams,
) -> Result<(QuinnClientConfig, Arc<AtomicBool>), TunnelError> {
    let provider = rustls::crypto::ring::default_provider();
    let algorithms = provider.signature_verification_algorithms;

    let (cert, key) = client_certificate(&identity.private_key)?;
    let (verifier, pin_mismatch) =
        PinnedServerVerifier::new(&identity.endpoint_public_key, algorithms)?;

    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Config(format!("TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(vec![cert], PrivateKeyDer::from(key))
        .map_err(|e| TunnelError::KeyMaterial(format!("client auth: {e}")))?;
    crypto.alpn_protocols = vec![b"h3".to_vec()];

    let mut transport = TransportConfig::default();
    if params.keepalive_period > Duration::ZERO {
        transport.keep_alive_interval(Some(params.keepalive_period));
    }
    transport.initial_mtu(params.initial_packet_size.max(MIN_INITIAL_PACKET));
    transport.datagram_receive_buffer_size(Some(DATAGRAM_BUFFER));
    transport.datagram_send_buffer_size(DATAGRAM_BUFFER);

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TunnelError::Config(format!("QUIC TLS config: {e}")))?;
    let mut client = QuinnClientConfig::new(Arc::new(quic));
    client.transport_config(Arc::new(transport));

    Ok((client, pin_mismatch))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> p256::SecretKey {
        p256::SecretKey::random(&mut rand::rngs::OsRng)
    }

    fn verify_args() -> (ServerName<'static>, UnixTime) {
        (ServerName::try_from("endpoint.test").unwrap(), UnixTime::now())
    }

    #[test]
    fn certificate_carries_enrolled_key() {
        let key = random_key();
        let (cert, _) = client_certificate(&key).unwrap();

        let (_, parsed) = X509Certificate::from_der(cert.as_ref()).unwrap();
        let spki = key.public_key().to_public_key_der().unwrap();
        assert_eq!(parsed.tbs_certificate.subject_pki.raw, spki.as_bytes());
    }

    #[test]
    fn verifier_accepts_pinned_key() {
        let endpoint_key = random_key();
        // A certificate whose subject key is the pinned key, as the real
        // endpoint would present.
        let (cert, _) = client_certificate(&endpoint_key).unwrap();

        let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        let (verifier, mismatch) =
            PinnedServerVerifier::new(&endpoint_key.public_key(), algorithms).unwrap();

        let (name, now) = verify_args();
        verifier
            .verify_server_cert(&cert, &[], &name, &[], now)
            .expect("pinned key must verify");
        assert!(!mismatch.load(Ordering::SeqCst));
    }

    #[test]
    fn verifier_rejects_other_keys() {
        let endpoint_key = random_key();
        let imposter = random_key();
        let (cert, _) = client_certificate(&imposter).unwrap();

        let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        let (verifier, mismatch) =
            PinnedServerVerifier::new(&endpoint_key.public_key(), algorithms).unwrap();

        let (name, now) = verify_args();
        verifier
            .verify_server_cert(&cert, &[], &name, &[], now)
            .expect_err("foreign key must be rejected");
        assert!(mismatch.load(Ordering::SeqCst), "mismatch flag must be set");
    }

    #[test]
    fn verifier_rejects_garbage_certificates() {
        let endpoint_key = random_key();
        let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;
        let (verifier, _) =
            PinnedServerVerifier::new(&endpoint_key.public_key(), algorithms).unwrap();

        let garbage = CertificateDer::from(vec![0u8; 16]);
        let (name, now) = verify_args();
        assert!(verifier
            .verify_server_cert(&garbage, &[], &name, &[], now)
            .is_err());
    }
}
