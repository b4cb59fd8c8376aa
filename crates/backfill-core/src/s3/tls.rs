//! HTTP agents, one per TLS mode, built on first use and kept for the life
//! of the process.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use super::fetcher::FetchError;

/// Connect timeout for every agent; the total request deadline is set per call.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AgentKey {
    verify_tls: bool,
    max_redirects: u32,
}

static AGENTS: LazyLock<Mutex<HashMap<AgentKey, ureq::Agent>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Shared agent for the given TLS mode and redirect limit.
pub fn shared_agent(verify_tls: bool, max_redirects: u32) -> Result<ureq::Agent, FetchError> {
    let key = AgentKey {
        verify_tls,
        max_redirects,
    };
    let mut agents = AGENTS.lock().unwrap();
    if let Some(agent) = agents.get(&key) {
        return Ok(agent.clone());
    }
    let agent = build_agent(key)?;
    agents.insert(key, agent.clone());
    Ok(agent)
}

fn build_agent(key: AgentKey) -> Result<ureq::Agent, FetchError> {
    let mut builder = ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .redirects(key.max_redirects)
        .user_agent(concat!("rbd-backfill/", env!("CARGO_PKG_VERSION")));
    if !key.verify_tls {
        tracing::warn!("TLS certificate verification is disabled for S3 parents");
        builder = builder.tls_config(Arc::new(insecure_client_config()?));
    }
    Ok(builder.build())
}

fn insecure_client_config() -> Result<rustls::ClientConfig, FetchError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = AcceptAnyCertificate {
        algorithms: provider.signature_verification_algorithms,
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::InvalidRequest(format!("TLS setup: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(config)
}

/// Skips chain and hostname validation. Handshake signatures are still
/// checked against the presented certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
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
