//! QUIC transport (`spec.md` §4.4): a freshly minted self-signed certificate
//! guards the socket; peer verification is disabled at the TLS layer because
//! authenticity is asserted at the application layer via the action
//! signature. Next-protocol names: `h3`, `propolis`.

pub mod envelope;

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

use envelope::{read_frame, write_frame, Request, Response};

pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"propolis", b"h3"];

/// Hostname carried in the TLS ClientHello. Verification is disabled on both
/// ends, so its value is never checked against the presented certificate;
/// it exists only because `rustls::ClientConfig` requires one.
const SNI_PLACEHOLDER: &str = "propolis.invalid";

#[derive(Debug)]
struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl AcceptAnyServerCert {
    fn verifier() -> Arc<dyn ServerCertVerifier> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Binds a QUIC listener on `bind_addr` using the node's self-signed
/// certificate and signing key (PKCS8 DER).
pub fn server_endpoint(bind_addr: SocketAddr, cert_der: Vec<u8>, key_der: Vec<u8>) -> anyhow::Result<quinn::Endpoint> {
    let cert = CertificateDer::from(cert_der);
    let key = PrivatePkcs8KeyDer::from(key_der);

    let mut server_crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key.into())?;
    server_crypto.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(server_crypto)?));
    Ok(quinn::Endpoint::server(server_config, bind_addr)?)
}

/// Builds a QUIC client endpoint bound to an ephemeral local port, configured
/// to dial peers with TLS verification disabled.
pub fn client_endpoint() -> anyhow::Result<quinn::Endpoint> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(AcceptAnyServerCert::verifier())
        .with_no_client_auth();
    client_crypto.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    let client_config = quinn::ClientConfig::new(Arc::new(QuicClientConfig::try_from(client_crypto)?));
    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse()?)?;
    endpoint.set_default_client_config(client_config);
    Ok(endpoint)
}

/// Dials `addr`, sends one framed request, and returns the framed response.
/// Each call opens (and closes) its own bidirectional stream; deadline is the
/// caller's responsibility via `tokio::time::timeout`.
pub async fn send_request(endpoint: &quinn::Endpoint, addr: SocketAddr, req: Request) -> anyhow::Result<Response> {
    let connection = endpoint.connect(addr, SNI_PLACEHOLDER)?.await?;
    let (mut send, mut recv) = connection.open_bi().await?;
    write_frame(&mut send, &req).await?;
    send.finish()?;
    let resp: Response = read_frame(&mut recv).await?;
    connection.close(0u32.into(), b"done");
    Ok(resp)
}
