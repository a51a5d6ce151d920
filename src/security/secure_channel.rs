use anyhow::Result;
use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::constants::CERT_SHARING_PREFIX;
use crate::events::model::{ConnectionRole, LogLevel};
use crate::network::events::emit_network_event;
use crate::security::certs::LocalCertificate;
use crate::security::trust::{certificate_common_name, spki_fingerprint, TrustManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityBackend {
    Plaintext,
    Tls,
}

/// What the handshake established about the other side.
#[derive(Debug, Clone)]
pub struct AuthSummary {
    pub backend: SecurityBackend,
    /// SPKI fingerprint of the peer's leaf certificate
    pub fingerprint: Option<String>,
    /// Subject CN of the certificate the peer presented during the TLS handshake
    pub peer_cert_id: Option<String>,
    /// Certificate id received through the sharing exchange
    pub shared_cert_id: Option<String>,
}

impl AuthSummary {
    pub fn plaintext() -> Self {
        Self {
            backend: SecurityBackend::Plaintext,
            fingerprint: None,
            peer_cert_id: None,
            shared_cert_id: None,
        }
    }

    /// Best identity the transport resolved: the shared id, else the TLS certificate CN.
    pub fn remote_cert_id(&self) -> Option<&str> {
        self.shared_cert_id
            .as_deref()
            .or(self.peer_cert_id.as_deref())
    }

    pub fn did_share(&self) -> bool {
        self.shared_cert_id.is_some()
    }
}

pub type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct Channel {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub auth: AuthSummary,
    /// Application line read while waiting for a sharing line that never came.
    pub pending: Option<String>,
}

#[async_trait]
pub trait SecureChannel: Send + Sync {
    fn backend(&self) -> SecurityBackend;

    /// Certificate id this side presents, if any.
    fn local_cert_id(&self) -> Option<&str> {
        None
    }

    /// Extra time `connect`/`accept` may spend after the handshake itself,
    /// e.g. waiting for a certificate-sharing line.
    fn negotiation_allowance(&self) -> Duration {
        Duration::ZERO
    }

    async fn connect(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Channel>;

    async fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Channel>;
}

/// TLS configuration built once and shared by every client of a manager (or an object server).
pub struct TlsMaterial {
    certificate: LocalCertificate,
    trust: Arc<TrustManager>,
    client_config: Arc<ClientConfig>,
    server_config: Arc<ServerConfig>,
}

impl TlsMaterial {
    pub fn new(certificate: LocalCertificate, trust: Arc<TrustManager>) -> Result<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(TrustVerifier::new(
                trust.clone(),
                provider.clone(),
                ConnectionRole::Outbound,
            )))
            .with_client_auth_cert(certificate.chain(), certificate.key())?;
        let server_config = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(TrustVerifier::new(
                trust.clone(),
                provider,
                ConnectionRole::Inbound,
            )))
            .with_single_cert(certificate.chain(), certificate.key())?;
        Ok(Self {
            certificate,
            trust,
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    pub fn certificate(&self) -> &LocalCertificate {
        &self.certificate
    }
    pub fn trust(&self) -> &Arc<TrustManager> {
        &self.trust
    }
}

pub struct TlsSecureChannel {
    material: Arc<TlsMaterial>,
    sharing: bool,
    sharing_timeout: Duration,
}

impl TlsSecureChannel {
    pub fn new(material: Arc<TlsMaterial>, sharing: bool, sharing_timeout: Duration) -> Self {
        Self {
            material,
            sharing,
            sharing_timeout,
        }
    }
}

fn peer_identity(chain: Option<&[CertificateDer<'static>]>) -> (Option<String>, Option<String>) {
    match chain.and_then(|c| c.first()) {
        Some(leaf) => (
            Some(spki_fingerprint(leaf)),
            certificate_common_name(leaf.as_ref()),
        ),
        None => (None, None),
    }
}

fn sharing_line(cert_id: &str) -> String {
    format!("{}{}\n", CERT_SHARING_PREFIX, cert_id)
}

enum SharingRead {
    Shared(String),
    Other(String),
    Nothing,
}

async fn read_sharing_line<R>(reader: &mut R, wait: Duration) -> Result<SharingRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    match tokio::time::timeout(wait, reader.read_line(&mut line)).await {
        Err(_) => Ok(SharingRead::Nothing),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(0)) => anyhow::bail!("connection closed during certificate sharing"),
        Ok(Ok(_)) => {
            let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
            Ok(match trimmed.strip_prefix(CERT_SHARING_PREFIX) {
                Some(id) => SharingRead::Shared(id.to_string()),
                None => SharingRead::Other(trimmed.to_string()),
            })
        }
    }
}

#[async_trait]
impl SecureChannel for TlsSecureChannel {
    fn backend(&self) -> SecurityBackend {
        SecurityBackend::Tls
    }

    fn local_cert_id(&self) -> Option<&str> {
        Some(self.material.certificate.id())
    }

    fn negotiation_allowance(&self) -> Duration {
        if self.sharing {
            self.sharing_timeout
        } else {
            Duration::ZERO
        }
    }

    async fn connect(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Channel> {
        let connector = TlsConnector::from(self.material.client_config.clone());
        let domain = ServerName::try_from(peer_addr.ip().to_string())?;
        let tls_stream = connector.connect(domain, stream).await?;
        let (fingerprint, peer_cert_id) = peer_identity(tls_stream.get_ref().1.peer_certificates());

        let (r, mut writer) = tokio::io::split(tls_stream);
        let mut reader = BufReader::new(r);
        let mut shared_cert_id = None;
        let mut pending = None;
        if self.sharing {
            // Client speaks first, server answers with its own id.
            writer
                .write_all(sharing_line(self.material.certificate.id()).as_bytes())
                .await?;
            writer.flush().await?;
            match read_sharing_line(&mut reader, self.sharing_timeout).await? {
                SharingRead::Shared(id) => shared_cert_id = Some(id),
                SharingRead::Other(line) => pending = Some(line),
                SharingRead::Nothing => emit_network_event(
                    "secure_channel",
                    LogLevel::Warn,
                    "cert_sharing_timeout",
                    Some(peer_addr.to_string()),
                    None,
                ),
            }
        }

        Ok(Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            auth: AuthSummary {
                backend: SecurityBackend::Tls,
                fingerprint,
                peer_cert_id,
                shared_cert_id,
            },
            pending,
        })
    }

    async fn accept(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<Channel> {
        let acceptor = TlsAcceptor::from(self.material.server_config.clone());
        let tls_stream = acceptor.accept(stream).await?;
        let (fingerprint, peer_cert_id) = peer_identity(tls_stream.get_ref().1.peer_certificates());

        let (r, mut writer) = tokio::io::split(tls_stream);
        let mut reader = BufReader::new(r);
        let mut shared_cert_id = None;
        let mut pending = None;
        if self.sharing {
            match read_sharing_line(&mut reader, self.sharing_timeout).await? {
                SharingRead::Shared(id) => {
                    shared_cert_id = Some(id);
                    writer
                        .write_all(sharing_line(self.material.certificate.id()).as_bytes())
                        .await?;
                    writer.flush().await?;
                }
                SharingRead::Other(line) => pending = Some(line),
                SharingRead::Nothing => emit_network_event(
                    "secure_channel",
                    LogLevel::Warn,
                    "cert_sharing_timeout",
                    Some(peer_addr.to_string()),
                    None,
                ),
            }
        }

        Ok(Channel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            auth: AuthSummary {
                backend: SecurityBackend::Tls,
                fingerprint,
                peer_cert_id,
                shared_cert_id,
            },
            pending,
        })
    }
}

#[derive(Default)]
pub struct PlaintextChannel;

impl PlaintextChannel {
    pub fn new() -> Self {
        Self
    }

    fn wrap(stream: TcpStream) -> Channel {
        let (r, w) = stream.into_split();
        Channel {
            reader: Box::new(BufReader::new(r)),
            writer: Box::new(w),
            auth: AuthSummary::plaintext(),
            pending: None,
        }
    }
}

#[async_trait]
impl SecureChannel for PlaintextChannel {
    fn backend(&self) -> SecurityBackend {
        SecurityBackend::Plaintext
    }

    async fn connect(&self, stream: TcpStream, _peer_addr: SocketAddr) -> Result<Channel> {
        Ok(Self::wrap(stream))
    }

    async fn accept(&self, stream: TcpStream, _peer_addr: SocketAddr) -> Result<Channel> {
        Ok(Self::wrap(stream))
    }
}

/// Certificate verifier that defers the trust decision to a [`TrustManager`]
/// and still checks handshake signatures against the crypto provider.
#[derive(Debug)]
struct TrustVerifier {
    trust: Arc<TrustManager>,
    provider: Arc<CryptoProvider>,
    role: ConnectionRole,
}

impl TrustVerifier {
    fn new(trust: Arc<TrustManager>, provider: Arc<CryptoProvider>, role: ConnectionRole) -> Self {
        Self {
            trust,
            provider,
            role,
        }
    }

    fn check(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend(intermediates.iter().cloned());
        if self.trust.evaluate(&chain, self.role).is_accept() {
            Ok(())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl ServerCertVerifier for TrustVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl ClientCertVerifier for TrustVerifier {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity, intermediates)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
