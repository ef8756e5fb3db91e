// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use super::{BoxedStream, ConnectFuture, Connector};
use crate::credentials::Credentials;
use crate::error::{LeapError, Result};

/// Mutual-TLS connector for a controller at a fixed address.
pub struct TlsConnector {
    host: String,
    port: u16,
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(host: impl Into<String>, port: u16, credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            host: host.into(),
            port,
            config: Arc::new(client_config(credentials)?),
        })
    }
}

impl Connector for TlsConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let addr = format!("{}:{}", self.host, self.port);
            info!("Connecting to controller at {}", addr);

            let tcp = TcpStream::connect(&addr).await.map_err(|e| {
                error!("Failed to connect to {}: {}", addr, e);
                LeapError::ConnectionError {
                    reason: format!("{addr}: {e}"),
                }
            })?;
            tcp.set_nodelay(true)?;

            let server_name =
                ServerName::try_from(self.host.clone()).map_err(|e| LeapError::ConnectionError {
                    reason: format!("invalid controller address {}: {e}", self.host),
                })?;

            let stream = tokio_rustls::TlsConnector::from(self.config.clone())
                .connect(server_name, tcp)
                .await
                .map_err(|e| {
                    error!("TLS handshake with {} failed: {}", addr, e);
                    LeapError::ConnectionError {
                        reason: format!("TLS handshake with {addr}: {e}"),
                    }
                })?;

            debug!("TLS session established with {}", addr);
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn client_config(credentials: &Credentials) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(credentials.ca.as_bytes()) {
        roots.add(cert.map_err(|e| bad_pem("CA certificate", e))?)?;
    }
    if roots.is_empty() {
        return Err(LeapError::Credentials {
            reason: "no CA certificate found".into(),
        });
    }

    let chain = CertificateDer::pem_slice_iter(credentials.cert.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| bad_pem("client certificate", e))?;
    let key = PrivateKeyDer::from_pem_slice(credentials.key.as_bytes())
        .map_err(|e| bad_pem("client key", e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| LeapError::Credentials {
            reason: format!("CA certificate: {e}"),
        })?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ControllerCertVerifier { inner: webpki }))
        .with_client_auth_cert(chain, key)?;
    Ok(config)
}

fn bad_pem(what: &str, err: impl std::fmt::Debug) -> LeapError {
    LeapError::Credentials {
        reason: format!("{what}: {err:?}"),
    }
}

/// Full chain validation against the controller's CA, but the certificate
/// subject need not match the address we dialled. Controllers are reached by
/// IP and their certificates name the device, not the address.
#[derive(Debug)]
struct ControllerCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

impl ServerCertVerifier for ControllerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
                debug!("Accepting controller certificate not issued for {:?}", server_name);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
