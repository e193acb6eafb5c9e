//! TLS configuration shared by the QUIC, H2 and WS transports
//!
//! Verification modes: full CA verification against system roots or an
//! explicit bundle (`strict`), pinned SHA-256 certificate fingerprint, or
//! accept-anything for development meshes. When no certificate is configured,
//! listeners generate an ephemeral self-signed one.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};

use super::TransportError;
use crate::config::{ProtocolConfig, TlsConfig};

/// Default ALPN when `protocol.alpn` is unset.
pub const DEFAULT_ALPN: &str = "weft/1";

pub fn alpn_protocols(protocol: &ProtocolConfig) -> Vec<Vec<u8>> {
    let alpn = protocol.alpn.as_deref().unwrap_or(DEFAULT_ALPN);
    vec![alpn.as_bytes().to_vec()]
}

/// PEM material either inline (starts with "-----BEGIN") or a file path.
fn read_pem(source: &str) -> Result<Vec<u8>, TransportError> {
    if source.trim_start().starts_with("-----BEGIN") {
        Ok(source.as_bytes().to_vec())
    } else {
        std::fs::read(source)
            .map_err(|e| TransportError::fatal(format!("cannot read {}: {}", source, e)))
    }
}

fn load_certs(source: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = read_pem(source)?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::fatal(format!("bad certificate pem: {}", e)))
}

fn load_key(source: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let pem = read_pem(source)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TransportError::fatal(format!("bad key pem: {}", e)))?
        .ok_or_else(|| TransportError::fatal("no private key found in pem"))
}

/// Certificate chain + key for our side: configured, or ephemeral
/// self-signed.
pub fn local_cert(
    tls: &TlsConfig,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TransportError> {
    match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => Ok((load_certs(cert)?, load_key(key)?)),
        (None, None) => {
            let generated = rcgen::generate_simple_self_signed(vec!["weft".to_string()])
                .map_err(|e| TransportError::fatal(format!("cert generation failed: {}", e)))?;
            let cert = CertificateDer::from(generated.cert.der().to_vec());
            let key = PrivateKeyDer::try_from(generated.key_pair.serialize_der())
                .map_err(|e| TransportError::fatal(format!("bad generated key: {}", e)))?;
            Ok((vec![cert], key))
        }
        _ => Err(TransportError::fatal(
            "tls.cert and tls.key must be set together",
        )),
    }
}

fn root_store(tls: &TlsConfig) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match &tls.ca {
        Some(ca) => {
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::fatal(format!("bad ca certificate: {}", e)))?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs().certs {
                roots.add(cert).ok();
            }
        }
    }
    Ok(roots)
}

/// Ensure the process-wide rustls `CryptoProvider` is installed. Idempotent:
/// a prior install (by us or anyone else in the process) is fine.
fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Client-side rustls config honouring the configured verification mode.
pub fn client_config(
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<ClientConfig, TransportError> {
    ensure_crypto_provider();
    let builder = ClientConfig::builder();

    let builder = if let Some(fingerprint) = &tls.fingerprint {
        let pin = hex::decode(fingerprint.replace(':', ""))
            .map_err(|_| TransportError::fatal("fingerprint must be hex sha-256"))?;
        if pin.len() != 32 {
            return Err(TransportError::fatal("fingerprint must be 32 bytes"));
        }
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier { pin }))
    } else if tls.strict {
        builder.with_root_certificates(root_store(tls)?)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier))
    };

    let mut config = if tls.mtls || (tls.cert.is_some() && tls.key.is_some()) {
        let (certs, key) = local_cert(tls)?;
        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::fatal(format!("client cert rejected: {}", e)))?
    } else {
        builder.with_no_client_auth()
    };

    config.alpn_protocols = alpn_protocols(protocol);
    Ok(config)
}

/// Server-side rustls config. mTLS demands a client certificate signed by
/// the configured CA.
pub fn server_config(
    tls: &TlsConfig,
    protocol: &ProtocolConfig,
) -> Result<ServerConfig, TransportError> {
    ensure_crypto_provider();
    let (certs, key) = local_cert(tls)?;

    let builder = if tls.mtls {
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(root_store(tls)?))
            .build()
            .map_err(|e| TransportError::fatal(format!("client verifier: {}", e)))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::fatal(format!("server cert rejected: {}", e)))?;
    config.alpn_protocols = alpn_protocols(protocol);
    Ok(config)
}

/// Accepts any server certificate. Development meshes only; the peer-link
/// handshake still authenticates the remote agent ID.
#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts only a certificate whose SHA-256 matches the configured pin.
#[derive(Debug)]
struct PinnedVerifier {
    pin: Vec<u8>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if crate::crypto::constant_time_eq(&digest, &self.pin) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("certificate fingerprint mismatch".into()))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alpn() {
        let protocol = ProtocolConfig::default();
        assert_eq!(alpn_protocols(&protocol), vec![b"weft/1".to_vec()]);

        let protocol = ProtocolConfig {
            alpn: Some("h2".into()),
            ..Default::default()
        };
        assert_eq!(alpn_protocols(&protocol), vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_ephemeral_cert_generated() {
        let (certs, _key) = local_cert(&TlsConfig::default()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let tls = TlsConfig {
            cert: Some("cert.pem".into()),
            ..Default::default()
        };
        assert!(local_cert(&tls).is_err());
    }

    #[test]
    fn test_bad_fingerprint_rejected() {
        let tls = TlsConfig {
            fingerprint: Some("zz".into()),
            ..Default::default()
        };
        assert!(client_config(&tls, &ProtocolConfig::default()).is_err());
    }
}
