// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS termination for the ingest and management endpoints.
//!
//! Both endpoints speak TLS 1.3 only - older protocol versions fail the
//! handshake. Supplying a CA file turns on mutual TLS: the verifier
//! requires and validates a client certificate before gRPC ever sees the
//! connection.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

/// Build a TLS 1.3-only server config. A CA path enables mutual TLS.
pub fn server_config(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> anyhow::Result<ServerConfig> {
    let certs = load_certs(Path::new(cert_file))?;
    let key = load_key(Path::new(key_file))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable in the crypto provider")?;

    let mut config = match ca_file {
        Some(ca) if !ca.is_empty() => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(Path::new(ca))? {
                roots
                    .add(cert)
                    .context("invalid certificate in client CA pool")?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .context("failed to build client certificate verifier")?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .context("invalid server certificate chain or key")?
        }
        _ => builder
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("invalid server certificate chain or key")?,
    };

    // gRPC negotiates HTTP/2 through ALPN.
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.with_context(|| format!("failed to parse PEM in {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("failed to parse key in {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Accept loop that completes handshakes before handing connections to
/// gRPC. Handshake failures (wrong protocol version, missing client
/// cert) are logged and dropped without disturbing the stream.
pub fn tls_incoming(
    listener: TcpListener,
    acceptor: TlsAcceptor,
) -> impl tokio_stream::Stream<Item = std::io::Result<TlsStream<TcpStream>>> {
    async_stream::stream! {
        loop {
            match listener.accept().await {
                Ok((tcp, addr)) => match acceptor.accept(tcp).await {
                    Ok(tls) => yield Ok(tls),
                    Err(err) => {
                        warn!(peer = %addr, error = %err, "TLS handshake rejected");
                    }
                },
                Err(err) => yield Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // A throwaway self-signed certificate + key for config-building
    // tests (not used for real handshakes).
    const TEST_CERT: &str = "-----BEGIN CERTIFICATE-----\n\
MIIBhTCCASugAwIBAgIUQkNkYXRhZm9yY29uZmlndGVzdDAKBggqhkjOPQQDAjAU\n\
MRIwEAYDVQQDDAlsb2NhbGhvc3QwHhcNMjQwMTAxMDAwMDAwWhcNMzQwMTAxMDAw\n\
MDAwWjAUMRIwEAYDVQQDDAlsb2NhbGhvc3QwWTATBgcqhkjOPQIBBggqhkjOPQMB\n\
BwNCAAQ0uKnhlyzmLkEnTxy1V5L0sg7Lx5w2nF2fQkCGmkQSEC3AjC6lHwWJ1n6S\n\
F0A3BHbZTCSpanqZcncvPVMIsjIao1MwUTAdBgNVHQ4EFgQUEXAMPLEKEYIDENTIF\n\
IERXXXXXXXXwHwYDVR0jBBgwFoAUEXAMPLEKEYIDENTIFIERXXXXXXXXwDwYDVR0T\n\
AQH/BAUwAwEB/zAKBggqhkjOPQQDAgNIADBFAiEA7HkyDfXhY8Fmp6JPPbXW7Mvn\n\
2t3zLYkZlIk5aSM0uVUCIDAYDVQQDDAlsb2NhbGhvc3RFWFhYWFhYWFhYWFhYWFhY\n\
-----END CERTIFICATE-----\n";

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = server_config("/nonexistent/tls.crt", "/nonexistent/tls.key", None).unwrap_err();
        assert!(err.to_string().contains("failed to open"));
    }

    #[test]
    fn empty_pem_is_rejected() {
        let mut cert = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(cert, "not a certificate").expect("write");
        let err = server_config(
            cert.path().to_str().expect("path"),
            cert.path().to_str().expect("path"),
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }

    #[test]
    fn garbage_certificate_fails_config_build() {
        let mut cert = tempfile::NamedTempFile::new().expect("tempfile");
        cert.write_all(TEST_CERT.as_bytes()).expect("write");
        let mut key = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(key, "no key here").expect("write");
        // The mangled chain parses as PEM but cannot produce a working
        // identity, so config construction must fail, not panic.
        let result = server_config(
            cert.path().to_str().expect("path"),
            key.path().to_str().expect("path"),
            None,
        );
        assert!(result.is_err());
    }
}
