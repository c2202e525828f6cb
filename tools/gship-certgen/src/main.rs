// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Development certificate generator.
//!
//! Writes a throwaway CA plus server and client certificates (PEM) for
//! exercising the engine's mTLS endpoints locally:
//!
//! ```bash
//! gship-certgen --out certs --host localhost
//! gship --config config.yaml   # point tls files at certs/
//! gshipctl --tls --cert certs/client.crt --key certs/client.key --ca certs/ca.crt status
//! ```
//!
//! Not for production use; the CA key is written next to everything else.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};

/// Generate a development CA, server and client certificate set.
#[derive(Parser, Debug)]
#[command(name = "gship-certgen")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Output directory for the PEM files.
    #[arg(short, long, default_value = "certs")]
    out: PathBuf,

    /// Hostname placed in the server certificate's SAN list.
    #[arg(long, default_value = "localhost")]
    host: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;

    let (ca_cert, ca_key) = make_ca()?;
    write_pair(&args.out, "ca", &ca_cert.pem(), &ca_key.serialize_pem())?;

    let (server_cert, server_key) = make_leaf(
        &args.host,
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca_cert,
        &ca_key,
    )?;
    write_pair(
        &args.out,
        "server",
        &server_cert.pem(),
        &server_key.serialize_pem(),
    )?;

    let (client_cert, client_key) = make_leaf(
        "gshipctl",
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca_cert,
        &ca_key,
    )?;
    write_pair(
        &args.out,
        "client",
        &client_cert.pem(),
        &client_key.serialize_pem(),
    )?;

    println!(
        "wrote ca/server/client certificate pairs to {}",
        args.out.display()
    );
    Ok(())
}

fn make_ca() -> anyhow::Result<(Certificate, KeyPair)> {
    let key = KeyPair::generate().context("failed to generate CA key")?;
    let mut params =
        CertificateParams::new(Vec::<String>::new()).context("failed to build CA params")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "GSHIP Development CA");
    params
        .distinguished_name
        .push(DnType::CommonName, "gship-dev-ca");
    let cert = params.self_signed(&key).context("failed to sign CA cert")?;
    Ok((cert, key))
}

fn make_leaf(
    name: &str,
    purpose: ExtendedKeyUsagePurpose,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> anyhow::Result<(Certificate, KeyPair)> {
    let key = KeyPair::generate().context("failed to generate leaf key")?;
    let mut params = CertificateParams::new(vec![name.to_string()])
        .with_context(|| format!("failed to build params for {name}"))?;
    params.distinguished_name.push(DnType::CommonName, name);
    params.extended_key_usages.push(purpose);
    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .with_context(|| format!("failed to sign certificate for {name}"))?;
    Ok((cert, key))
}

fn write_pair(dir: &Path, stem: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
    let cert_path = dir.join(format!("{stem}.crt"));
    let key_path = dir.join(format!("{stem}.key"));
    fs::write(&cert_path, cert_pem)
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    fs::write(&key_path, key_pem)
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_chain_is_pem_shaped() {
        let (ca_cert, ca_key) = make_ca().expect("ca");
        let (server_cert, server_key) = make_leaf(
            "localhost",
            ExtendedKeyUsagePurpose::ServerAuth,
            &ca_cert,
            &ca_key,
        )
        .expect("server");

        assert!(ca_cert.pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(server_cert.pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(server_key.serialize_pem().contains("PRIVATE KEY"));
        assert!(ca_key.serialize_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn write_pair_places_both_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (ca_cert, ca_key) = make_ca().expect("ca");
        write_pair(dir.path(), "ca", &ca_cert.pem(), &ca_key.serialize_pem()).expect("write");
        assert!(dir.path().join("ca.crt").is_file());
        assert!(dir.path().join("ca.key").is_file());
    }
}
