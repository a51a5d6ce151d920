// src/security/certs.rs
// Local certificate material: load from PEM or generate a self-signed one.

use anyhow::{anyhow, Context, Result};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::io::BufReader as StdBufReader;
use std::path::Path;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::security::trust::{certificate_common_name, spki_fingerprint};

/// Certificate chain + private key of this process, plus the certificate id
/// (subject CN) that is presented to peers.
#[derive(Debug)]
pub struct LocalCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    cert_pem: Option<String>,
    key_pem: Option<String>,
    id: String,
    fingerprint: String,
}

impl LocalCertificate {
    /// Self-signed ECDSA P-256 certificate whose subject CN is `common_name`.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key_pair = rcgen::KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;
        let der = cert.der().clone();
        let fingerprint = spki_fingerprint(&der);
        Ok(Self {
            chain: vec![der],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
            cert_pem: Some(cert.pem()),
            key_pem: Some(key_pair.serialize_pem()),
            id: common_name.to_string(),
            fingerprint,
        })
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_file = fs::File::open(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?;
        let chain: Vec<CertificateDer<'static>> = certs(&mut StdBufReader::new(cert_file))
            .context("failed to parse certificate PEM")?
            .into_iter()
            .map(CertificateDer::from)
            .collect();
        let leaf = chain
            .first()
            .ok_or_else(|| anyhow!("no certificate in {}", cert_path.display()))?;
        let id = certificate_common_name(leaf.as_ref())
            .ok_or_else(|| anyhow!("certificate {} has no common name", cert_path.display()))?;
        let fingerprint = spki_fingerprint(leaf);
        let key = load_private_key(key_path)?;
        Ok(Self {
            chain,
            key,
            cert_pem: None,
            key_pem: None,
            id,
            fingerprint,
        })
    }

    /// Load the pair when both files exist, otherwise generate one and write it there.
    pub fn load_or_generate(cert_path: &Path, key_path: &Path, common_name: &str) -> Result<Self> {
        if cert_path.exists() && key_path.exists() {
            return Self::load(cert_path, key_path);
        }
        let generated = Self::generate(common_name)?;
        generated.write_pem(cert_path, key_path)?;
        Ok(generated)
    }

    /// Persist a generated pair. Key gets 0600, cert 0644 on unix.
    pub fn write_pem(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let (Some(cert_pem), Some(key_pem)) = (&self.cert_pem, &self.key_pem) else {
            anyhow::bail!("certificate was loaded from disk; nothing to write");
        };
        write_file(cert_path, cert_pem.as_bytes(), 0o644)?;
        write_file(key_path, key_pem.as_bytes(), 0o600)?;
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        self.chain.clone()
    }
    pub fn key(&self) -> PrivateKeyDer<'static> {
        self.key.clone_key()
    }
    pub fn cert_pem(&self) -> Option<&str> {
        self.cert_pem.as_deref()
    }
}

fn load_private_key(key_path: &Path) -> Result<PrivateKeyDer<'static>> {
    let open = || {
        fs::File::open(key_path).with_context(|| format!("failed to open {}", key_path.display()))
    };
    let mut pkcs8 = pkcs8_private_keys(&mut StdBufReader::new(open()?))
        .context("failed to parse pkcs8 key")?;
    if let Some(key) = pkcs8.pop() {
        return Ok(PrivateKeyDer::Pkcs8(key.into()));
    }
    let mut rsa =
        rsa_private_keys(&mut StdBufReader::new(open()?)).context("failed to parse rsa key")?;
    match rsa.pop() {
        Some(key) => Ok(PrivateKeyDer::Pkcs1(key.into())),
        None => Err(anyhow!("no private key in {}", key_path.display())),
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
