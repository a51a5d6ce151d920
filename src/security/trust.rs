// src/security/trust.rs

use anyhow::{anyhow, Context, Result};
use base16ct::lower::encode_string;
use base64::Engine;
use parking_lot::RwLock;
use rustls_pemfile::certs;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::BufReader as StdBufReader;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio_rustls::rustls::pki_types::CertificateDer;

use crate::config::TrustConfig;
use crate::events::{
    dispatcher,
    model::{ConnectionRole, LogEvent, LogLevel, TrustDecisionEvent},
};

/// How unknown peer certificates are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustMode {
    /// Accept everything, remember what was seen.
    Open,
    /// Accept only fingerprints loaded from the trusted dir (or added at runtime).
    Allowlist,
    /// Accept and remember a fingerprint the first time it is seen.
    Tofu,
}

impl FromStr for TrustMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(TrustMode::Open),
            "allowlist" => Ok(TrustMode::Allowlist),
            "tofu" => Ok(TrustMode::Tofu),
            _ => Err(()),
        }
    }
}

/// Parsed + normalized trust policy derived from configuration
#[derive(Debug, Clone)]
pub struct EffectiveTrustPolicy {
    pub mode: TrustMode,
    pub trusted_cert_dir: Option<String>,
    pub observed_dir: Option<String>,
    pub pin_fingerprints: Vec<String>,
}

impl Default for EffectiveTrustPolicy {
    fn default() -> Self {
        Self {
            mode: TrustMode::Tofu,
            trusted_cert_dir: None,
            observed_dir: None,
            pin_fingerprints: vec![],
        }
    }
}

impl EffectiveTrustPolicy {
    pub fn from_config(cfg: &TrustConfig) -> Self {
        let mode = cfg
            .mode
            .as_deref()
            .and_then(|s| TrustMode::from_str(s).ok())
            .unwrap_or(TrustMode::Tofu);
        Self {
            mode,
            trusted_cert_dir: cfg.trusted_cert_dir.clone(),
            observed_dir: cfg.observed_dir.clone(),
            pin_fingerprints: cfg.pin_fingerprints.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecisionOutcome {
    Accept,
    Reject,
}

#[derive(Debug, Clone)]
pub struct TrustDecision {
    pub outcome: TrustDecisionOutcome,
    pub reason: &'static str,
    pub fingerprint: Option<String>,
    pub subject: Option<String>,
    pub stored: bool,
}

impl TrustDecision {
    fn accept(reason: &'static str, fp: Option<String>, subject: Option<String>, stored: bool) -> Self {
        Self {
            outcome: TrustDecisionOutcome::Accept,
            reason,
            fingerprint: fp,
            subject,
            stored,
        }
    }
    fn reject(reason: &'static str, fp: Option<String>, subject: Option<String>) -> Self {
        Self {
            outcome: TrustDecisionOutcome::Reject,
            reason,
            fingerprint: fp,
            subject,
            stored: false,
        }
    }
    pub fn is_accept(&self) -> bool {
        self.outcome == TrustDecisionOutcome::Accept
    }
}

/// Trust store shared by every TLS client of one manager (and by an object server).
///
/// Verifier callbacks of concurrent handshakes add fingerprints through `&self`,
/// so the accepted set lives behind a lock.
#[derive(Debug)]
pub struct TrustManager {
    policy: EffectiveTrustPolicy,
    accepted: RwLock<HashSet<String>>,
}

impl TrustManager {
    pub fn new(policy: EffectiveTrustPolicy) -> Self {
        let initial = policy
            .trusted_cert_dir
            .as_deref()
            .and_then(|dir| load_trusted_fingerprints(dir).ok())
            .unwrap_or_default();
        Self {
            policy,
            accepted: RwLock::new(initial),
        }
    }

    pub fn policy(&self) -> &EffectiveTrustPolicy {
        &self.policy
    }

    pub fn is_trusted(&self, fingerprint: &str) -> bool {
        self.accepted.read().contains(fingerprint)
    }

    /// Add a fingerprint to the accepted set; returns false when it was already present.
    pub fn trust(&self, fingerprint: impl Into<String>) -> bool {
        self.accepted.write().insert(fingerprint.into())
    }

    pub fn accepted_fingerprints(&self) -> Vec<String> {
        let mut v: Vec<String> = self.accepted.read().iter().cloned().collect();
        v.sort();
        v
    }

    /// Evaluate a peer chain (leaf first) and report the decision as a trust event.
    pub fn evaluate(&self, chain: &[CertificateDer<'_>], role: ConnectionRole) -> TrustDecision {
        let decision = self.decide(chain);
        let mut meta = dispatcher::meta(
            "trust",
            if decision.is_accept() {
                LogLevel::Info
            } else {
                LogLevel::Warn
            },
        );
        meta.corr_id = Some(dispatcher::correlation_id());
        dispatcher::emit(LogEvent::TrustDecision(TrustDecisionEvent {
            meta,
            role,
            decision: format!("{:?}", decision.outcome),
            reason: decision.reason.to_string(),
            mode: format!("{:?}", self.policy.mode),
            fingerprint: decision.fingerprint.clone(),
            subject: decision.subject.clone(),
            stored: decision.stored,
        }));
        decision
    }

    fn decide(&self, chain: &[CertificateDer<'_>]) -> TrustDecision {
        let Some(leaf) = chain.first() else {
            return TrustDecision::reject("no-leaf-cert", None, None);
        };
        let fp = spki_fingerprint(leaf);
        let subject = certificate_common_name(leaf.as_ref());

        if !self.policy.pin_fingerprints.is_empty()
            && !self.policy.pin_fingerprints.iter().any(|p| p == &fp)
        {
            return TrustDecision::reject("fp-pin-mismatch", Some(fp), subject);
        }

        let seen = self.is_trusted(&fp);
        match self.policy.mode {
            TrustMode::Allowlist if seen => {
                TrustDecision::accept("present-in-trusted", Some(fp), subject, false)
            }
            TrustMode::Allowlist => {
                self.observe(leaf, &fp);
                TrustDecision::reject("not-in-trusted", Some(fp), subject)
            }
            TrustMode::Tofu if seen => TrustDecision::accept("seen-before", Some(fp), subject, false),
            TrustMode::Tofu => {
                self.trust(fp.clone());
                let stored = self.observe(leaf, &fp);
                TrustDecision::accept("new-tofu", Some(fp), subject, stored)
            }
            TrustMode::Open => {
                let stored = if seen {
                    false
                } else {
                    self.trust(fp.clone());
                    self.observe(leaf, &fp)
                };
                TrustDecision::accept("open-policy", Some(fp), subject, stored)
            }
        }
    }

    fn observe(&self, leaf: &CertificateDer<'_>, fp: &str) -> bool {
        match self.policy.observed_dir.as_deref() {
            Some(dir) => store_observed_cert(dir, fp, pem_encode(leaf).as_bytes()).is_ok(),
            None => false,
        }
    }
}

impl Default for TrustManager {
    fn default() -> Self {
        Self::new(EffectiveTrustPolicy::default())
    }
}

fn pem_encode(cert: &CertificateDer<'_>) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(cert.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Extract SHA-256 fingerprint of certificate SubjectPublicKeyInfo (SPKI).
/// Unparsable input falls back to hashing the full DER.
pub fn spki_fingerprint(cert: &CertificateDer<'_>) -> String {
    let der = cert.as_ref();
    let mut h = Sha256::new();
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, parsed)) => h.update(parsed.tbs_certificate.subject_pki.raw),
        Err(_) => h.update(der),
    }
    encode_string(&h.finalize())
}

/// Subject common name of a DER certificate; this is the certificate id.
pub fn certificate_common_name(der: &[u8]) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(der).ok()?;
    let cn = parsed
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(|s| s.to_string());
    cn
}

/// Compute SPKI fingerprint from PEM-encoded certificate bytes.
pub fn spki_fingerprint_from_pem_bytes(pem_bytes: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(pem_bytes);
    let certificates = certs(&mut cursor).context("failed to parse certificate PEM")?;
    let first = certificates
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no certificate entries found"))?;
    Ok(spki_fingerprint(&CertificateDer::from(first)))
}

/// Load all PEM certs from directory and return set of fingerprints
pub fn load_trusted_fingerprints(dir: &str) -> std::io::Result<HashSet<String>> {
    let mut set = HashSet::new();
    let path = PathBuf::from(dir);
    if !path.exists() {
        return Ok(set);
    }
    for entry in std::fs::read_dir(path)?.flatten() {
        let p = entry.path();
        let is_pem = p
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("pem"))
            .unwrap_or(false);
        if !is_pem {
            continue;
        }
        if let Ok(f) = std::fs::File::open(&p) {
            let mut reader = StdBufReader::new(f);
            if let Ok(list) = certs(&mut reader) {
                for c in list {
                    set.insert(spki_fingerprint(&CertificateDer::from(c)));
                }
            }
        }
    }
    Ok(set)
}

/// Store a newly observed certificate in PEM form using its fingerprint as filename
pub fn store_observed_cert(dir: &str, fingerprint: &str, pem_bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = Path::new(dir).join(format!("{}.pem", fingerprint));
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, pem_bytes)
}
