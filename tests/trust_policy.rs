use localcomm::config::TrustConfig;
use localcomm::events::ConnectionRole;
use localcomm::security::trust::{
    spki_fingerprint, spki_fingerprint_from_pem_bytes, EffectiveTrustPolicy, TrustDecisionOutcome,
    TrustManager, TrustMode,
};
use localcomm::security::LocalCertificate;
use tokio_rustls::rustls::pki_types::CertificateDer;

// Minimal dummy DER cert (not a real certificate) just to test fallback hashing path.
const DUMMY_CERT: &[u8] = b"\x30\x03\x02\x01\x01"; // ASN.1 SEQUENCE of INTEGER 1

fn dummy() -> CertificateDer<'static> {
    CertificateDer::from(DUMMY_CERT.to_vec())
}

fn manager(mode: &str, pins: Option<Vec<String>>) -> TrustManager {
    TrustManager::new(EffectiveTrustPolicy::from_config(&TrustConfig {
        mode: Some(mode.into()),
        pin_fingerprints: pins,
        ..Default::default()
    }))
}

#[test]
fn spki_fingerprint_fallback_hashes() {
    let fp1 = spki_fingerprint(&dummy());
    let fp2 = spki_fingerprint(&dummy());
    assert_eq!(fp1, fp2, "fingerprint must be deterministic for identical input");
    assert_eq!(fp1.len(), 64);
}

#[test]
fn mode_parsing_defaults_to_tofu() {
    let policy = EffectiveTrustPolicy::from_config(&TrustConfig::default());
    assert_eq!(policy.mode, TrustMode::Tofu);
    let policy = EffectiveTrustPolicy::from_config(&TrustConfig {
        mode: Some("ALLOWLIST".into()),
        ..Default::default()
    });
    assert_eq!(policy.mode, TrustMode::Allowlist);
    assert!("bogus".parse::<TrustMode>().is_err());
}

#[test]
fn open_mode_accepts_dummy_cert() {
    let tm = manager("open", None);
    let decision = tm.evaluate(&[dummy()], ConnectionRole::Outbound);
    assert!(matches!(decision.outcome, TrustDecisionOutcome::Accept));
    assert!(tm.is_trusted(&spki_fingerprint(&dummy())));
}

#[test]
fn fingerprint_pin_enforced() {
    let fp = spki_fingerprint(&dummy());
    let pinned = manager("open", Some(vec![fp.clone()]));
    assert_eq!(
        pinned.evaluate(&[dummy()], ConnectionRole::Inbound).outcome,
        TrustDecisionOutcome::Accept,
        "expected accept when fingerprint pinned"
    );

    // Now mismatch
    let other = manager("open", Some(vec!["deadbeef".into()]));
    let decision = other.evaluate(&[dummy()], ConnectionRole::Inbound);
    assert_eq!(decision.outcome, TrustDecisionOutcome::Reject);
    assert_eq!(decision.reason, "fp-pin-mismatch");
}

#[test]
fn tofu_learns_first_sighting() {
    let tm = manager("tofu", None);
    let first = tm.evaluate(&[dummy()], ConnectionRole::Outbound);
    assert_eq!(first.reason, "new-tofu");
    let second = tm.evaluate(&[dummy()], ConnectionRole::Outbound);
    assert_eq!(second.reason, "seen-before");
    assert_eq!(tm.accepted_fingerprints().len(), 1);
}

#[test]
fn allowlist_uses_trusted_dir_and_stores_rejects() {
    let tmp = tempfile::tempdir().unwrap();
    let trusted = tmp.path().join("trusted");
    let observed = tmp.path().join("observed");
    std::fs::create_dir_all(&trusted).unwrap();

    let known = LocalCertificate::generate("MyObjectCertificate").unwrap();
    let pem = known.cert_pem().unwrap().to_string();
    std::fs::write(trusted.join("known.pem"), &pem).unwrap();
    assert_eq!(
        spki_fingerprint_from_pem_bytes(pem.as_bytes()).unwrap(),
        known.fingerprint()
    );

    let tm = TrustManager::new(EffectiveTrustPolicy {
        mode: TrustMode::Allowlist,
        trusted_cert_dir: Some(trusted.to_string_lossy().into_owned()),
        observed_dir: Some(observed.to_string_lossy().into_owned()),
        pin_fingerprints: vec![],
    });
    assert!(tm.is_trusted(known.fingerprint()));
    assert!(tm
        .evaluate(&known.chain(), ConnectionRole::Outbound)
        .is_accept());

    let stranger = LocalCertificate::generate("Stranger").unwrap();
    let decision = tm.evaluate(&stranger.chain(), ConnectionRole::Outbound);
    assert_eq!(decision.outcome, TrustDecisionOutcome::Reject);
    assert_eq!(decision.subject.as_deref(), Some("Stranger"));
    assert!(observed
        .join(format!("{}.pem", stranger.fingerprint()))
        .exists());

    // Promote at runtime.
    assert!(tm.trust(stranger.fingerprint()));
    assert!(tm
        .evaluate(&stranger.chain(), ConnectionRole::Outbound)
        .is_accept());
}

#[test]
fn certificates_round_trip_through_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let cert_path = tmp.path().join("certs/local_cert.pem");
    let key_path = tmp.path().join("certs/local_key.pem");

    let generated =
        LocalCertificate::load_or_generate(&cert_path, &key_path, "srvId/usrId/instId").unwrap();
    assert!(cert_path.exists() && key_path.exists());
    let loaded =
        LocalCertificate::load_or_generate(&cert_path, &key_path, "ignored").unwrap();
    assert_eq!(loaded.id(), "srvId/usrId/instId");
    assert_eq!(loaded.fingerprint(), generated.fingerprint());
    assert!(loaded.write_pem(&cert_path, &key_path).is_err());
}
