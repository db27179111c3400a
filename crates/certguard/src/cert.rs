//! Certificate, handle and verification result types
//!
//! Certificates are shared (`Arc<Certificate>`); handles onto them are not.
//! A [`CertHandle`] issued through a [`HandleLedger`] holds a lease that is
//! released when the handle is dropped, so a leaked handle shows up in
//! [`HandleLedger::outstanding`] and a double release cannot be expressed.

use crate::error::GuardError;
use crate::revocation::der;
use parking_lot::Mutex;
use rustls::pki_types::TrustAnchor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;
use x509_parser::der_parser::asn1_rs::FromDer;
use x509_parser::prelude::*;

/// Length of a SHA-256 digest in bytes
pub const SHA256_LEN: usize = 32;

/// SHA-256 digest of a certificate's SubjectPublicKeyInfo
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpkiHash([u8; SHA256_LEN]);

impl SpkiHash {
    pub const fn new(bytes: [u8; SHA256_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice; `None` unless the slice is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SHA256_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    /// Hash DER-encoded SubjectPublicKeyInfo bytes
    pub fn of_spki(spki_der: &[u8]) -> Self {
        let digest = Sha256::digest(spki_der);
        let mut out = [0u8; SHA256_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn from_hex(s: &str) -> Result<Self, GuardError> {
        let bytes = hex::decode(s.trim()).map_err(|e| GuardError::InvalidHash(e.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            GuardError::InvalidHash(format!("expected {} bytes, got {}", SHA256_LEN, bytes.len()))
        })
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for SpkiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpkiHash({})", self.to_hex())
    }
}

impl fmt::Display for SpkiHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SpkiHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SpkiHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SpkiHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Kind of revocation data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationKind {
    Ocsp,
    Crl,
}

impl fmt::Display for RevocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevocationKind::Ocsp => f.write_str("OCSP"),
            RevocationKind::Crl => f.write_str("CRL"),
        }
    }
}

#[derive(Debug, Default)]
struct AttachedRevocation {
    ocsp: Option<Vec<u8>>,
    crl: Option<Vec<u8>>,
}

/// Subject name and public key a certificate contributes as an issuer
///
/// These are the inputs of an OCSP CertID's issuer hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerKey {
    name_der: Vec<u8>,
    public_key: Vec<u8>,
}

impl IssuerKey {
    /// `name_der` is the DER Name, `public_key` the subjectPublicKey bits
    pub fn new(name_der: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            name_der,
            public_key,
        }
    }

    fn from_parsed(cert: &X509Certificate<'_>) -> Self {
        Self::new(
            cert.subject().as_raw().to_vec(),
            cert.public_key().subject_public_key.data.to_vec(),
        )
    }

    /// Issuer key of a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self, GuardError> {
        let (_, parsed) = parse_x509_certificate(der).map_err(|e| {
            GuardError::CertificateError(format!("Failed to parse issuer certificate: {}", e))
        })?;
        Ok(Self::from_parsed(&parsed))
    }

    pub fn name_hash(&self) -> [u8; SHA256_LEN] {
        sha256(&self.name_der)
    }

    pub fn key_hash(&self) -> [u8; SHA256_LEN] {
        sha256(&self.public_key)
    }
}

fn sha256(bytes: &[u8]) -> [u8; SHA256_LEN] {
    let mut out = [0u8; SHA256_LEN];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// A parsed (or synthetic) certificate
///
/// A certificate built from a trust anchor has no certificate encoding;
/// its `der` is the anchor's SubjectPublicKeyInfo.
#[derive(Debug)]
pub struct Certificate {
    der: Vec<u8>,
    spki_hash: SpkiHash,
    subject: String,
    issuer: String,
    issuer_key: Option<IssuerKey>,
    revocation: Mutex<AttachedRevocation>,
}

impl Certificate {
    /// Construct without parsing; the caller vouches for the fields
    pub fn new(
        der: Vec<u8>,
        spki_hash: SpkiHash,
        subject: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        Self {
            der,
            spki_hash,
            subject: subject.into(),
            issuer: issuer.into(),
            issuer_key: None,
            revocation: Mutex::new(AttachedRevocation::default()),
        }
    }

    /// Parse a DER-encoded X.509 certificate
    pub fn from_der(der: &[u8]) -> Result<Self, GuardError> {
        let (_, parsed) = parse_x509_certificate(der).map_err(|e| {
            GuardError::CertificateError(format!("Failed to parse certificate: {}", e))
        })?;

        let mut cert = Self::new(
            der.to_vec(),
            SpkiHash::of_spki(parsed.public_key().raw),
            parsed.subject().to_string(),
            parsed.issuer().to_string(),
        );
        cert.issuer_key = Some(IssuerKey::from_parsed(&parsed));
        Ok(cert)
    }

    /// Self-issued certificate standing in for a root store trust anchor
    pub fn from_trust_anchor(anchor: &TrustAnchor<'_>) -> Result<Self, GuardError> {
        // Anchors carry the contents of the Name and SPKI sequences
        let name_der = der::sequence(&[anchor.subject.as_ref()]);
        let spki_der = der::sequence(&[anchor.subject_public_key_info.as_ref()]);

        let (_, name) = X509Name::from_der(&name_der).map_err(|e| {
            GuardError::CertificateError(format!("Invalid trust anchor subject: {}", e))
        })?;
        let (_, spki) = SubjectPublicKeyInfo::from_der(&spki_der).map_err(|e| {
            GuardError::CertificateError(format!("Invalid trust anchor key: {}", e))
        })?;

        let subject = name.to_string();
        let public_key = spki.subject_public_key.data.to_vec();
        let spki_hash = SpkiHash::of_spki(&spki_der);
        let mut cert = Self::new(spki_der, spki_hash, subject.clone(), subject);
        cert.issuer_key = Some(IssuerKey::new(name_der, public_key));
        Ok(cert)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn spki_hash(&self) -> SpkiHash {
        self.spki_hash
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn is_self_issued(&self) -> bool {
        self.subject == self.issuer
    }

    /// Name and key this certificate signs with; `None` for synthetic ones
    pub fn as_issuer(&self) -> Option<&IssuerKey> {
        self.issuer_key.as_ref()
    }

    /// SHA-256 over the full DER encoding
    pub fn fingerprint(&self) -> [u8; SHA256_LEN] {
        sha256(&self.der)
    }

    /// Attach revocation data, replacing any previous response of that kind
    pub fn attach_revocation_response(&self, kind: RevocationKind, response: Vec<u8>) {
        let mut slot = self.revocation.lock();
        match kind {
            RevocationKind::Ocsp => slot.ocsp = Some(response),
            RevocationKind::Crl => slot.crl = Some(response),
        }
    }

    pub fn revocation_response(&self, kind: RevocationKind) -> Option<Vec<u8>> {
        let slot = self.revocation.lock();
        match kind {
            RevocationKind::Ocsp => slot.ocsp.clone(),
            RevocationKind::Crl => slot.crl.clone(),
        }
    }
}

/// Parse every anchor of a root store, skipping ones that do not decode
pub fn trust_anchor_certificates(anchors: &[TrustAnchor<'_>]) -> Vec<Arc<Certificate>> {
    anchors
        .iter()
        .filter_map(|anchor| match Certificate::from_trust_anchor(anchor) {
            Ok(cert) => Some(Arc::new(cert)),
            Err(e) => {
                warn!(error = %e, "Skipping trust anchor");
                None
            }
        })
        .collect()
}

/// Tracks outstanding certificate handles
#[derive(Debug, Clone, Default)]
pub struct HandleLedger {
    outstanding: Arc<AtomicUsize>,
    issued: Arc<AtomicUsize>,
}

impl HandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a leased handle onto `cert`
    pub fn lease(&self, cert: Arc<Certificate>) -> CertHandle {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.issued.fetch_add(1, Ordering::SeqCst);
        CertHandle {
            cert,
            _lease: Lease {
                outstanding: Arc::clone(&self.outstanding),
            },
        }
    }

    /// Handles issued and not yet dropped
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Handles issued over the ledger's lifetime
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Lease {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusively owned handle onto a certificate
#[derive(Debug)]
pub struct CertHandle {
    cert: Arc<Certificate>,
    _lease: Lease,
}

impl Deref for CertHandle {
    type Target = Certificate;

    fn deref(&self) -> &Certificate {
        &self.cert
    }
}

/// Chain built for revocation augmentation: leaf first, root last
#[derive(Debug, Default)]
pub struct RevocationCheckChain {
    certs: Vec<CertHandle>,
}

impl RevocationCheckChain {
    pub fn new(certs: Vec<CertHandle>) -> Self {
        Self { certs }
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn certs(&self) -> &[CertHandle] {
        &self.certs
    }

    pub fn into_certs(self) -> Vec<CertHandle> {
        self.certs
    }
}

/// Certificate status bit set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CertStatus(u32);

impl CertStatus {
    pub const REVOKED: CertStatus = CertStatus(1 << 0);
    pub const AUTHORITY_INVALID: CertStatus = CertStatus(1 << 1);
    pub const DATE_INVALID: CertStatus = CertStatus(1 << 2);
    pub const COMMON_NAME_INVALID: CertStatus = CertStatus(1 << 3);
    pub const PINNED_KEY_MISSING: CertStatus = CertStatus(1 << 4);
    pub const UNABLE_TO_CHECK_REVOCATION: CertStatus = CertStatus(1 << 5);
    pub const INVALID: CertStatus = CertStatus(1 << 6);
    pub const REV_CHECKING_ENABLED: CertStatus = CertStatus(1 << 16);

    const ERROR_MASK: u32 = 0xFFFF;

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, other: CertStatus) {
        self.0 |= other.0;
    }

    pub fn contains(&self, other: CertStatus) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any error bit set (informational bits excluded)
    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Outcome of chain verification
#[derive(Debug, Clone, Default)]
pub struct CertVerifyResult {
    /// Verified chain, leaf first
    pub verified_chain: Vec<Arc<Certificate>>,

    /// SPKI hashes of every certificate in `verified_chain`
    pub public_key_hashes: Vec<SpkiHash>,

    pub cert_status: CertStatus,

    /// Chain terminates in a root from the public/built-in store
    pub is_issued_by_known_root: bool,
}

impl CertVerifyResult {
    /// Result describing `chain` as-is, hashes filled in
    pub fn for_chain(chain: &[Arc<Certificate>]) -> Self {
        Self {
            verified_chain: chain.to_vec(),
            public_key_hashes: chain.iter().map(|c| c.spki_hash()).collect(),
            cert_status: CertStatus::empty(),
            is_issued_by_known_root: false,
        }
    }
}

/// Verification request parameters
#[derive(Debug, Clone)]
pub struct VerifyParams {
    pub hostname: String,

    /// Presented certificates, leaf first
    pub chain: Vec<Arc<Certificate>>,

    /// Extended-validation policy requested
    pub require_ev: bool,

    /// Revocation augmentation already ran for this verification
    pub did_revocation_check: bool,
}

impl VerifyParams {
    pub fn new(hostname: impl Into<String>, chain: Vec<Arc<Certificate>>) -> Self {
        Self {
            hostname: hostname.into(),
            chain,
            require_ev: false,
            did_revocation_check: false,
        }
    }

    pub fn leaf(&self) -> Option<&Arc<Certificate>> {
        self.chain.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(label: &str) -> Arc<Certificate> {
        Arc::new(Certificate::new(
            label.as_bytes().to_vec(),
            SpkiHash::of_spki(label.as_bytes()),
            format!("CN={}", label),
            "CN=issuer",
        ))
    }

    #[test]
    fn test_spki_hash_hex() {
        let hash = SpkiHash::new([0xAB; SHA256_LEN]);
        let parsed = SpkiHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(parsed, hash);
    }

    #[test]
    fn test_spki_hash_rejects_wrong_length() {
        assert!(SpkiHash::from_slice(&[0u8; 20]).is_none());
        assert!(matches!(
            SpkiHash::from_hex("abcd"),
            Err(GuardError::InvalidHash(_))
        ));
        assert!(SpkiHash::from_hex("not hex").is_err());
    }

    #[test]
    fn test_spki_hash_serde() {
        let hash = SpkiHash::new([0x01; SHA256_LEN]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: SpkiHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn test_ledger_tracks_handles() {
        let ledger = HandleLedger::new();
        let a = ledger.lease(cert("a"));
        let b = ledger.lease(cert("b"));
        assert_eq!(ledger.outstanding(), 2);
        assert_eq!(a.subject(), "CN=a");

        drop(a);
        assert_eq!(ledger.outstanding(), 1);
        drop(b);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.issued(), 2);
    }

    #[test]
    fn test_attach_revocation_response() {
        let c = cert("leaf");
        assert!(c.revocation_response(RevocationKind::Ocsp).is_none());

        c.attach_revocation_response(RevocationKind::Ocsp, vec![1, 2, 3]);
        c.attach_revocation_response(RevocationKind::Ocsp, vec![4]);
        assert_eq!(c.revocation_response(RevocationKind::Ocsp), Some(vec![4]));
        assert!(c.revocation_response(RevocationKind::Crl).is_none());
    }

    #[test]
    fn test_cert_status_bits() {
        let mut status = CertStatus::empty();
        status.insert(CertStatus::REV_CHECKING_ENABLED);
        assert!(!status.is_error());

        status.insert(CertStatus::REVOKED);
        assert!(status.is_error());
        assert!(status.contains(CertStatus::REVOKED));
        assert!(!status.contains(CertStatus::DATE_INVALID));
    }

    #[test]
    fn test_result_for_chain() {
        let chain = vec![cert("leaf"), cert("root")];
        let result = CertVerifyResult::for_chain(&chain);
        assert_eq!(result.public_key_hashes.len(), 2);
        assert_eq!(result.public_key_hashes[0], chain[0].spki_hash());
    }

    #[test]
    fn test_trust_anchor_matches_its_certificate() {
        let root = crate::testing::root("Anchor Root");
        let mut store = rustls::RootCertStore::empty();
        store.add(root.cert.der().clone()).unwrap();

        let parsed = Certificate::from_der(&root.der()).unwrap();
        let anchor = Certificate::from_trust_anchor(&store.roots[0]).unwrap();
        assert_eq!(anchor.subject(), parsed.subject());
        assert!(anchor.is_self_issued());
        assert_eq!(anchor.spki_hash(), parsed.spki_hash());
        assert_eq!(anchor.as_issuer(), parsed.as_issuer());
    }

    #[test]
    fn test_public_roots_parse() {
        let roots = trust_anchor_certificates(webpki_roots::TLS_SERVER_ROOTS);
        assert_eq!(roots.len(), webpki_roots::TLS_SERVER_ROOTS.len());
        assert!(roots.iter().all(|r| r.as_issuer().is_some()));
    }

    #[test]
    fn test_synthetic_certificate_has_no_issuer_key() {
        assert!(cert("a").as_issuer().is_none());
    }

    #[test]
    fn test_from_der_rejects_garbage() {
        let result = Certificate::from_der(&[0x00, 0x01, 0x02]);
        assert!(matches!(result, Err(GuardError::CertificateError(_))));
    }
}
