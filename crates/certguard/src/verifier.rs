//! Underlying chain verifier
//!
//! [`CertVerifier`] is the black-box X.509 verifier the pipeline runs after
//! augmentation. [`RustlsCertVerifier`] implements it with rustls'
//! `WebPkiServerVerifier`: revocation data attached to the chain during
//! augmentation is handed over as CRLs, and a leaf OCSP response naming the
//! leaf that says `revoked` fails the verification.

use crate::blacklist::{BlacklistStatus, SpkiBlacklist};
use crate::cert::{
    trust_anchor_certificates, CertStatus, CertVerifyResult, Certificate, RevocationKind,
    VerifyParams,
};
use crate::error::{CertError, CertVerifyError, GuardError};
use crate::revocation::ocsp::OcspResponse;
use async_trait::async_trait;
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, ServerName, TrustAnchor, UnixTime,
};
use rustls::{CertificateError as TlsCertificateError, Error as RustlsError, RootCertStore};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Chain verification primitive
#[async_trait]
pub trait CertVerifier: Send + Sync {
    /// Verify `params.chain` for `params.hostname`
    ///
    /// `blacklist` is the snapshot current when verification started.
    async fn verify(
        &self,
        params: &VerifyParams,
        blacklist: Option<Arc<SpkiBlacklist>>,
    ) -> Result<CertVerifyResult, CertVerifyError>;
}

/// rustls/webpki backed verifier
pub struct RustlsCertVerifier {
    roots: Arc<RootCertStore>,
    root_certs: Vec<Arc<Certificate>>,
    anchors: Vec<Arc<Certificate>>,
    provider: Arc<CryptoProvider>,
    public_roots: bool,
}

impl RustlsCertVerifier {
    /// Trust the Mozilla root program via webpki-roots
    pub fn with_public_roots() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots, vec![], true)
    }

    /// Trust exactly `roots`
    ///
    /// `anchors` are the parsed forms of private roots in `roots`, used to
    /// complete the verified chain; `public_roots` marks the store as the
    /// built-in one.
    pub fn with_roots(roots: RootCertStore, anchors: Vec<Arc<Certificate>>, public_roots: bool) -> Self {
        Self {
            root_certs: trust_anchor_certificates(&roots.roots),
            roots: Arc::new(roots),
            anchors,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            public_roots,
        }
    }

    /// Trust DER `anchors`, optionally on top of the public roots
    pub fn from_anchor_ders(ders: &[Vec<u8>], include_public: bool) -> Result<Self, GuardError> {
        let mut roots = RootCertStore::empty();
        if include_public {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let mut anchors = Vec::with_capacity(ders.len());
        for der in ders {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|e| GuardError::CertificateError(format!("Invalid trust anchor: {}", e)))?;
            anchors.push(Arc::new(Certificate::from_der(der)?));
        }

        Ok(Self::with_roots(roots, anchors, include_public))
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Every trust anchor this verifier accepts
    pub fn trust_anchors(&self) -> &[TrustAnchor<'static>] {
        &self.roots.roots
    }

    /// Private anchor issuing the last presented certificate, if any
    fn private_anchor_for(&self, chain: &[Arc<Certificate>]) -> Option<&Arc<Certificate>> {
        let last = chain.last()?;
        if last.is_self_issued() {
            return None;
        }
        self.anchors.iter().find(|a| a.subject() == last.issuer())
    }

    /// Root store anchor issuing the last presented certificate, if any
    fn trust_anchor_for(&self, chain: &[Arc<Certificate>]) -> Option<&Arc<Certificate>> {
        let last = chain.last()?;
        if last.is_self_issued() {
            return None;
        }
        self.root_certs.iter().find(|r| r.subject() == last.issuer())
    }

    fn webpki_verifier(&self, crls: Vec<CertificateRevocationListDer<'static>>) -> Result<Arc<WebPkiServerVerifier>, CertError> {
        let base = || WebPkiServerVerifier::builder_with_provider(Arc::clone(&self.roots), Arc::clone(&self.provider));

        if !crls.is_empty() {
            match base().with_crls(crls).allow_unknown_revocation_status().build() {
                Ok(verifier) => return Ok(verifier),
                Err(e) => warn!(error = %e, "Attached CRLs rejected, verifying without them"),
            }
        }
        base()
            .build()
            .map_err(|e| CertError::Invalid(format!("Verifier setup failed: {}", e)))
    }

    fn run_webpki(&self, params: &VerifyParams) -> Result<(), CertError> {
        let Some(leaf) = params.leaf() else {
            return Err(CertError::Invalid("empty certificate chain".to_string()));
        };
        let server_name = ServerName::try_from(params.hostname.as_str())
            .map_err(|_| CertError::CommonNameInvalid)?;

        let crls = params
            .chain
            .iter()
            .filter_map(|c| c.revocation_response(RevocationKind::Crl))
            .map(CertificateRevocationListDer::from)
            .collect::<Vec<_>>();
        let verifier = self.webpki_verifier(crls)?;

        let end_entity = CertificateDer::from(leaf.der());
        let intermediates = params.chain[1..]
            .iter()
            .map(|c| CertificateDer::from(c.der()))
            .collect::<Vec<_>>();
        let ocsp = leaf.revocation_response(RevocationKind::Ocsp).unwrap_or_default();

        verifier
            .verify_server_cert(&end_entity, &intermediates, &server_name, &ocsp, UnixTime::now())
            .map(|_| ())
            .map_err(map_rustls_error)
    }
}

impl fmt::Debug for RustlsCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RustlsCertVerifier")
            .field("roots", &self.roots.len())
            .field("root_certs", &self.root_certs.len())
            .field("anchors", &self.anchors.len())
            .field("public_roots", &self.public_roots)
            .finish()
    }
}

#[async_trait]
impl CertVerifier for RustlsCertVerifier {
    async fn verify(
        &self,
        params: &VerifyParams,
        blacklist: Option<Arc<SpkiBlacklist>>,
    ) -> Result<CertVerifyResult, CertVerifyError> {
        let mut chain = params.chain.clone();
        let anchor = self.private_anchor_for(&chain).cloned();
        let root = anchor
            .clone()
            .or_else(|| self.trust_anchor_for(&chain).cloned());
        if let Some(root) = root {
            chain.push(root);
        }

        let mut result = CertVerifyResult::for_chain(&chain);
        if params.did_revocation_check {
            result.cert_status.insert(CertStatus::REV_CHECKING_ENABLED);
        }

        let mut error = self.run_webpki(params).err();

        if let Some(leaf) = params.leaf() {
            let issuer = chain.get(1).and_then(|c| c.as_issuer());
            let leaf_revoked = leaf
                .revocation_response(RevocationKind::Ocsp)
                .and_then(|der| OcspResponse::parse(&der).ok())
                .is_some_and(|response| {
                    response.is_for(leaf.der(), issuer) && response.is_revoked()
                });
            if leaf_revoked {
                debug!(subject = leaf.subject(), "Attached OCSP response reports revoked");
                error = Some(CertError::stricter(error, CertError::Revoked));
            }
        }

        if let Some(snapshot) = &blacklist {
            if snapshot.check_certificate(&result.public_key_hashes) == BlacklistStatus::Revoked {
                error = Some(CertError::stricter(error, CertError::Revoked));
            }
        }

        match error {
            Some(error) => {
                result.cert_status.insert(status_for(&error));
                Err(CertVerifyError::new(error, result))
            }
            None => {
                result.is_issued_by_known_root = self.public_roots && anchor.is_none();
                Ok(result)
            }
        }
    }
}

/// Status bit recorded for `error`
pub fn status_for(error: &CertError) -> CertStatus {
    match error {
        CertError::Revoked => CertStatus::REVOKED,
        CertError::PinnedKeyNotInChain(_) => CertStatus::PINNED_KEY_MISSING,
        CertError::AuthorityInvalid => CertStatus::AUTHORITY_INVALID,
        CertError::DateInvalid => CertStatus::DATE_INVALID,
        CertError::CommonNameInvalid => CertStatus::COMMON_NAME_INVALID,
        CertError::UnableToCheckRevocation => CertStatus::UNABLE_TO_CHECK_REVOCATION,
        CertError::Invalid(_) => CertStatus::INVALID,
    }
}

fn map_rustls_error(e: RustlsError) -> CertError {
    let RustlsError::InvalidCertificate(cert_error) = e else {
        return CertError::Invalid(e.to_string());
    };

    match cert_error {
        TlsCertificateError::Revoked => CertError::Revoked,
        TlsCertificateError::UnknownIssuer => CertError::AuthorityInvalid,
        TlsCertificateError::Expired | TlsCertificateError::NotValidYet => CertError::DateInvalid,
        TlsCertificateError::NotValidForName => CertError::CommonNameInvalid,
        TlsCertificateError::UnknownRevocationStatus => CertError::UnableToCheckRevocation,
        other => {
            // Context-carrying variants differ between rustls releases
            let name = format!("{:?}", other);
            if name.starts_with("Expired") || name.starts_with("NotValidYet") {
                CertError::DateInvalid
            } else if name.starts_with("NotValidForName") {
                CertError::CommonNameInvalid
            } else {
                CertError::Invalid(name)
            }
        }
    }
}
