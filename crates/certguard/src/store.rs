//! Certificate store seam
//!
//! [`CertificateStore`] is everything augmentation needs from the platform:
//! chain enumeration, URL extraction, and a place to attach fetched
//! responses. [`X509CertificateStore`] implements it over x509-parser with
//! private anchor certificates and root store trust anchors.

use crate::cert::{
    trust_anchor_certificates, Certificate, HandleLedger, IssuerKey, RevocationCheckChain,
    RevocationKind, VerifyParams,
};
use crate::error::GuardError;
use crate::revocation::ocsp::OcspResponse;
use crate::revocation::{crl, is_time_valid_now, ocsp};
use rustls::pki_types::TrustAnchor;
use std::sync::Arc;
use tracing::{debug, warn};

/// Platform certificate primitives used by revocation augmentation
pub trait CertificateStore: Send + Sync {
    /// Chains to augment for `params`, each leaf first
    ///
    /// A chain that reached a trust anchor ends with it. Every handle
    /// returned is owned by the caller.
    fn build_revocation_check_chains(
        &self,
        params: &VerifyParams,
        require_ev: bool,
    ) -> Vec<RevocationCheckChain>;

    /// Fetchable OCSP URLs for `cert`, in preference order
    fn ocsp_urls(&self, cert: &Certificate, issuer: &Certificate) -> Vec<String>;

    /// CRL distribution point URLs for `cert`, in preference order
    fn crl_urls(&self, cert: &Certificate) -> Vec<String>;

    /// Attach `response` to `cert`; `false` if it was rejected
    fn set_revocation_response(
        &self,
        cert: &Certificate,
        response: &[u8],
        kind: RevocationKind,
    ) -> bool;

    fn is_time_valid_response(&self, response: &[u8], kind: RevocationKind) -> bool;

    /// `cert` terminates a chain and needs no revocation data of its own
    fn is_root(&self, cert: &Certificate) -> bool {
        cert.is_self_issued()
    }
}

/// x509-parser backed store over the presented chain plus trust anchors
#[derive(Debug, Default)]
pub struct X509CertificateStore {
    anchors: Vec<Arc<Certificate>>,
    roots: Vec<Arc<Certificate>>,
    ledger: HandleLedger,
}

impl X509CertificateStore {
    pub fn new(anchors: Vec<Arc<Certificate>>) -> Self {
        Self {
            anchors,
            roots: Vec::new(),
            ledger: HandleLedger::new(),
        }
    }

    /// Also end chains at `anchors`, typically a verifier's root store
    pub fn with_trust_anchors(mut self, anchors: &[TrustAnchor<'_>]) -> Self {
        self.roots.extend(trust_anchor_certificates(anchors));
        debug!(roots = self.roots.len(), "Loaded trust anchors into certificate store");
        self
    }

    /// Also end chains at the webpki-roots public roots
    pub fn with_public_roots(self) -> Self {
        self.with_trust_anchors(webpki_roots::TLS_SERVER_ROOTS)
    }

    /// Parse DER trust anchors
    pub fn from_anchor_ders(ders: &[Vec<u8>]) -> Result<Self, GuardError> {
        let anchors = ders
            .iter()
            .map(|der| Certificate::from_der(der).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(anchors))
    }

    /// Ledger tracking handles this store has issued
    pub fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }

    fn find_issuer<'a>(
        &'a self,
        cert: &Certificate,
        presented: &'a [Arc<Certificate>],
    ) -> Option<&'a Arc<Certificate>> {
        let fingerprint = cert.fingerprint();
        presented
            .iter()
            .chain(self.anchors.iter())
            .chain(self.roots.iter())
            .find(|candidate| {
                candidate.subject() == cert.issuer() && candidate.fingerprint() != fingerprint
            })
    }

    /// Issuer key of `cert` among the trust anchors
    fn anchor_issuer_key(&self, cert: &Certificate) -> Option<&IssuerKey> {
        self.anchors
            .iter()
            .chain(self.roots.iter())
            .find(|anchor| anchor.subject() == cert.issuer())
            .and_then(|anchor| anchor.as_issuer())
    }

    /// Walk issuer links from `start` until a root or a dead end
    fn walk(&self, start: &Arc<Certificate>, presented: &[Arc<Certificate>]) -> Vec<Arc<Certificate>> {
        let limit = presented.len() + self.anchors.len() + 1;
        let mut path = vec![Arc::clone(start)];

        while path.len() < limit {
            let Some(current) = path.last() else { break };
            if self.is_root(current) {
                break;
            }
            let Some(issuer) = self.find_issuer(current, presented) else {
                break;
            };
            if path.iter().any(|c| c.fingerprint() == issuer.fingerprint()) {
                break;
            }
            path.push(Arc::clone(issuer));
        }
        path
    }

    fn lease_chain(&self, path: Vec<Arc<Certificate>>) -> RevocationCheckChain {
        RevocationCheckChain::new(path.into_iter().map(|c| self.ledger.lease(c)).collect())
    }
}

impl CertificateStore for X509CertificateStore {
    /// The primary chain starts at the leaf. Presented certificates left off
    /// it get auxiliary chains of their own. EV policy does not change how
    /// chains are built here.
    fn build_revocation_check_chains(
        &self,
        params: &VerifyParams,
        _require_ev: bool,
    ) -> Vec<RevocationCheckChain> {
        let Some(leaf) = params.leaf() else {
            return vec![];
        };

        let primary = self.walk(leaf, &params.chain);
        let mut covered: Vec<[u8; 32]> = primary.iter().map(|c| c.fingerprint()).collect();
        let mut chains = vec![self.lease_chain(primary)];

        for cert in params.chain.iter().skip(1) {
            if covered.contains(&cert.fingerprint()) {
                continue;
            }
            let auxiliary = self.walk(cert, &params.chain);
            covered.extend(auxiliary.iter().map(|c| c.fingerprint()));
            debug!(subject = cert.subject(), len = auxiliary.len(), "Built auxiliary revocation chain");
            chains.push(self.lease_chain(auxiliary));
        }

        chains
    }

    fn ocsp_urls(&self, cert: &Certificate, issuer: &Certificate) -> Vec<String> {
        let responders = match ocsp::ocsp_responder_urls(cert.der()) {
            Ok(urls) if !urls.is_empty() => urls,
            Ok(_) => return vec![],
            Err(e) => {
                warn!(subject = cert.subject(), error = %e, "Could not read OCSP responders");
                return vec![];
            }
        };
        let Some(issuer_key) = issuer.as_issuer() else {
            warn!(subject = cert.subject(), issuer = issuer.subject(), "Issuer has no usable key");
            return vec![];
        };

        match ocsp::OcspRequestBuilder::with_issuer(cert.der(), issuer_key) {
            Ok(builder) => {
                let request = builder.build();
                responders
                    .iter()
                    .map(|responder| ocsp::ocsp_get_url(responder, &request))
                    .collect()
            }
            Err(e) => {
                warn!(subject = cert.subject(), error = %e, "Could not build OCSP request");
                vec![]
            }
        }
    }

    fn crl_urls(&self, cert: &Certificate) -> Vec<String> {
        crl::crl_distribution_points(cert.der()).unwrap_or_else(|e| {
            warn!(subject = cert.subject(), error = %e, "Could not read CRL distribution points");
            vec![]
        })
    }

    fn set_revocation_response(
        &self,
        cert: &Certificate,
        response: &[u8],
        kind: RevocationKind,
    ) -> bool {
        if !self.is_time_valid_response(response, kind) {
            return false;
        }
        if kind == RevocationKind::Ocsp {
            let names_cert = OcspResponse::parse(response)
                .is_ok_and(|parsed| parsed.is_for(cert.der(), self.anchor_issuer_key(cert)));
            if !names_cert {
                debug!(subject = cert.subject(), "OCSP response is for another certificate");
                return false;
            }
        }
        cert.attach_revocation_response(kind, response.to_vec());
        true
    }

    fn is_time_valid_response(&self, response: &[u8], kind: RevocationKind) -> bool {
        is_time_valid_now(response, kind)
    }

    /// Self-issued, or a trust anchor by subject and key
    fn is_root(&self, cert: &Certificate) -> bool {
        cert.is_self_issued()
            || self
                .anchors
                .iter()
                .chain(self.roots.iter())
                .any(|anchor| anchor.subject() == cert.subject() && anchor.spki_hash() == cert.spki_hash())
    }
}
