//! CRL parsing and freshness
//!
//! CRLs fetched during augmentation are not checked for revoked serials
//! here; that is the underlying verifier's job once the CRL is attached.
//! This module only needs enough of the CRL to decide whether it is worth
//! attaching (parses, and is inside its validity window) and to find
//! distribution points on a certificate.
//!
//! # Example
//!
//! ```no_run
//! use certguard::revocation::crl::CrlInfo;
//! use chrono::Utc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let crl_der = std::fs::read("crl.der")?;
//! let crl = CrlInfo::parse_der(&crl_der)?;
//! println!("{} entries, {:?}", crl.revoked_count(), crl.freshness(Utc::now()));
//! # Ok(())
//! # }
//! ```

use super::Freshness;
use crate::error::GuardError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashSet;
use x509_parser::prelude::*;

/// Parsed CRL information
#[derive(Debug, Clone)]
pub struct CrlInfo {
    /// CRL issuer distinguished name
    pub issuer: String,

    /// When this CRL was issued
    pub this_update: DateTime<Utc>,

    /// When the next CRL will be issued (optional per RFC 5280)
    pub next_update: Option<DateTime<Utc>>,

    /// Revoked certificate serial numbers
    pub revoked_serials: HashSet<Vec<u8>>,
}

impl CrlInfo {
    /// Parse a DER-encoded CRL
    ///
    /// The signature is not verified.
    pub fn parse_der(crl_der: &[u8]) -> Result<Self, GuardError> {
        let (_, crl) = parse_x509_crl(crl_der)
            .map_err(|e| GuardError::ParseError(format!("Failed to parse CRL DER: {}", e)))?;

        let this_update = asn1_time_to_chrono(&crl.last_update())
            .ok_or_else(|| GuardError::ParseError("Invalid thisUpdate time in CRL".to_string()))?;
        let next_update = crl.next_update().and_then(|t| asn1_time_to_chrono(&t));

        let revoked_serials = crl
            .iter_revoked_certificates()
            .map(|revoked| revoked.raw_serial().to_vec())
            .collect();

        Ok(CrlInfo {
            issuer: crl.issuer().to_string(),
            this_update,
            next_update,
            revoked_serials,
        })
    }

    /// Parse a PEM-encoded CRL
    pub fn parse_pem(pem_data: &[u8]) -> Result<Self, GuardError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem_data)
            .map_err(|e| GuardError::ParseError(format!("Failed to parse CRL PEM: {}", e)))?;
        Self::parse_der(&pem.contents)
    }

    pub fn is_revoked(&self, serial: &[u8]) -> bool {
        self.revoked_serials.contains(serial)
    }

    /// `thisUpdate <= now < nextUpdate`; a CRL without nextUpdate never expires
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if self.this_update > now {
            return Freshness::NotYetValid;
        }
        match self.next_update {
            Some(next_update) if next_update <= now => Freshness::Expired,
            _ => Freshness::Current,
        }
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked_serials.len()
    }
}

/// HTTP(S) CRL distribution point URLs of a DER certificate, in extension order
///
/// Non-HTTP names (LDAP, directory names) are skipped.
pub fn crl_distribution_points(cert_der: &[u8]) -> Result<Vec<String>, GuardError> {
    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| GuardError::CertificateError(format!("Failed to parse certificate: {}", e)))?;

    let mut urls = Vec::new();
    for ext in cert.extensions() {
        let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() else {
            continue;
        };
        for point in points.iter() {
            let Some(DistributionPointName::FullName(names)) = &point.distribution_point else {
                continue;
            };
            for name in names {
                if let GeneralName::URI(uri) = name {
                    if is_http_url(uri) && !urls.iter().any(|u| u == uri) {
                        urls.push(uri.to_string());
                    }
                }
            }
        }
    }
    Ok(urls)
}

pub(crate) fn is_http_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn asn1_time_to_chrono(asn1_time: &ASN1Time) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(asn1_time.timestamp(), 0).single()
}
