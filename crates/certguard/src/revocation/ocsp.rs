//! OCSP (RFC 6960) request building and response inspection
//!
//! Requests are unsigned, single-certificate and sent with HTTP GET
//! (RFC 6960 Appendix A.1), so the request DER ends up base64 encoded in
//! the URL. That URL is what gets fetched and what keys the cache.
//!
//! Response parsing stops at what augmentation needs: the response status,
//! the first SingleResponse's CertID, certificate status and validity
//! window. A response only speaks for the certificate its CertID names
//! ([`OcspResponse::is_for`]). Signatures are not checked.
//!
//! ```asn1
//! OCSPResponse ::= SEQUENCE {
//!     responseStatus      OCSPResponseStatus,
//!     responseBytes       [0] EXPLICIT ResponseBytes OPTIONAL
//! }
//!
//! ResponseData ::= SEQUENCE {
//!     version             [0] EXPLICIT Version DEFAULT v1,
//!     responderID         ResponderID,
//!     producedAt          GeneralizedTime,
//!     responses           SEQUENCE OF SingleResponse,
//!     responseExtensions  [1] EXPLICIT Extensions OPTIONAL
//! }
//!
//! SingleResponse ::= SEQUENCE {
//!     certID              CertID,
//!     certStatus          CertStatus,
//!     thisUpdate          GeneralizedTime,
//!     nextUpdate          [0] EXPLICIT GeneralizedTime OPTIONAL,
//!     singleExtensions    [1] EXPLICIT Extensions OPTIONAL
//! }
//! ```

use super::der::{self, TAG_INTEGER, TAG_NULL, TAG_OCTET_STRING, TAG_OID};
use super::Freshness;
use crate::cert::IssuerKey;
use crate::error::GuardError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::der_parser::asn1_rs::Tag;
use x509_parser::prelude::*;

/// id-pkix-ocsp-basic (1.3.6.1.5.5.7.48.1.1), content octets
const BASIC_OCSP_RESPONSE_OID: [u8; 9] = [0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01, 0x01];

/// id-sha256 (2.16.840.1.101.3.4.2.1), content octets
const SHA256_OID: [u8; 9] = [0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];

/// id-ad-ocsp access method
const AD_OCSP: &str = "1.3.6.1.5.5.7.48.1";

/// OCSP response status (RFC 6960 Section 4.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspResponseStatus {
    Successful = 0,
    MalformedRequest = 1,
    InternalError = 2,
    TryLater = 3,
    SigRequired = 5,
    Unauthorized = 6,
}

impl OcspResponseStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Successful),
            1 => Some(Self::MalformedRequest),
            2 => Some(Self::InternalError),
            3 => Some(Self::TryLater),
            5 => Some(Self::SigRequired),
            6 => Some(Self::Unauthorized),
            _ => None,
        }
    }
}

/// Certificate status in a SingleResponse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    Good,
    Revoked { revocation_time: DateTime<Utc> },
    Unknown,
}

/// Identifies the certificate an OCSP request or SingleResponse is about
///
/// ```asn1
/// CertID ::= SEQUENCE {
///     hashAlgorithm       AlgorithmIdentifier,
///     issuerNameHash      OCTET STRING,
///     issuerKeyHash       OCTET STRING,
///     serialNumber        CertificateSerialNumber
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertId {
    /// Content octets of the hash algorithm OID
    pub hash_algorithm: Vec<u8>,
    pub issuer_name_hash: Vec<u8>,
    pub issuer_key_hash: Vec<u8>,
    /// Content octets of the serial number INTEGER
    pub serial: Vec<u8>,
}

impl CertId {
    /// SHA-256 CertID of DER `cert` issued by `issuer`
    pub fn new(cert: &[u8], issuer: &IssuerKey) -> Result<Self, GuardError> {
        let (_, parsed) = parse_x509_certificate(cert).map_err(|e| {
            GuardError::CertificateError(format!("Failed to parse certificate: {}", e))
        })?;

        Ok(Self {
            hash_algorithm: SHA256_OID.to_vec(),
            issuer_name_hash: issuer.name_hash().to_vec(),
            issuer_key_hash: issuer.key_hash().to_vec(),
            serial: parsed.raw_serial().to_vec(),
        })
    }

    fn to_der(&self) -> Vec<u8> {
        let hash_algorithm = der::sequence(&[
            &der::tlv(TAG_OID, &self.hash_algorithm),
            &der::tlv(TAG_NULL, &[]),
        ]);
        der::sequence(&[
            &hash_algorithm,
            &der::tlv(TAG_OCTET_STRING, &self.issuer_name_hash),
            &der::tlv(TAG_OCTET_STRING, &self.issuer_key_hash),
            &der::tlv(TAG_INTEGER, &self.serial),
        ])
    }

    fn parse(cert_id: &[u8]) -> Result<Self, GuardError> {
        let (rest, algorithm) = der::expect(cert_id, Tag::Sequence, "hashAlgorithm")?;
        let (_, oid) = der::expect(algorithm.data, Tag::Oid, "hashAlgorithm OID")?;
        let (rest, name_hash) = der::expect(rest, Tag::OctetString, "issuerNameHash")?;
        let (rest, key_hash) = der::expect(rest, Tag::OctetString, "issuerKeyHash")?;
        let (_, serial) = der::expect(rest, Tag::Integer, "serialNumber")?;

        Ok(Self {
            hash_algorithm: oid.data.to_vec(),
            issuer_name_hash: name_hash.data.to_vec(),
            issuer_key_hash: key_hash.data.to_vec(),
            serial: serial.data.to_vec(),
        })
    }
}

/// Builds an unsigned OCSP request for one certificate
///
/// CertID hashes (issuer name and issuer key) use SHA-256.
#[derive(Debug, Clone)]
pub struct OcspRequestBuilder {
    cert_id: CertId,
}

impl OcspRequestBuilder {
    /// `cert` and `issuer` are DER-encoded certificates
    pub fn new(cert: &[u8], issuer: &[u8]) -> Result<Self, GuardError> {
        Self::with_issuer(cert, &IssuerKey::from_der(issuer)?)
    }

    /// Request for DER `cert`, with the issuer given by name and key
    pub fn with_issuer(cert: &[u8], issuer: &IssuerKey) -> Result<Self, GuardError> {
        Ok(Self {
            cert_id: CertId::new(cert, issuer)?,
        })
    }

    pub fn cert_id(&self) -> &CertId {
        &self.cert_id
    }

    /// DER-encoded OCSPRequest
    pub fn build(&self) -> Vec<u8> {
        // OCSPRequest { TBSRequest { requestList { Request { CertID } } } }
        let request = der::sequence(&[&self.cert_id.to_der()]);
        let request_list = der::sequence(&[&request]);
        let tbs_request = der::sequence(&[&request_list]);
        der::sequence(&[&tbs_request])
    }
}

/// GET URL for `request` at `responder`: the responder URL, a `/`, and the
/// URL-encoded base64 of the request
pub fn ocsp_get_url(responder: &str, request: &[u8]) -> String {
    let encoded = STANDARD
        .encode(request)
        .replace('+', "%2B")
        .replace('/', "%2F")
        .replace('=', "%3D");

    if responder.ends_with('/') {
        format!("{}{}", responder, encoded)
    } else {
        format!("{}/{}", responder, encoded)
    }
}

/// OCSP responder URLs from the Authority Information Access extension
pub fn ocsp_responder_urls(cert_der: &[u8]) -> Result<Vec<String>, GuardError> {
    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| GuardError::CertificateError(format!("Failed to parse certificate: {}", e)))?;

    let mut urls = Vec::new();
    for ext in cert.extensions() {
        let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() else {
            continue;
        };
        for desc in aia.accessdescs.iter() {
            if desc.access_method.to_id_string() != AD_OCSP {
                continue;
            }
            if let GeneralName::URI(uri) = &desc.access_location {
                if super::crl::is_http_url(uri) {
                    urls.push(uri.to_string());
                }
            }
        }
    }
    Ok(urls)
}

/// Parsed OCSP response
#[derive(Debug, Clone)]
pub struct OcspResponse {
    pub status: OcspResponseStatus,

    /// CertID of the first SingleResponse; present only for successful responses
    pub cert_id: Option<CertId>,

    /// Present only for successful responses
    pub cert_status: Option<CertificateStatus>,

    pub produced_at: Option<DateTime<Utc>>,
    pub this_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
}

impl OcspResponse {
    pub fn parse(der_bytes: &[u8]) -> Result<Self, GuardError> {
        let (_, outer) = der::expect(der_bytes, Tag::Sequence, "OCSPResponse")?;
        let (rest, status) = der::expect(outer.data, Tag::Enumerated, "responseStatus")?;

        let status_value = match status.data {
            [value] => *value,
            _ => {
                return Err(GuardError::ParseError(
                    "responseStatus is not a single byte".to_string(),
                ))
            }
        };
        let status = OcspResponseStatus::from_u8(status_value).ok_or_else(|| {
            GuardError::ParseError(format!("Unknown OCSP response status: {}", status_value))
        })?;

        if status != OcspResponseStatus::Successful {
            return Ok(Self {
                status,
                cert_id: None,
                cert_status: None,
                produced_at: None,
                this_update: None,
                next_update: None,
            });
        }

        // responseBytes [0] EXPLICIT ResponseBytes { responseType, response }
        let (_, tagged) = der::next(rest, "responseBytes")?;
        if der::context_number(&tagged) != Some(0) {
            return Err(GuardError::ParseError(
                "OCSP response missing responseBytes".to_string(),
            ));
        }
        let (_, response_bytes) = der::expect(tagged.data, Tag::Sequence, "ResponseBytes")?;
        let (rest, response_type) = der::expect(response_bytes.data, Tag::Oid, "responseType")?;
        if response_type.data != &BASIC_OCSP_RESPONSE_OID[..] {
            return Err(GuardError::ParseError(
                "Unsupported OCSP response type".to_string(),
            ));
        }
        let (_, basic) = der::expect(rest, Tag::OctetString, "response")?;

        let (_, basic) = der::expect(basic.data, Tag::Sequence, "BasicOCSPResponse")?;
        let (_, tbs) = der::expect(basic.data, Tag::Sequence, "tbsResponseData")?;

        // Skip version and responderID (both context-tagged) up to producedAt
        let mut cursor = tbs.data;
        let produced_at = loop {
            let (rest, element) = der::next(cursor, "ResponseData")?;
            cursor = rest;
            if der::context_number(&element).is_some() {
                continue;
            }
            if element.tag() == Tag::GeneralizedTime {
                break der::generalized_time(&element)?;
            }
            return Err(GuardError::ParseError(
                "ResponseData missing producedAt".to_string(),
            ));
        };

        let (_, responses) = der::expect(cursor, Tag::Sequence, "responses")?;
        let (_, single) = der::expect(responses.data, Tag::Sequence, "SingleResponse")?;
        let (rest, cert_id) = der::expect(single.data, Tag::Sequence, "certID")?;
        let cert_id = CertId::parse(cert_id.data)?;

        let (rest, status_element) = der::next(rest, "certStatus")?;
        let cert_status = match der::context_number(&status_element) {
            Some(0) => CertificateStatus::Good,
            Some(1) => {
                let (_, time) = der::expect(
                    status_element.data,
                    Tag::GeneralizedTime,
                    "revocationTime",
                )?;
                CertificateStatus::Revoked {
                    revocation_time: der::generalized_time(&time)?,
                }
            }
            Some(2) => CertificateStatus::Unknown,
            _ => {
                return Err(GuardError::ParseError("Invalid certStatus".to_string()));
            }
        };

        let (rest, this_update) = der::expect(rest, Tag::GeneralizedTime, "thisUpdate")?;
        let this_update = der::generalized_time(&this_update)?;

        let mut next_update = None;
        if !rest.is_empty() {
            let (_, element) = der::next(rest, "nextUpdate")?;
            if der::context_number(&element) == Some(0) {
                let (_, time) = der::expect(element.data, Tag::GeneralizedTime, "nextUpdate")?;
                next_update = Some(der::generalized_time(&time)?);
            }
        }

        Ok(Self {
            status,
            cert_id: Some(cert_id),
            cert_status: Some(cert_status),
            produced_at: Some(produced_at),
            this_update: Some(this_update),
            next_update,
        })
    }

    /// Successful, with `thisUpdate <= now < nextUpdate`
    ///
    /// A response without nextUpdate is treated as expired: there is no
    /// bound on how old its information is.
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        let (Some(this_update), Some(next_update)) = (self.this_update, self.next_update) else {
            return Freshness::Expired;
        };
        if this_update > now {
            Freshness::NotYetValid
        } else if next_update <= now {
            Freshness::Expired
        } else {
            Freshness::Current
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.cert_status, Some(CertificateStatus::Revoked { .. }))
    }

    /// The response's CertID names DER `cert`
    ///
    /// Serial number and issuer name hash are checked against the
    /// certificate itself; the issuer key hash only when `issuer` is known.
    /// Only SHA-256 CertIDs can match.
    pub fn is_for(&self, cert: &[u8], issuer: Option<&IssuerKey>) -> bool {
        let Some(cert_id) = &self.cert_id else {
            return false;
        };
        if cert_id.hash_algorithm != SHA256_OID {
            return false;
        }
        let Ok((_, parsed)) = parse_x509_certificate(cert) else {
            return false;
        };

        let issuer_name_hash = Sha256::digest(parsed.issuer().as_raw());
        if cert_id.serial != parsed.raw_serial() || cert_id.issuer_name_hash != issuer_name_hash.as_slice() {
            return false;
        }
        issuer.map_or(true, |issuer| cert_id.issuer_key_hash == issuer.key_hash())
    }
}
