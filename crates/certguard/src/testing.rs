//! Generated certificates for unit tests

use crate::revocation::der::{self, TAG_OID};
use rcgen::{
    BasicConstraints, CertificateParams, CrlDistributionPoint, CustomExtension, DistinguishedName,
    DnType, IsCa, KeyPair,
};

/// id-pe-authorityInfoAccess
const AIA_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 1];

/// id-ad-ocsp, content octets
const AD_OCSP: [u8; 8] = [0x2B, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];

/// GeneralName uniformResourceIdentifier, [6] IMPLICIT
const URI_TAG: u8 = 0x86;

pub(crate) struct Issued {
    pub(crate) cert: rcgen::Certificate,
    pub(crate) key: KeyPair,
}

impl Issued {
    pub(crate) fn der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }
}

pub(crate) fn params(common_name: &str, is_ca: bool) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, common_name);
    params.distinguished_name = name;
    if is_ca {
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    }
    params
}

pub(crate) fn with_ocsp(mut params: CertificateParams, responder: &str) -> CertificateParams {
    let description = der::sequence(&[
        &der::tlv(TAG_OID, &AD_OCSP),
        &der::tlv(URI_TAG, responder.as_bytes()),
    ]);
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(AIA_OID, der::sequence(&[&description])));
    params
}

pub(crate) fn with_crl(mut params: CertificateParams, url: &str) -> CertificateParams {
    params.crl_distribution_points = vec![CrlDistributionPoint {
        uris: vec![url.to_string()],
    }];
    params
}

pub(crate) fn root(common_name: &str) -> Issued {
    let key = KeyPair::generate().unwrap();
    let cert = params(common_name, true).self_signed(&key).unwrap();
    Issued { cert, key }
}

pub(crate) fn issue(params: CertificateParams, issuer: &Issued) -> Issued {
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).unwrap();
    Issued { cert, key }
}
