//! Minimal DER encoding and TLV reading
//!
//! Only what OCSP request construction and response inspection need. Full
//! structure decoding goes through `asn1-rs` (re-exported by x509-parser).

use crate::error::GuardError;
use chrono::{DateTime, NaiveDateTime, Utc};
use x509_parser::der_parser::asn1_rs::{Any, Class, FromDer, Tag};

pub(crate) const TAG_INTEGER: u8 = 0x02;
#[cfg(test)]
pub(crate) const TAG_BIT_STRING: u8 = 0x03;
pub(crate) const TAG_OCTET_STRING: u8 = 0x04;
pub(crate) const TAG_NULL: u8 = 0x05;
pub(crate) const TAG_OID: u8 = 0x06;
#[cfg(test)]
pub(crate) const TAG_ENUMERATED: u8 = 0x0A;
#[cfg(test)]
pub(crate) const TAG_GENERALIZED_TIME: u8 = 0x18;
pub(crate) const TAG_SEQUENCE: u8 = 0x30;

/// Context-specific tag byte, constructed when `constructed` is set
pub(crate) fn context_tag(number: u8, constructed: bool) -> u8 {
    if constructed {
        0xA0 | number
    } else {
        0x80 | number
    }
}

/// Encode Tag-Length-Value
pub(crate) fn tlv(tag: u8, contents: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(contents.len() + 6);
    out.push(tag);
    push_length(&mut out, contents.len());
    out.extend_from_slice(contents);
    out
}

/// SEQUENCE over the concatenation of `parts`
pub(crate) fn sequence(parts: &[&[u8]]) -> Vec<u8> {
    tlv(TAG_SEQUENCE, &parts.concat())
}

fn push_length(out: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

/// Read the next element
pub(crate) fn next<'a>(input: &'a [u8], what: &str) -> Result<(&'a [u8], Any<'a>), GuardError> {
    Any::from_der(input)
        .map_err(|e| GuardError::ParseError(format!("Failed to read {}: {:?}", what, e)))
}

/// Read the next element and require a universal tag
pub(crate) fn expect<'a>(
    input: &'a [u8],
    tag: Tag,
    what: &str,
) -> Result<(&'a [u8], Any<'a>), GuardError> {
    let (rest, any) = next(input, what)?;
    if any.class() != Class::Universal || any.tag() != tag {
        return Err(GuardError::ParseError(format!(
            "{}: expected {:?}, found {:?}",
            what,
            tag,
            any.tag()
        )));
    }
    Ok((rest, any))
}

/// Context-specific tag number, if the element is context-tagged
pub(crate) fn context_number(any: &Any<'_>) -> Option<u32> {
    (any.class() == Class::ContextSpecific).then(|| any.tag().0)
}

/// Decode a GeneralizedTime body (`YYYYMMDDHHMMSS[.fff]Z`)
pub(crate) fn generalized_time(any: &Any<'_>) -> Result<DateTime<Utc>, GuardError> {
    let text = std::str::from_utf8(any.data)
        .map_err(|_| GuardError::ParseError("GeneralizedTime is not ASCII".to_string()))?;

    let naive = NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%SZ")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y%m%d%H%M%S%.fZ"))
        .map_err(|e| GuardError::ParseError(format!("Invalid GeneralizedTime '{}': {}", text, e)))?;

    Ok(naive.and_utc())
}

#[cfg(test)]
pub(crate) fn generalized_time_bytes(time: DateTime<Utc>) -> Vec<u8> {
    tlv(
        TAG_GENERALIZED_TIME,
        time.format("%Y%m%d%H%M%SZ").to_string().as_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_length_encoding() {
        assert_eq!(tlv(TAG_NULL, &[]), vec![0x05, 0x00]);
        assert_eq!(&tlv(TAG_OCTET_STRING, &[0u8; 200])[..3], &[0x04, 0x81, 200]);
        assert_eq!(&tlv(TAG_OCTET_STRING, &[0u8; 300])[..4], &[0x04, 0x82, 0x01, 0x2C]);
    }

    #[test]
    fn test_expect_checks_tag() {
        let encoded = sequence(&[&tlv(TAG_INTEGER, &[0x05])]);
        let (rest, seq) = expect(&encoded, Tag::Sequence, "outer").unwrap();
        assert!(rest.is_empty());

        let (_, int) = expect(seq.data, Tag::Integer, "int").unwrap();
        assert_eq!(int.data, &[0x05]);

        assert!(expect(seq.data, Tag::OctetString, "int").is_err());
    }

    #[test]
    fn test_context_number() {
        let encoded = tlv(context_tag(1, true), &tlv(TAG_NULL, &[]));
        let (_, any) = next(&encoded, "tagged").unwrap();
        assert_eq!(context_number(&any), Some(1));

        let encoded = tlv(TAG_NULL, &[]);
        let (_, any) = next(&encoded, "null").unwrap();
        assert_eq!(context_number(&any), None);
    }

    #[test]
    fn test_generalized_time() {
        let time = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let encoded = generalized_time_bytes(time);
        let (_, any) = expect(&encoded, Tag::GeneralizedTime, "time").unwrap();
        assert_eq!(generalized_time(&any).unwrap(), time);

        let fractional = tlv(TAG_GENERALIZED_TIME, b"20240301123005.250Z");
        let (_, any) = next(&fractional, "time").unwrap();
        assert_eq!(generalized_time(&any).unwrap().timestamp(), time.timestamp());
    }
}
