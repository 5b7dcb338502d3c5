//! Minimal DER walk to pull the validity end date out of an X.509 certificate.

use chrono::{DateTime, NaiveDate, Utc};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_INTEGER: u8 = 0x02;
const TAG_VERSION: u8 = 0xA0;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;

/// One DER element: tag and content bytes.
struct Element<'a> {
    tag: u8,
    content: &'a [u8],
}

/// Read the element at the start of `data`, returning it and the rest.
fn read_element(data: &[u8]) -> Option<(Element<'_>, &[u8])> {
    let tag = *data.first()?;
    let first_len = *data.get(1)?;
    let (len, header) = if first_len & 0x80 == 0 {
        (first_len as usize, 2)
    } else {
        let n = (first_len & 0x7F) as usize;
        if n == 0 || n > 4 {
            return None;
        }
        let bytes = data.get(2..2 + n)?;
        let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (len, 2 + n)
    };
    let content = data.get(header..header + len)?;
    Some((Element { tag, content }, &data[header + len..]))
}

/// The `notAfter` time of a DER-encoded certificate.
pub fn certificate_not_after(der: &[u8]) -> Option<DateTime<Utc>> {
    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
    let (cert, _) = read_element(der)?;
    if cert.tag != TAG_SEQUENCE {
        return None;
    }
    let (tbs, _) = read_element(cert.content)?;
    if tbs.tag != TAG_SEQUENCE {
        return None;
    }

    // tbsCertificate ::= SEQUENCE { [0] version OPTIONAL, serial, signature, issuer, validity, ... }
    let mut rest = tbs.content;
    let (mut elem, mut next) = read_element(rest)?;
    if elem.tag == TAG_VERSION {
        rest = next;
        (elem, next) = read_element(rest)?;
    }
    if elem.tag != TAG_INTEGER {
        return None;
    }
    rest = next;

    // signature AlgorithmIdentifier, then issuer Name
    for _ in 0..2 {
        let (skipped, after) = read_element(rest)?;
        if skipped.tag != TAG_SEQUENCE {
            return None;
        }
        rest = after;
    }

    let (validity, _) = read_element(rest)?;
    if validity.tag != TAG_SEQUENCE {
        return None;
    }
    let (_not_before, after) = read_element(validity.content)?;
    let (not_after, _) = read_element(after)?;
    parse_time(not_after.tag, not_after.content)
}

/// Decode UTCTime (`YYMMDDHHMMSSZ`) or GeneralizedTime (`YYYYMMDDHHMMSSZ`).
fn parse_time(tag: u8, content: &[u8]) -> Option<DateTime<Utc>> {
    let text = std::str::from_utf8(content).ok()?;
    let digits = text.strip_suffix('Z')?;
    let (year, rest) = match tag {
        TAG_UTC_TIME => {
            let yy: i32 = digits.get(0..2)?.parse().ok()?;
            // RFC 5280: 50..99 are 19xx, 00..49 are 20xx
            let year = if yy >= 50 { 1900 + yy } else { 2000 + yy };
            (year, digits.get(2..)?)
        }
        TAG_GENERALIZED_TIME => (digits.get(0..4)?.parse().ok()?, digits.get(4..)?),
        _ => return None,
    };
    if rest.len() != 10 {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<u32> { rest.get(range)?.parse().ok() };
    let date = NaiveDate::from_ymd_opt(year, field(0..2)?, field(2..4)?)?;
    let time = date.and_hms_opt(field(4..6)?, field(6..8)?, field(8..10)?)?;
    Some(DateTime::from_naive_utc_and_offset(time, Utc))
}
