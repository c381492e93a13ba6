//! Low-level decoders for IPFIX field values.
//!
//! All multi-byte values on the wire are big-endian (RFC 7011, Section 6.1).
//! Readers take the exact slice of a single field and fail with
//! [`Error::InvalidData`] when the slice length is incompatible with the
//! requested type.

use crate::Error;

use std::net::{Ipv4Addr, Ipv6Addr};

/// Seconds between the NTP era (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

/// Reads a 1..=8 byte big-endian unsigned integer.
pub fn read_uint_be(data: &[u8]) -> Result<u64, Error> {
    if data.is_empty() || data.len() > 8 {
        return Err(Error::InvalidData(format!(
            "unsigned integer field must be 1-8 bytes, got {}",
            data.len()
        )));
    }

    let mut value: u64 = 0;
    for byte in data {
        value = (value << 8) | u64::from(*byte);
    }
    Ok(value)
}

/// Reads a 1..=8 byte big-endian signed integer with sign extension.
pub fn read_int_be(data: &[u8]) -> Result<i64, Error> {
    let unsigned = read_uint_be(data).map_err(|_| {
        Error::InvalidData(format!(
            "signed integer field must be 1-8 bytes, got {}",
            data.len()
        ))
    })?;

    let shift = 64 - (data.len() * 8);
    Ok(((unsigned << shift) as i64) >> shift)
}

/// Reads a big-endian IEEE 754 float (4 or 8 bytes).
///
/// Non-finite values (infinities, NaN) pass through unchanged; the caller
/// decides how to present them.
pub fn read_float_be(data: &[u8]) -> Result<f64, Error> {
    if let Ok(raw) = <[u8; 4]>::try_from(data) {
        return Ok(f64::from(f32::from_be_bytes(raw)));
    }
    if let Ok(raw) = <[u8; 8]>::try_from(data) {
        return Ok(f64::from_be_bytes(raw));
    }
    Err(Error::InvalidData(format!(
        "float field must be 4 or 8 bytes, got {}",
        data.len()
    )))
}

/// Reads a boolean encoded per RFC 7011, Section 6.1.5.
///
/// The field must be exactly one byte; 1 means true, 2 means false and any
/// other value is invalid.
pub fn read_bool(data: &[u8]) -> Result<bool, Error> {
    if data.len() != 1 {
        return Err(Error::InvalidData(format!(
            "boolean field must be 1 byte, got {}",
            data.len()
        )));
    }

    match data[0] {
        1 => Ok(true),
        2 => Ok(false),
        v => Err(Error::InvalidData(format!("invalid boolean value {v}"))),
    }
}

/// Timestamp precision variants of the dateTime* abstract data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePrecision {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

/// Reads a dateTime field and converts it to Unix time.
///
/// Encodings per RFC 7011, Sections 6.1.6-6.1.9: seconds are a 32-bit Unix
/// timestamp, milliseconds a 64-bit Unix timestamp, and micro/nanoseconds use
/// the 64-bit NTP format (32-bit seconds since 1900 + 32-bit fraction).
/// Returns whole seconds since the Unix epoch and the sub-second nanosecond
/// remainder.
pub fn read_datetime_be(data: &[u8], precision: TimePrecision) -> Result<(u64, u32), Error> {
    match precision {
        TimePrecision::Seconds => {
            if data.len() != 4 {
                return Err(Error::InvalidData(format!(
                    "dateTimeSeconds field must be 4 bytes, got {}",
                    data.len()
                )));
            }
            Ok((read_uint_be(data)?, 0))
        }
        TimePrecision::Milliseconds => {
            if data.len() != 8 {
                return Err(Error::InvalidData(format!(
                    "dateTimeMilliseconds field must be 8 bytes, got {}",
                    data.len()
                )));
            }
            let msec = read_uint_be(data)?;
            Ok((msec / 1000, (msec % 1000) as u32 * 1_000_000))
        }
        TimePrecision::Microseconds | TimePrecision::Nanoseconds => {
            if data.len() != 8 {
                return Err(Error::InvalidData(format!(
                    "NTP-format dateTime field must be 8 bytes, got {}",
                    data.len()
                )));
            }
            let ntp_secs = read_uint_be(&data[..4])?;
            let mut fraction = read_uint_be(&data[4..])?;
            if precision == TimePrecision::Microseconds {
                // RFC 7011: the bottom 11 bits of the fraction must be zeroed
                // to stay within microsecond precision.
                fraction &= !0x7FF;
            }

            let secs = ntp_secs.wrapping_sub(NTP_EPOCH_OFFSET);
            let nanos = ((fraction * 1_000_000_000) >> 32) as u32;
            Ok((secs, nanos))
        }
    }
}

/// Reads a dateTime field as milliseconds since the Unix epoch.
///
/// Arithmetic wraps for NTP timestamps before the Unix epoch.
pub fn read_datetime_unix_ms(data: &[u8], precision: TimePrecision) -> Result<u64, Error> {
    let (secs, nanos) = read_datetime_be(data, precision)?;
    Ok(secs
        .wrapping_mul(1000)
        .wrapping_add(u64::from(nanos) / 1_000_000))
}

/// Decodes a 4-byte IPv4 address field.
pub fn read_ipv4(data: &[u8]) -> Result<Ipv4Addr, Error> {
    let raw: [u8; 4] = data.try_into().map_err(|_| {
        Error::InvalidData(format!(
            "ipv4Address field must be 4 bytes, got {}",
            data.len()
        ))
    })?;
    Ok(Ipv4Addr::from(raw))
}

/// Decodes a 16-byte IPv6 address field.
pub fn read_ipv6(data: &[u8]) -> Result<Ipv6Addr, Error> {
    let raw: [u8; 16] = data.try_into().map_err(|_| {
        Error::InvalidData(format!(
            "ipv6Address field must be 16 bytes, got {}",
            data.len()
        ))
    })?;
    Ok(Ipv6Addr::from(raw))
}

/// Formats a 6-byte MAC address field as `aa:bb:cc:dd:ee:ff`.
pub fn format_mac(data: &[u8]) -> Result<String, Error> {
    if data.len() != 6 {
        return Err(Error::InvalidData(format!(
            "macAddress field must be 6 bytes, got {}",
            data.len()
        )));
    }

    Ok(format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        data[0], data[1], data[2], data[3], data[4], data[5]
    ))
}

/// Validates one UTF-8 character at the start of `data` per RFC 3629.
///
/// Returns the character length in bytes (1-4), or 0 when the sequence is
/// invalid. Overlong encodings, surrogate code points, values above U+10FFFF
/// and truncated/lone continuation bytes are all rejected.
pub fn utf8_char_len(data: &[u8]) -> usize {
    if data.is_empty() {
        return 0;
    }

    let b0 = data[0];
    if b0 < 0x80 {
        return 1;
    }

    let cont = |b: u8| (0x80..=0xBF).contains(&b);

    match b0 {
        0xC2..=0xDF if data.len() >= 2 && cont(data[1]) => 2,
        0xE0 if data.len() >= 3 && (0xA0..=0xBF).contains(&data[1]) && cont(data[2]) => 3,
        0xE1..=0xEC if data.len() >= 3 && cont(data[1]) && cont(data[2]) => 3,
        // 0xED excludes UTF-16 surrogates (U+D800..U+DFFF)
        0xED if data.len() >= 3 && (0x80..=0x9F).contains(&data[1]) && cont(data[2]) => 3,
        0xEE..=0xEF if data.len() >= 3 && cont(data[1]) && cont(data[2]) => 3,
        0xF0 if data.len() >= 4
            && (0x90..=0xBF).contains(&data[1])
            && cont(data[2])
            && cont(data[3]) =>
        {
            4
        }
        0xF1..=0xF3 if data.len() >= 4 && cont(data[1]) && cont(data[2]) && cont(data[3]) => 4,
        // 0xF4 caps the range at U+10FFFF
        0xF4 if data.len() >= 4
            && (0x80..=0x8F).contains(&data[1])
            && cont(data[2])
            && cont(data[3]) =>
        {
            4
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint_widths() {
        assert_eq!(read_uint_be(&[0xFF]).unwrap(), 255);
        assert_eq!(read_uint_be(&[1, 0]).unwrap(), 256);
        assert_eq!(read_uint_be(&[1, 2, 3]).unwrap(), 0x010203);
        assert_eq!(
            read_uint_be(&[0xFF; 8]).unwrap(),
            u64::MAX,
        );
        assert!(read_uint_be(&[]).is_err());
        assert!(read_uint_be(&[0; 9]).is_err());
    }

    #[test]
    fn int_sign_extension() {
        assert_eq!(read_int_be(&[0xFF]).unwrap(), -1);
        assert_eq!(read_int_be(&[0x80, 0x00]).unwrap(), -32768);
        assert_eq!(read_int_be(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(read_int_be(&[0xFF, 0xFF, 0xFE]).unwrap(), -2);
    }

    #[test]
    fn float_widths() {
        let pi = std::f32::consts::PI;
        let got = read_float_be(&pi.to_be_bytes()).unwrap();
        assert!((got - f64::from(pi)).abs() < 1e-9);

        let inf = f64::INFINITY.to_be_bytes();
        assert!(read_float_be(&inf).unwrap().is_infinite());

        assert!(read_float_be(&[0; 3]).is_err());
    }

    #[test]
    fn bool_encoding() {
        assert!(read_bool(&[1]).unwrap());
        assert!(!read_bool(&[2]).unwrap());
        assert!(read_bool(&[0]).is_err());
        assert!(read_bool(&[1, 1]).is_err());
    }

    #[test]
    fn datetime_seconds_and_millis() {
        let secs = 1_522_670_362u32;
        assert_eq!(
            read_datetime_be(&secs.to_be_bytes(), TimePrecision::Seconds).unwrap(),
            (u64::from(secs), 0)
        );

        let msec = 1_522_670_362_123u64;
        assert_eq!(
            read_datetime_unix_ms(&msec.to_be_bytes(), TimePrecision::Milliseconds).unwrap(),
            msec
        );
        assert!(read_datetime_be(&[0; 8], TimePrecision::Seconds).is_err());
    }

    #[test]
    fn datetime_ntp_conversion() {
        // NTP seconds for 1970-01-01 plus half a second of fraction.
        let mut buf = Vec::new();
        buf.extend_from_slice(&(NTP_EPOCH_OFFSET as u32).to_be_bytes());
        buf.extend_from_slice(&0x8000_0000u32.to_be_bytes());

        let (secs, nanos) = read_datetime_be(&buf, TimePrecision::Nanoseconds).unwrap();
        assert_eq!(secs, 0);
        assert_eq!(nanos, 500_000_000);
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0x00, 0x1B, 0x44, 0x11, 0x3A, 0xB7]).unwrap(),
            "00:1b:44:11:3a:b7"
        );
        assert!(format_mac(&[0; 5]).is_err());
    }

    #[test]
    fn utf8_validation() {
        assert_eq!(utf8_char_len(b"a"), 1);
        assert_eq!(utf8_char_len("é".as_bytes()), 2);
        assert_eq!(utf8_char_len("€".as_bytes()), 3);
        assert_eq!(utf8_char_len("𐍈".as_bytes()), 4);

        // Lone continuation byte and isolated 0xFF
        assert_eq!(utf8_char_len(&[0x80]), 0);
        assert_eq!(utf8_char_len(&[0xFF]), 0);
        // Overlong encoding of '/' (0x2F)
        assert_eq!(utf8_char_len(&[0xC0, 0xAF]), 0);
        // UTF-16 surrogate U+D800
        assert_eq!(utf8_char_len(&[0xED, 0xA0, 0x80]), 0);
        // Truncated sequence
        assert_eq!(utf8_char_len(&[0xE2, 0x82]), 0);
    }
}
