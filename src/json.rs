//! JSON rendering of Data Records.
//!
//! Produces one strict-JSON object per record, `{"@type":"ipfix.entry",...}`
//! (or `ipfix.optionsEntry` for Options Templates). Field keys use the
//! `"scope:element"` name when the IE definition is known, the numeric
//! `"enXX:idYY"` form otherwise. Structured lists render recursively; a field
//! whose value cannot be converted degrades to `null` without failing the
//! whole record.
//!
//! Output goes through [`JsonBuffer`], an appender that either grows on
//! demand or enforces a fixed capacity with [`Error::InsufficientBuffer`].
//! No pointer into the buffer survives growth; all positions are offsets.

use crate::Error;
use crate::bytes::{
    self, TimePrecision, format_mac, read_bool, read_datetime_be, read_float_be, read_int_be,
    read_uint_be, utf8_char_len,
};
use crate::iemgr::{IeDataType, IeManager};
use crate::list::{BasicListIter, ListFlags, SubTemplateListIter, SubTemplateMultiListIter};
use crate::protocol::protocol_name;
use crate::record::{DataRecord, DrecField, DrecFlags};
use crate::template::{FieldFlags, TemplateType};

use bitflags::bitflags;

bitflags! {
    /// Rendering flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JsonFlags: u16 {
        /// Always use the numeric `"enXX:idYY"` field keys.
        const NUMERIC_ID      = 0x0001;
        /// Never render short octetArray values as integers.
        const OCTETS_NOINT    = 0x0002;
        /// Timestamps as ISO 8601 text with millisecond precision.
        const TS_FORMAT_MSEC  = 0x0004;
        /// Drop non-printable characters from strings instead of escaping.
        const NON_PRINTABLE   = 0x0008;
        /// `tcpControlBits` as a `.A..SF`-style string.
        const FORMAT_TCPFLAGS = 0x0010;
        /// `protocolIdentifier` as the IANA keyword.
        const FORMAT_PROTO    = 0x0020;
        /// Omit fields without an IE definition.
        const IGNORE_UNKNOWN  = 0x0040;
        /// Render the biflow reverse view of the record.
        const BIFLOW_REVERSE  = 0x0080;
        /// Omit reverse-only fields.
        const REVERSE_SKIP    = 0x0100;
    }
}

const IANA_EN_FWD: u32 = 0;
const IANA_EN_REV: u32 = 29305;
const IANA_ID_FLAGS: u16 = 6;
const IANA_ID_PROTO: u16 = 4;

/// Append-only output buffer.
///
/// A growable buffer doubles its allocation on demand and fails only on
/// allocation failure; a fixed buffer fails with
/// [`Error::InsufficientBuffer`] once the capacity limit is reached.
#[derive(Debug)]
pub struct JsonBuffer {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl JsonBuffer {
    /// An auto-growing buffer.
    pub fn growable() -> Self {
        Self { buf: Vec::with_capacity(512), limit: None }
    }

    /// A buffer refusing to grow past `capacity` bytes.
    pub fn fixed(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity), limit: Some(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// The rendered text. Output is produced as valid UTF-8; lossy
    /// conversion is a formality.
    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn check_capacity(&self, extra: usize) -> Result<(), Error> {
        if let Some(limit) = self.limit {
            if self.buf.len() + extra > limit {
                return Err(Error::InsufficientBuffer(format!(
                    "{} bytes used of a {limit}-byte buffer, {extra} more needed",
                    self.buf.len()
                )));
            }
        }
        Ok(())
    }

    fn push_str(&mut self, s: &str) -> Result<(), Error> {
        self.push_bytes(s.as_bytes())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.check_capacity(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn push_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.check_capacity(1)?;
        self.buf.push(byte);
        Ok(())
    }

    fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

/// Renders one Data Record as a JSON object appended to `out`.
///
/// Returns the number of bytes written. On error, the buffer is restored to
/// its previous length.
pub fn record_to_json(
    rec: &DataRecord,
    flags: JsonFlags,
    iemgr: Option<&IeManager>,
    out: &mut JsonBuffer,
) -> Result<usize, Error> {
    let start = out.len();
    let mut renderer = Renderer { flags, iemgr, out };

    match renderer.render_record(rec) {
        Ok(()) => Ok(out.len() - start),
        Err(err) => {
            out.truncate(start);
            Err(err)
        }
    }
}

/// True for errors that degrade a single field to `null` instead of failing
/// the whole record (conversion problems, malformed substructures). Buffer
/// and memory errors always propagate.
fn is_recoverable(err: &Error) -> bool {
    !matches!(err, Error::InsufficientBuffer(_) | Error::OutOfMemory(_))
}

struct Renderer<'m, 'b> {
    flags: JsonFlags,
    iemgr: Option<&'m IeManager>,
    out: &'b mut JsonBuffer,
}

impl Renderer<'_, '_> {
    fn drec_flags(&self) -> DrecFlags {
        let mut flags = DrecFlags::empty();
        if self.flags.contains(JsonFlags::IGNORE_UNKNOWN) {
            flags |= DrecFlags::UNKNOWN_SKIP;
        }
        if self.flags.contains(JsonFlags::BIFLOW_REVERSE) {
            flags |= DrecFlags::BIFLOW_REV;
        }
        if self.flags.contains(JsonFlags::REVERSE_SKIP) {
            flags |= DrecFlags::REVERSE_SKIP;
        }
        flags
    }

    fn render_record(&mut self, rec: &DataRecord) -> Result<(), Error> {
        let envelope = match rec.tmplt.ttype {
            TemplateType::Options => "{\"@type\":\"ipfix.optionsEntry\"",
            TemplateType::Data => "{\"@type\":\"ipfix.entry\"",
        };
        self.out.push_str(envelope)?;
        self.iter_loop(rec, true)?;
        self.out.push_str("}")
    }

    /// Walks the record and emits `"key":value` pairs. With `continued` set,
    /// a separator precedes the first pair too (the object already has a
    /// member).
    fn iter_loop(&mut self, rec: &DataRecord, continued: bool) -> Result<(), Error> {
        let iter_flags = self.drec_flags();
        let mut added = usize::from(continued);

        for item in rec.iter(iter_flags) {
            let field = item?;
            let fflags = field.info.flags;

            // Repeated IEs render once, as an array, at their last
            // occurrence.
            if fflags.contains(FieldFlags::MULTI_IE) && !fflags.contains(FieldFlags::LAST_IE) {
                continue;
            }

            if added != 0 {
                self.out.push_str(",")?;
            }
            self.add_field_name(&field)?;

            let rollback = self.out.len();
            let result = if fflags.contains(FieldFlags::MULTI_IE) {
                self.multi_fields(rec, field.en, field.id, iter_flags)
            } else {
                self.convert_value(Some(rec), &field)
            };

            match result {
                Ok(()) => {}
                Err(err) if is_recoverable(&err) => {
                    self.out.truncate(rollback);
                    self.out.push_str("null")?;
                }
                Err(err) => return Err(err),
            }
            added += 1;
        }
        Ok(())
    }

    /// Gathers every occurrence of one repeated IE into a JSON array.
    fn multi_fields(
        &mut self,
        rec: &DataRecord,
        en: u32,
        id: u16,
        iter_flags: DrecFlags,
    ) -> Result<(), Error> {
        self.out.push_str("[")?;

        let mut added = 0usize;
        for item in rec.iter(iter_flags) {
            let field = item?;
            if field.en != en || field.id != id {
                continue;
            }

            if added != 0 {
                self.out.push_str(",")?;
            }

            let rollback = self.out.len();
            match self.convert_value(Some(rec), &field) {
                Ok(()) => {}
                Err(err) if is_recoverable(&err) => {
                    self.out.truncate(rollback);
                    self.out.push_str("null")?;
                }
                Err(err) => return Err(err),
            }
            added += 1;

            if field.info.flags.contains(FieldFlags::LAST_IE) {
                break;
            }
        }

        self.out.push_str("]")
    }

    /// `"scope:element"` or `"enXX:idYY"` field key, rendered in view order.
    fn field_key(&self, field: &DrecField) -> String {
        match &field.info.def {
            Some(def) if !self.flags.contains(JsonFlags::NUMERIC_ID) => {
                format!("{}:{}", def.scope_name, def.name)
            }
            _ => format!("en{}:id{}", field.en, field.id),
        }
    }

    fn add_field_name(&mut self, field: &DrecField) -> Result<(), Error> {
        let key = self.field_key(field);
        self.out.push_byte(b'"')?;
        self.out.push_str(&key)?;
        self.out.push_str("\":")
    }

    /// Converts one field value, dispatching on formatting flags and the IE
    /// data type. Undefined fields convert as octetArray. The record context
    /// is needed only by nested subTemplate lists; basicList values pass
    /// `None`.
    fn convert_value(&mut self, rec: Option<&DataRecord>, field: &DrecField) -> Result<(), Error> {
        let iana = field.en == IANA_EN_FWD || field.en == IANA_EN_REV;
        if self.flags.contains(JsonFlags::FORMAT_TCPFLAGS) && field.id == IANA_ID_FLAGS && iana {
            return self.to_tcp_flags(field.data);
        }
        if self.flags.contains(JsonFlags::FORMAT_PROTO) && field.id == IANA_ID_PROTO && iana {
            return self.to_proto(field.data);
        }

        let data_type = field
            .info
            .def
            .as_ref()
            .map(|def| def.data_type)
            .unwrap_or(IeDataType::OctetArray);

        match data_type {
            IeDataType::OctetArray => self.to_octet(field.data),
            IeDataType::Unsigned8
            | IeDataType::Unsigned16
            | IeDataType::Unsigned32
            | IeDataType::Unsigned64 => self.to_uint(field.data),
            IeDataType::Signed8
            | IeDataType::Signed16
            | IeDataType::Signed32
            | IeDataType::Signed64 => self.to_int(field.data),
            IeDataType::Float32 | IeDataType::Float64 => self.to_float(field.data),
            IeDataType::Boolean => self.to_bool(field.data),
            IeDataType::MacAddress => self.to_mac(field.data),
            IeDataType::String => self.to_escaped_string(field.data),
            IeDataType::DateTimeSeconds => self.to_datetime(field.data, TimePrecision::Seconds),
            IeDataType::DateTimeMilliseconds => {
                self.to_datetime(field.data, TimePrecision::Milliseconds)
            }
            IeDataType::DateTimeMicroseconds => {
                self.to_datetime(field.data, TimePrecision::Microseconds)
            }
            IeDataType::DateTimeNanoseconds => {
                self.to_datetime(field.data, TimePrecision::Nanoseconds)
            }
            IeDataType::Ipv4Address => self.to_ipv4(field.data),
            IeDataType::Ipv6Address => self.to_ipv6(field.data),
            IeDataType::BasicList => self.to_basic_list(field.data),
            IeDataType::SubTemplateList => match rec {
                Some(rec) => self.to_sub_template_list(rec, field.data),
                None => Err(Error::InvalidData(
                    "subTemplateList nested inside a basicList is not supported".to_string(),
                )),
            },
            IeDataType::SubTemplateMultiList => match rec {
                Some(rec) => self.to_sub_template_multilist(rec, field.data),
                None => Err(Error::InvalidData(
                    "subTemplateMultiList nested inside a basicList is not supported".to_string(),
                )),
            },
        }
    }

    fn to_uint(&mut self, data: &[u8]) -> Result<(), Error> {
        let value = read_uint_be(data)?;
        self.out.push_str(&value.to_string())
    }

    fn to_int(&mut self, data: &[u8]) -> Result<(), Error> {
        let value = read_int_be(data)?;
        self.out.push_str(&value.to_string())
    }

    fn to_octet(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidData("empty octetArray field".to_string()));
        }
        if !self.flags.contains(JsonFlags::OCTETS_NOINT) && data.len() <= 8 {
            return self.to_uint(data);
        }

        let mut hex = String::with_capacity(2 * data.len() + 4);
        hex.push_str("\"0x");
        for byte in data {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex.push('"');
        self.out.push_str(&hex)
    }

    fn to_float(&mut self, data: &[u8]) -> Result<(), Error> {
        let value = read_float_be(data)?;

        if value.is_finite() {
            let text = format_g(value, if data.len() == 4 { 6 } else { 15 });
            return self.out.push_str(&text);
        }

        let text = if value.is_infinite() && value > 0.0 {
            "\"Infinity\""
        } else if value.is_infinite() {
            "\"-Infinity\""
        } else {
            "\"NaN\""
        };
        self.out.push_str(text)
    }

    fn to_bool(&mut self, data: &[u8]) -> Result<(), Error> {
        let value = read_bool(data)?;
        self.out.push_str(if value { "true" } else { "false" })
    }

    fn to_mac(&mut self, data: &[u8]) -> Result<(), Error> {
        let mac = format_mac(data)?;
        self.out.push_byte(b'"')?;
        self.out.push_str(&mac)?;
        self.out.push_byte(b'"')
    }

    fn to_ipv4(&mut self, data: &[u8]) -> Result<(), Error> {
        let addr = bytes::read_ipv4(data)?;
        self.out.push_byte(b'"')?;
        self.out.push_str(&addr.to_string())?;
        self.out.push_byte(b'"')
    }

    fn to_ipv6(&mut self, data: &[u8]) -> Result<(), Error> {
        let addr = bytes::read_ipv6(data)?;
        self.out.push_byte(b'"')?;
        self.out.push_str(&addr.to_string())?;
        self.out.push_byte(b'"')
    }

    fn to_datetime(&mut self, data: &[u8], precision: TimePrecision) -> Result<(), Error> {
        let (secs, nanos) = read_datetime_be(data, precision)?;

        if self.flags.contains(JsonFlags::TS_FORMAT_MSEC) {
            let text = format_iso8601_ms(secs, nanos);
            self.out.push_byte(b'"')?;
            self.out.push_str(&text)?;
            return self.out.push_byte(b'"');
        }

        let unix_ms = secs
            .wrapping_mul(1000)
            .wrapping_add(u64::from(nanos) / 1_000_000);
        self.out.push_str(&unix_ms.to_string())
    }

    /// `tcpControlBits` as `.A..SF`-style text (bits 5..0 of the low byte).
    fn to_tcp_flags(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() != 1 && data.len() != 2 {
            return Err(Error::InvalidData(format!(
                "tcpControlBits field must be 1 or 2 bytes, got {}",
                data.len()
            )));
        }
        let flags = data[data.len() - 1];

        let mut text = [b'"'; 8];
        text[1] = if flags & 0x20 != 0 { b'U' } else { b'.' };
        text[2] = if flags & 0x10 != 0 { b'A' } else { b'.' };
        text[3] = if flags & 0x08 != 0 { b'P' } else { b'.' };
        text[4] = if flags & 0x04 != 0 { b'R' } else { b'.' };
        text[5] = if flags & 0x02 != 0 { b'S' } else { b'.' };
        text[6] = if flags & 0x01 != 0 { b'F' } else { b'.' };
        self.out.push_bytes(&text)
    }

    fn to_proto(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() != 1 {
            return Err(Error::InvalidData(format!(
                "protocolIdentifier field must be 1 byte, got {}",
                data.len()
            )));
        }

        self.out.push_byte(b'"')?;
        match protocol_name(data[0]) {
            Some(name) => self.out.push_str(name)?,
            None => self.out.push_str(&data[0].to_string())?,
        }
        self.out.push_byte(b'"')
    }

    /// JSON string escaping per RFC 8259, with the library's additions:
    /// C1 controls escape as `\u00XX` too, invalid UTF-8 becomes U+FFFD and
    /// [`JsonFlags::NON_PRINTABLE`] drops non-printable characters entirely.
    fn to_escaped_string(&mut self, data: &[u8]) -> Result<(), Error> {
        self.out.push_byte(b'"')?;

        let mut pos = 0;
        while pos < data.len() {
            let char_len = utf8_char_len(&data[pos..]);
            let step = char_len.max(1);
            let byte = data[pos];

            let named_escape = matches!(byte, b'\n' | b'\r' | b'\t' | 0x08 | 0x0C);
            let control = byte <= 0x1F || byte == 0x7F || (0x80..=0x9F).contains(&byte);

            if char_len > 0 && byte != b'"' && byte != b'\\' && !control {
                self.out.push_bytes(&data[pos..pos + char_len])?;
                pos += step;
                continue;
            }

            if byte == b'"' {
                self.out.push_str("\\\"")?;
            } else if byte == b'\\' {
                self.out.push_str("\\\\")?;
            } else if self.flags.contains(JsonFlags::NON_PRINTABLE) {
                // Dropped entirely.
            } else if named_escape {
                let escaped = match byte {
                    b'\n' => "\\n",
                    b'\r' => "\\r",
                    b'\t' => "\\t",
                    0x08 => "\\b",
                    _ => "\\f",
                };
                self.out.push_str(escaped)?;
            } else if control {
                self.out.push_str(&format!("\\u00{byte:02X}"))?;
            } else {
                // Invalid UTF-8: U+FFFD replacement character.
                self.out.push_bytes(&[0xEF, 0xBF, 0xBD])?;
            }
            pos += step;
        }

        self.out.push_byte(b'"')
    }

    fn to_basic_list(&mut self, data: &[u8]) -> Result<(), Error> {
        self.out.push_str("{\"@type\":\"basicList\",\"data\":[")?;

        let mut iter = BasicListIter::new(data, self.iemgr)?;
        let mut added = 0usize;

        while let Some(item) = iter.next() {
            let field = item?;
            if added != 0 {
                self.out.push_str(",")?;
            }

            let rollback = self.out.len();
            match self.convert_value(None, &field) {
                Ok(()) => {}
                Err(err) if is_recoverable(&err) => {
                    self.out.truncate(rollback);
                    self.out.push_str("null")?;
                }
                Err(err) => return Err(err),
            }
            added += 1;
        }

        self.out.push_str("],\"semantic\":\"")?;
        self.out.push_str(iter.semantic.as_str())?;
        self.out.push_str("\",\"fieldID\":\"")?;

        let key = match &iter.field.def {
            Some(def) if !self.flags.contains(JsonFlags::NUMERIC_ID) => {
                format!("{}:{}", def.scope_name, def.name)
            }
            _ => format!("en{}:id{}", iter.field.en, iter.field.id),
        };
        self.out.push_str(&key)?;
        self.out.push_str("\"}")
    }

    fn to_sub_template_list(&mut self, rec: &DataRecord, data: &[u8]) -> Result<(), Error> {
        let Some(snapshot) = &rec.snapshot else {
            return Err(Error::InvalidData(
                "subTemplateList without a template snapshot".to_string(),
            ));
        };

        self.out.push_str("{\"@type\":\"subTemplateList\",\"semantic\":\"")?;

        let mut iter = SubTemplateListIter::new(data, snapshot, ListFlags::empty())?;
        self.out.push_str(iter.semantic.as_str())?;
        self.out.push_str("\",\"data\":[")?;

        let mut added = 0usize;
        while let Some(item) = iter.next() {
            let nested = item?;
            if added != 0 {
                self.out.push_str(",")?;
            }
            self.out.push_str("{")?;
            self.iter_loop(&nested, false)?;
            self.out.push_str("}")?;
            added += 1;
        }

        self.out.push_str("]}")
    }

    fn to_sub_template_multilist(&mut self, rec: &DataRecord, data: &[u8]) -> Result<(), Error> {
        let Some(snapshot) = &rec.snapshot else {
            return Err(Error::InvalidData(
                "subTemplateMultiList without a template snapshot".to_string(),
            ));
        };

        self.out
            .push_str("{\"@type\":\"subTemplateMultiList\",\"semantic\":\"")?;

        let mut iter = SubTemplateMultiListIter::new(data, snapshot, ListFlags::empty())?;
        self.out.push_str(iter.semantic.as_str())?;
        self.out.push_str("\",\"data\":[")?;

        let mut blocks = 0usize;
        while let Some(block) = iter.next_block() {
            block?;
            if blocks != 0 {
                self.out.push_str(",")?;
            }
            self.out.push_str("[")?;

            let mut records = 0usize;
            while let Some(item) = iter.next_record() {
                let nested = item?;
                if records != 0 {
                    self.out.push_str(",")?;
                }
                self.out.push_str("{")?;
                self.iter_loop(&nested, false)?;
                self.out.push_str("}")?;
                records += 1;
            }

            self.out.push_str("]")?;
            blocks += 1;
        }

        self.out.push_str("]}")
    }
}

/// Formats a finite float with `%g` semantics: `precision` significant
/// digits, fixed notation for exponents in `[-4, precision)`, scientific
/// otherwise, trailing zeros removed.
fn format_g(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }

    let sci = format!("{:.*e}", precision.saturating_sub(1), value);
    let Some((mantissa, exp_str)) = sci.split_once('e') else {
        return sci;
    };
    let Ok(exp) = exp_str.parse::<i32>() else {
        return sci;
    };

    let negative = mantissa.starts_with('-');
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();
    let trimmed = digits.trim_end_matches('0');
    let digits = if trimmed.is_empty() { "0" } else { trimmed };

    let mut text = String::new();
    if negative {
        text.push('-');
    }

    if exp >= -4 && (exp as i64) < precision as i64 {
        if exp >= 0 {
            let int_len = exp as usize + 1;
            if digits.len() <= int_len {
                text.push_str(digits);
                for _ in digits.len()..int_len {
                    text.push('0');
                }
            } else {
                text.push_str(&digits[..int_len]);
                text.push('.');
                text.push_str(&digits[int_len..]);
            }
        } else {
            text.push_str("0.");
            for _ in 0..(-exp - 1) {
                text.push('0');
            }
            text.push_str(digits);
        }
    } else {
        text.push_str(&digits[..1]);
        if digits.len() > 1 {
            text.push('.');
            text.push_str(&digits[1..]);
        }
        text.push('e');
        text.push_str(&exp.to_string());
    }
    text
}

/// `YYYY-MM-DDThh:mm:ss.mmmZ` for a Unix timestamp.
fn format_iso8601_ms(secs: u64, nanos: u32) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
        nanos / 1_000_000
    )
}

/// Gregorian date from days since the Unix epoch (Howard Hinnant's
/// `civil_from_days` algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if month <= 2 { year + 1 } else { year }, month, day)
}
