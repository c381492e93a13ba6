//! IPFIX message structure.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011#section-3>
//!
//! A message is a 16-byte header followed by a concatenation of Sets. Set ids
//! 2 and 3 carry (Options) Template Records, ids 256 and above carry Data
//! Records described by the template of the same id. [`SetsIter`] walks the
//! Sets of one message; [`TemplateSetIter`] walks the records of one
//! (Options) Template Set, classifying definitions and withdrawals.

use crate::Error;
use crate::template::{
    MIN_DATA_SET_ID, SET_OPTS_TEMPLATE, SET_TEMPLATE, Template, TemplateType,
};

use nom_derive::{Nom, Parse};
use serde::Serialize;

/// Protocol version carried in every message header.
pub const IPFIX_VERSION: u16 = 10;

/// Byte length of the message header.
pub const MSG_HEADER_LEN: usize = 16;

/// Byte length of a set header.
pub const SET_HEADER_LEN: usize = 4;

/// IPFIX Message Header (RFC 7011, Section 3.1).
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct MessageHeader {
    /// Version of the Flow Record format; 0x000a for IPFIX.
    pub version: u16,
    /// Total length of the message in octets, header included.
    pub length: u16,
    /// Export time: seconds since the Unix epoch at which the message left
    /// the exporter.
    pub export_time: u32,
    /// Sequence counter modulo 2^32 of all Data Records sent in the session.
    pub sequence_number: u32,
    /// Identifier of the Observation Domain, locally unique to the exporter.
    pub observation_domain_id: u32,
}

impl MessageHeader {
    /// Parses and validates a message header, returning the message body
    /// (bounded by the header's length field) and whatever follows it.
    pub fn parse_message(data: &[u8]) -> Result<(Self, &[u8], &[u8]), Error> {
        let (_, header) = Self::parse(data)
            .map_err(|_| Error::Format("message shorter than the IPFIX header".to_string()))?;

        if header.version != IPFIX_VERSION {
            return Err(Error::Format(format!(
                "unsupported version {} (expected {IPFIX_VERSION})",
                header.version
            )));
        }

        let total = usize::from(header.length);
        if total < MSG_HEADER_LEN || total > data.len() {
            return Err(Error::Format(format!(
                "message length {total} out of bounds ({} bytes available)",
                data.len()
            )));
        }

        Ok((header, &data[MSG_HEADER_LEN..total], &data[total..]))
    }
}

/// One Set of a message: the set id and the body after the 4-byte header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetView<'a> {
    pub id: u16,
    pub body: &'a [u8],
}

impl SetView<'_> {
    /// True for Template Sets and Options Template Sets.
    pub fn is_template_set(&self) -> bool {
        self.id == SET_TEMPLATE || self.id == SET_OPTS_TEMPLATE
    }

    /// True for Data Sets (id 256 and above).
    pub fn is_data_set(&self) -> bool {
        self.id >= MIN_DATA_SET_ID
    }
}

/// Iterator over the Sets of one message body.
///
/// The iterator is terminating: once an error is reported, every following
/// `next()` call repeats it.
pub struct SetsIter<'a> {
    remaining: &'a [u8],
    error: Option<Error>,
}

impl<'a> SetsIter<'a> {
    /// Starts iterating the body of a message (everything after the header).
    pub fn new(body: &'a [u8]) -> Self {
        Self { remaining: body, error: None }
    }
}

impl<'a> Iterator for SetsIter<'a> {
    type Item = Result<SetView<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }
        if self.remaining.is_empty() {
            return None;
        }

        if self.remaining.len() < SET_HEADER_LEN {
            let err = Error::Format(format!(
                "{} trailing bytes do not form a set header",
                self.remaining.len()
            ));
            self.error = Some(err.clone());
            return Some(Err(err));
        }

        let id = u16::from_be_bytes([self.remaining[0], self.remaining[1]]);
        let length = usize::from(u16::from_be_bytes([self.remaining[2], self.remaining[3]]));

        if length < SET_HEADER_LEN || length > self.remaining.len() {
            let err = Error::Format(format!(
                "set {id}: length {length} overruns the message ({} bytes left)",
                self.remaining.len()
            ));
            self.error = Some(err.clone());
            return Some(Err(err));
        }

        let body = &self.remaining[SET_HEADER_LEN..length];
        self.remaining = &self.remaining[length..];
        Some(Ok(SetView { id, body }))
    }
}

/// A record yielded by [`TemplateSetIter`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TsetRecord {
    /// A (Options) Template definition.
    Definition(Template),
    /// Withdrawal of a single template id.
    Withdrawal { id: u16, ttype: TemplateType },
    /// Withdrawal of all templates of this type.
    AllWithdrawal { ttype: TemplateType },
}

/// Iterator over the records of one (Options) Template Set.
///
/// Enforces RFC 7011, Section 8: an all-withdrawal must be the only record of
/// its Set, and definitions never mix with withdrawals inside one Set. Up to
/// three bytes of padding at the end of the Set are tolerated.
pub struct TemplateSetIter<'a> {
    remaining: &'a [u8],
    ttype: TemplateType,
    seen_definition: bool,
    seen_withdrawal: bool,
    error: Option<Error>,
}

impl<'a> TemplateSetIter<'a> {
    /// Starts iterating a Template Set (id 2) or Options Template Set (id 3).
    pub fn new(set: &SetView<'a>) -> Result<Self, Error> {
        let ttype = match set.id {
            SET_TEMPLATE => TemplateType::Data,
            SET_OPTS_TEMPLATE => TemplateType::Options,
            other => {
                return Err(Error::InvalidArg(format!(
                    "set {other} is not a template set"
                )));
            }
        };

        Ok(Self {
            remaining: set.body,
            ttype,
            seen_definition: false,
            seen_withdrawal: false,
            error: None,
        })
    }

    fn fail(&mut self, err: Error) -> Option<Result<TsetRecord, Error>> {
        self.error = Some(err.clone());
        Some(Err(err))
    }
}

impl Iterator for TemplateSetIter<'_> {
    type Item = Result<TsetRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }
        // Anything shorter than a record header is set padding.
        if self.remaining.len() < 4 {
            return None;
        }

        let (tmplt, consumed) = match Template::parse(self.ttype, self.remaining) {
            Ok(parsed) => parsed,
            Err(err) => return self.fail(err),
        };
        self.remaining = &self.remaining[consumed..];

        if !tmplt.is_withdrawal() {
            if self.seen_withdrawal {
                return self.fail(Error::Format(
                    "template definition mixed with withdrawals in one set".to_string(),
                ));
            }
            self.seen_definition = true;
            return Some(Ok(TsetRecord::Definition(tmplt)));
        }

        if self.seen_definition {
            return self.fail(Error::Format(
                "template withdrawal mixed with definitions in one set".to_string(),
            ));
        }

        if tmplt.id < MIN_DATA_SET_ID {
            // All-withdrawal: must be the only record of the set.
            if self.seen_withdrawal || self.remaining.len() >= 4 {
                return self.fail(Error::Format(
                    "all-template withdrawal combined with other records".to_string(),
                ));
            }
            self.seen_withdrawal = true;
            return Some(Ok(TsetRecord::AllWithdrawal { ttype: self.ttype }));
        }

        self.seen_withdrawal = true;
        Some(Ok(TsetRecord::Withdrawal { id: tmplt.id, ttype: self.ttype }))
    }
}
