//! Structured list decoding (RFC 6313).
//!
//! Three container types pack values or whole records inside a single field:
//! `basicList` (repeated values of one Information Element),
//! `subTemplateList` (records of one template) and `subTemplateMultiList`
//! (blocks of records, each block with its own template). Templates are
//! resolved through the snapshot the enclosing record was decoded under.
//!
//! All iterators validate nested lengths against the enclosing field and
//! latch on the first malformed element; block and record stepping of the
//! multilist are independent so a caller may skip ahead without draining a
//! block.

use crate::Error;
use crate::iemgr::IeManager;
use crate::record::{DataRecord, DrecField, record_wire_length};
use crate::template::{FieldFlags, Template, TemplateField, VAR_IE_LEN};
use crate::template_mgr::Snapshot;

use bitflags::bitflags;
use serde::Serialize;

use std::sync::Arc;

bitflags! {
    /// List iteration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ListFlags: u8 {
        /// Surface a missing template as [`Error::NotFound`] instead of
        /// skipping silently.
        const REPORT = 0x01;
    }
}

/// Structured data semantics (RFC 6313, Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ListSemantics {
    NoneOf,
    ExactlyOneOf,
    OneOrMoreOf,
    AllOf,
    Ordered,
    Undefined,
}

impl From<u8> for ListSemantics {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::NoneOf,
            1 => Self::ExactlyOneOf,
            2 => Self::OneOrMoreOf,
            3 => Self::AllOf,
            4 => Self::Ordered,
            _ => Self::Undefined,
        }
    }
}

impl ListSemantics {
    /// The camelCase spelling used in rendered output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoneOf => "noneOf",
            Self::ExactlyOneOf => "exactlyOneOf",
            Self::OneOrMoreOf => "oneOrMoreOf",
            Self::AllOf => "allOf",
            Self::Ordered => "ordered",
            Self::Undefined => "undefined",
        }
    }
}

/// Iterator over the values of a `basicList`.
///
/// Wire layout: semantic (1 B), field id (2 B), element length (2 B) and an
/// optional enterprise number (4 B) when the id's high bit is set, followed
/// by packed values.
pub struct BasicListIter<'a> {
    remaining: &'a [u8],
    offset: usize,
    pub semantic: ListSemantics,
    /// Synthetic field descriptor shared by every value of the list.
    pub field: TemplateField,
    index: usize,
    error: Option<Error>,
}

impl<'a> BasicListIter<'a> {
    /// Parses the list header; values come from `next()`.
    pub fn new(data: &'a [u8], iemgr: Option<&IeManager>) -> Result<Self, Error> {
        if data.len() < 5 {
            return Err(Error::Format(format!(
                "basicList header needs 5 bytes, got {}",
                data.len()
            )));
        }

        let semantic = ListSemantics::from(data[0]);
        let raw_id = u16::from_be_bytes([data[1], data[2]]);
        let length = u16::from_be_bytes([data[3], data[4]]);

        let (id, en, header_len) = if raw_id & 0x8000 != 0 {
            if data.len() < 9 {
                return Err(Error::Format(
                    "basicList with enterprise bit needs a 9-byte header".to_string(),
                ));
            }
            let en = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);
            (raw_id & 0x7FFF, en, 9)
        } else {
            (raw_id, 0, 5)
        };

        let def = iemgr.and_then(|mgr| mgr.elem_find_id(en, id));
        let mut flags = FieldFlags::LAST_IE;
        if def.as_ref().is_some_and(|d| d.is_reverse) {
            flags |= FieldFlags::REVERSE;
        }

        Ok(Self {
            remaining: &data[header_len..],
            offset: 0,
            semantic,
            field: TemplateField { id, en, length, offset: 0, flags, def },
            index: 0,
            error: None,
        })
    }

    fn fail(&mut self, err: Error) -> Option<Result<DrecField<'a>, Error>> {
        self.error = Some(err.clone());
        Some(Err(err))
    }
}

impl<'a> Iterator for BasicListIter<'a> {
    type Item = Result<DrecField<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }
        if self.offset >= self.remaining.len() {
            return None;
        }

        let data = self.remaining;
        let (value, next_offset) = if self.field.length != VAR_IE_LEN {
            let end = self.offset + usize::from(self.field.length);
            if self.field.length == 0 || end > data.len() {
                return self.fail(Error::Format(format!(
                    "basicList value overruns the list ({} bytes left)",
                    data.len() - self.offset
                )));
            }
            (&data[self.offset..end], end)
        } else {
            let first = data[self.offset];
            let (len, start) = if first == 255 {
                if self.offset + 3 > data.len() {
                    return self.fail(Error::Format(
                        "basicList variable-length prefix overruns the list".to_string(),
                    ));
                }
                let len = u16::from_be_bytes([data[self.offset + 1], data[self.offset + 2]]);
                (usize::from(len), self.offset + 3)
            } else {
                (usize::from(first), self.offset + 1)
            };
            let end = start + len;
            if end > data.len() {
                return self.fail(Error::Format(
                    "basicList value overruns the list".to_string(),
                ));
            }
            (&data[start..end], end)
        };

        self.offset = next_offset;
        let index = self.index;
        self.index += 1;

        Some(Ok(DrecField {
            index,
            data: value,
            info: self.field.clone(),
            en: self.field.en,
            id: self.field.id,
        }))
    }
}

/// Iterator over the records of a `subTemplateList`.
///
/// Wire layout: semantic (1 B), template id (2 B), packed records.
pub struct SubTemplateListIter<'a> {
    remaining: &'a [u8],
    pub semantic: ListSemantics,
    pub template_id: u16,
    tmplt: Option<Arc<Template>>,
    snapshot: Snapshot,
    flags: ListFlags,
    reported_missing: bool,
    error: Option<Error>,
}

impl<'a> SubTemplateListIter<'a> {
    pub fn new(data: &'a [u8], snapshot: &Snapshot, flags: ListFlags) -> Result<Self, Error> {
        if data.len() < 3 {
            return Err(Error::Format(format!(
                "subTemplateList header needs 3 bytes, got {}",
                data.len()
            )));
        }

        let semantic = ListSemantics::from(data[0]);
        let template_id = u16::from_be_bytes([data[1], data[2]]);
        let tmplt = snapshot.get(template_id).cloned();

        Ok(Self {
            remaining: &data[3..],
            semantic,
            template_id,
            tmplt,
            snapshot: snapshot.clone(),
            flags,
            reported_missing: false,
            error: None,
        })
    }

    fn fail(&mut self, err: Error) -> Option<Result<DataRecord<'a>, Error>> {
        self.error = Some(err.clone());
        Some(Err(err))
    }
}

impl<'a> Iterator for SubTemplateListIter<'a> {
    type Item = Result<DataRecord<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }

        let Some(tmplt) = self.tmplt.clone() else {
            // Unknown template: report once when asked to, end silently
            // otherwise.
            if self.flags.contains(ListFlags::REPORT) && !self.reported_missing {
                self.reported_missing = true;
                return Some(Err(Error::NotFound(format!(
                    "template {} is not in the snapshot",
                    self.template_id
                ))));
            }
            return None;
        };

        if self.remaining.is_empty() {
            return None;
        }

        let length = match record_wire_length(&tmplt, self.remaining) {
            Ok(len) => len,
            Err(_) => {
                return self.fail(Error::Format(format!(
                    "subTemplateList record of template {} overruns the list",
                    self.template_id
                )));
            }
        };

        let data = &self.remaining[..length];
        self.remaining = &self.remaining[length..];
        Some(Ok(DataRecord {
            data,
            tmplt,
            snapshot: Some(self.snapshot.clone()),
        }))
    }
}

/// One block of a `subTemplateMultiList`.
#[derive(Debug, Clone)]
pub struct StmListBlock {
    pub template_id: u16,
    /// Bytes of the block body (records only, header excluded).
    pub length: usize,
}

/// Iterator over a `subTemplateMultiList`.
///
/// Wire layout: semantic (1 B), then repeated blocks of (template id (2 B),
/// block length (2 B, header included per RFC 6313 Errata), records).
/// Stepping is two-level: [`next_block`](Self::next_block) advances to the
/// following block regardless of how many records of the current one were
/// consumed; [`next_record`](Self::next_record) yields records of the
/// current block.
pub struct SubTemplateMultiListIter<'a> {
    remaining: &'a [u8],
    pub semantic: ListSemantics,
    block_records: &'a [u8],
    block_tmplt: Option<Arc<Template>>,
    current_block: Option<StmListBlock>,
    snapshot: Snapshot,
    flags: ListFlags,
    error: Option<Error>,
}

impl<'a> SubTemplateMultiListIter<'a> {
    pub fn new(data: &'a [u8], snapshot: &Snapshot, flags: ListFlags) -> Result<Self, Error> {
        if data.is_empty() {
            return Err(Error::Format(
                "subTemplateMultiList header needs 1 byte".to_string(),
            ));
        }

        Ok(Self {
            remaining: &data[1..],
            semantic: ListSemantics::from(data[0]),
            block_records: &[],
            block_tmplt: None,
            current_block: None,
            snapshot: snapshot.clone(),
            flags,
            error: None,
        })
    }

    /// Advances to the next block, discarding unread records of the current
    /// one. Blocks whose template is unknown are skipped silently unless
    /// [`ListFlags::REPORT`] is set, in which case `NotFound` is surfaced
    /// once per missing block and iteration may continue afterwards.
    pub fn next_block(&mut self) -> Option<Result<StmListBlock, Error>> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }

        loop {
            self.block_records = &[];
            self.block_tmplt = None;
            self.current_block = None;

            if self.remaining.is_empty() {
                return None;
            }
            if self.remaining.len() < 4 {
                let err = Error::Format(format!(
                    "{} trailing bytes do not form a multilist block header",
                    self.remaining.len()
                ));
                self.error = Some(err.clone());
                return Some(Err(err));
            }

            let template_id = u16::from_be_bytes([self.remaining[0], self.remaining[1]]);
            let total = usize::from(u16::from_be_bytes([self.remaining[2], self.remaining[3]]));

            // The block length covers its own 4-byte header.
            if total < 4 || total > self.remaining.len() {
                let err = Error::Format(format!(
                    "multilist block of template {template_id}: length {total} overruns the list"
                ));
                self.error = Some(err.clone());
                return Some(Err(err));
            }

            let records = &self.remaining[4..total];
            self.remaining = &self.remaining[total..];

            match self.snapshot.get(template_id).cloned() {
                Some(tmplt) => {
                    let block = StmListBlock { template_id, length: records.len() };
                    self.block_records = records;
                    self.block_tmplt = Some(tmplt);
                    self.current_block = Some(block.clone());
                    return Some(Ok(block));
                }
                None if self.flags.contains(ListFlags::REPORT) => {
                    return Some(Err(Error::NotFound(format!(
                        "template {template_id} is not in the snapshot"
                    ))));
                }
                None => {
                    // Silently skip the whole block.
                    continue;
                }
            }
        }
    }

    /// Yields the next record of the current block.
    pub fn next_record(&mut self) -> Option<Result<DataRecord<'a>, Error>> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }

        let tmplt = self.block_tmplt.clone()?;
        if self.block_records.is_empty() {
            return None;
        }

        let length = match record_wire_length(&tmplt, self.block_records) {
            Ok(len) => len,
            Err(_) => {
                let err = Error::Format(format!(
                    "multilist record of template {} overruns its block",
                    self.current_block
                        .as_ref()
                        .map(|b| b.template_id)
                        .unwrap_or_default()
                ));
                self.error = Some(err.clone());
                return Some(Err(err));
            }
        };

        let data = &self.block_records[..length];
        self.block_records = &self.block_records[length..];
        Some(Ok(DataRecord {
            data,
            tmplt,
            snapshot: Some(self.snapshot.clone()),
        }))
    }
}
