//! Data Record access.
//!
//! A [`DataRecord`] ties a byte slice to the template that describes it and
//! the snapshot it was decoded under. [`DrecIter`] walks the fields in wire
//! order, decoding fixed- and variable-length values; flags select the biflow
//! reverse view and control skipping of unknown or reverse-only fields.
//!
//! Iterators are terminating: after a malformed field is reported, every
//! further `next()` call repeats the same error instead of advancing.

use crate::Error;
use crate::template::{FieldFlags, Template, TemplateField, VAR_IE_LEN};
use crate::template_mgr::Snapshot;

use bitflags::bitflags;

use std::sync::Arc;

bitflags! {
    /// Field iteration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrecFlags: u8 {
        /// Omit fields without an IE definition.
        const UNKNOWN_SKIP = 0x01;
        /// Present the biflow reverse view of the record.
        const BIFLOW_REV   = 0x02;
        /// Omit fields flagged REVERSE in the active view.
        const REVERSE_SKIP = 0x04;
        /// Yield `paddingOctets` fields instead of skipping them.
        const PADDING_SHOW = 0x08;
    }
}

/// IANA `paddingOctets`, skipped by iterators unless
/// [`DrecFlags::PADDING_SHOW`] is set.
const IANA_PADDING: u16 = 210;

/// A Data Record: raw bytes plus the template and snapshot they belong to.
#[derive(Debug, Clone)]
pub struct DataRecord<'a> {
    pub data: &'a [u8],
    pub tmplt: Arc<Template>,
    /// Snapshot for resolving templates of nested subTemplate lists.
    pub snapshot: Option<Snapshot>,
}

impl<'a> DataRecord<'a> {
    /// Wraps a record, checking the slice against the template's minimum
    /// record length.
    pub fn new(
        data: &'a [u8],
        tmplt: Arc<Template>,
        snapshot: Option<Snapshot>,
    ) -> Result<Self, Error> {
        if (data.len() as u32) < tmplt.data_length {
            return Err(Error::InvalidData(format!(
                "record of {} bytes is shorter than the template minimum {}",
                data.len(),
                tmplt.data_length
            )));
        }
        Ok(Self { data, tmplt, snapshot })
    }

    /// Iterates the record's fields.
    pub fn iter(&self, flags: DrecFlags) -> DrecIter<'a> {
        DrecIter::new(self, flags)
    }

    /// Finds the first occurrence of an Information Element in the record.
    pub fn find(&self, en: u32, id: u16) -> Option<DrecField<'a>> {
        self.iter(DrecFlags::empty())
            .filter_map(|f| f.ok())
            .find(|f| f.en == en && f.id == id)
    }

    /// Number of fields described by the template.
    pub fn field_count(&self) -> u16 {
        self.tmplt.fields_cnt_total
    }
}

/// One decoded field of a Data Record.
#[derive(Debug, Clone)]
pub struct DrecField<'a> {
    /// Field position within the template.
    pub index: usize,
    /// Value bytes (variable-length prefix already stripped).
    pub data: &'a [u8],
    /// Field metadata from the active (forward or reverse) view.
    pub info: TemplateField,
    /// Enterprise number of the active view.
    pub en: u32,
    /// Information Element id of the active view.
    pub id: u16,
}

/// Computes the on-wire byte length of one record, following variable-length
/// prefixes. Used by list iterators to step over packed records.
pub(crate) fn record_wire_length(tmplt: &Template, data: &[u8]) -> Result<usize, Error> {
    let mut offset = 0usize;
    for field in &tmplt.fields {
        let (_, advance) = field_slice(field, data, offset)?;
        offset = advance;
    }
    Ok(offset)
}

/// Decodes the value slice of `field` starting at `offset`.
///
/// Returns the value slice and the offset of the next field. Variable-length
/// fields consume one length byte, or three when the first byte is 255
/// (RFC 7011, Section 7).
fn field_slice<'a>(
    field: &TemplateField,
    data: &'a [u8],
    offset: usize,
) -> Result<(&'a [u8], usize), Error> {
    let overrun = || {
        Error::InvalidData(format!(
            "field ({}, {}) overruns the record ({} bytes)",
            field.en,
            field.id,
            data.len()
        ))
    };

    if field.length != VAR_IE_LEN {
        let end = offset + usize::from(field.length);
        if end > data.len() {
            return Err(overrun());
        }
        return Ok((&data[offset..end], end));
    }

    let first = *data.get(offset).ok_or_else(overrun)?;
    let (len, value_start) = if first == 255 {
        if offset + 3 > data.len() {
            return Err(overrun());
        }
        let len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]);
        (usize::from(len), offset + 3)
    } else {
        (usize::from(first), offset + 1)
    };

    let end = value_start + len;
    if end > data.len() {
        return Err(overrun());
    }
    Ok((&data[value_start..end], end))
}

/// Iterator over the fields of one Data Record.
pub struct DrecIter<'a> {
    data: &'a [u8],
    fields: Vec<TemplateField>,
    index: usize,
    offset: usize,
    flags: DrecFlags,
    error: Option<Error>,
}

impl<'a> DrecIter<'a> {
    fn new(rec: &DataRecord<'a>, flags: DrecFlags) -> Self {
        // The reverse view substitutes the remapped field array; lengths and
        // wire layout are identical to the forward one.
        let fields = if flags.contains(DrecFlags::BIFLOW_REV) {
            rec.tmplt.fields_rev.clone().unwrap_or_else(|| rec.tmplt.fields.clone())
        } else {
            rec.tmplt.fields.clone()
        };

        Self {
            data: rec.data,
            fields,
            index: 0,
            offset: 0,
            flags,
            error: None,
        }
    }
}

impl<'a> Iterator for DrecIter<'a> {
    type Item = Result<DrecField<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }

        while self.index < self.fields.len() {
            let field = &self.fields[self.index];
            let (data, next_offset) = match field_slice(field, self.data, self.offset) {
                Ok(decoded) => decoded,
                Err(err) => {
                    self.error = Some(err.clone());
                    return Some(Err(err));
                }
            };

            let index = self.index;
            self.index += 1;
            self.offset = next_offset;

            if !self.flags.contains(DrecFlags::PADDING_SHOW)
                && field.en == 0
                && field.id == IANA_PADDING
            {
                continue;
            }
            if self.flags.contains(DrecFlags::UNKNOWN_SKIP) && field.def.is_none() {
                continue;
            }
            if self.flags.contains(DrecFlags::REVERSE_SKIP)
                && field.flags.contains(FieldFlags::REVERSE)
            {
                continue;
            }

            let info = self.fields[index].clone();
            let (en, id) = (info.en, info.id);
            return Some(Ok(DrecField { index, data, info, en, id }));
        }
        None
    }
}

/// Iterator over the Data Records of one Data Set.
///
/// Records are packed back to back; up to `min_record_len - 1` trailing
/// bytes count as set padding. A record overrunning the set latches
/// [`Error::InvalidData`].
#[derive(Debug)]
pub struct DataSetIter<'a> {
    remaining: &'a [u8],
    tmplt: Arc<Template>,
    snapshot: Snapshot,
    error: Option<Error>,
}

impl<'a> DataSetIter<'a> {
    /// Starts iterating a Data Set body, resolving the template through the
    /// snapshot.
    pub fn new(set_id: u16, body: &'a [u8], snapshot: &Snapshot) -> Result<Self, Error> {
        let tmplt = snapshot
            .get(set_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no template for data set {set_id}")))?;

        Ok(Self {
            remaining: body,
            tmplt,
            snapshot: snapshot.clone(),
            error: None,
        })
    }

    /// Template describing the records of this set.
    pub fn template(&self) -> &Arc<Template> {
        &self.tmplt
    }
}

impl<'a> Iterator for DataSetIter<'a> {
    type Item = Result<DataRecord<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone()));
        }

        let min_len = (self.tmplt.data_length as usize).max(1);
        if self.remaining.len() < min_len {
            // Set padding.
            return None;
        }

        let length = match record_wire_length(&self.tmplt, self.remaining) {
            Ok(len) => len,
            Err(err) => {
                self.error = Some(err.clone());
                return Some(Err(err));
            }
        };

        let data = &self.remaining[..length];
        self.remaining = &self.remaining[length..];
        Some(Ok(DataRecord {
            data,
            tmplt: self.tmplt.clone(),
            snapshot: Some(self.snapshot.clone()),
        }))
    }
}
