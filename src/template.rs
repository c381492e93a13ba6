//! IPFIX (Options) Template records.
//!
//! A template maps positions in a Data Record to `(enterprise, id, length)`
//! triples (RFC 7011, Section 3.4). Parsing keeps the raw wire bytes verbatim
//! next to the structured form so refresh detection and re-serialisation are
//! exact. After parsing, structural features are derived: per-field flags
//! (scope membership, repeated IEs), record offsets, the expected data record
//! length and, for Options Templates, the standard shapes of RFC 7011
//! Sections 4.1-4.4 and RFC 5610.

use crate::Error;
use crate::iemgr::{Element, IeManager};

use bitflags::bitflags;
use log::trace;
use nom::number::complete::{be_u16, be_u32};
use serde::Serialize;

use std::sync::Arc;

/// Field length sentinel for variable-length Information Elements.
pub const VAR_IE_LEN: u16 = 65535;

/// Offset sentinel: the field position depends on preceding variable-length
/// fields and must be computed per record.
pub const VAR_OFFSET: u16 = 65535;

/// Maximum byte length of a data record: a 65535-byte message minus the
/// 16-byte message header and 4-byte set header.
pub const MAX_RECORD_LEN: u32 = 65515;

/// Reserved set/template id for Template Sets.
pub const SET_TEMPLATE: u16 = 2;
/// Reserved set/template id for Options Template Sets.
pub const SET_OPTS_TEMPLATE: u16 = 3;
/// First template id usable by Data Sets.
pub const MIN_DATA_SET_ID: u16 = 256;

bitflags! {
    /// Feature flags of a whole template.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct TemplateFlags: u8 {
        /// At least one Information Element occurs multiple times.
        const MULTI_IE = 0x01;
        /// At least one field has variable length.
        const DYNAMIC  = 0x02;
        /// At least one field is a reverse (biflow) Information Element.
        const BIFLOW   = 0x04;
        /// At least one field is a structured (RFC 6313) list.
        const STRUCT   = 0x08;
        /// A non-zero flow key has been attached.
        const FKEY     = 0x10;
    }
}

bitflags! {
    /// Feature flags of a single template field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct FieldFlags: u8 {
        /// The field is part of an Options Template scope.
        const SCOPE    = 0x01;
        /// Last occurrence of this (enterprise, id) in the template.
        const LAST_IE  = 0x02;
        /// The (enterprise, id) occurs more than once.
        const MULTI_IE = 0x04;
        /// The definition describes the reverse direction of a biflow.
        const REVERSE  = 0x08;
        /// Biflow key: shared by both directions.
        const BKEY     = 0x10;
        /// The definition is a structured list type.
        const STRUCT   = 0x20;
        /// The field is part of the attached flow key.
        const FKEY     = 0x40;
    }
}

bitflags! {
    /// Known Options Template shapes, detected structurally.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct OptsTypes: u8 {
        /// Metering Process statistics (RFC 7011, Section 4.1).
        const MPROC_STAT = 0x01;
        /// Metering Process reliability statistics (RFC 7011, Section 4.2).
        const MPROC_RELIABILITY_STAT = 0x02;
        /// Exporting Process reliability statistics (RFC 7011, Section 4.3).
        const EPROC_RELIABILITY_STAT = 0x04;
        /// Flow Keys (RFC 7011, Section 4.4).
        const FKEYS = 0x08;
        /// Information Element type definition (RFC 5610).
        const IE_TYPE = 0x10;
    }
}

/// Template kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TemplateType {
    Data,
    Options,
}

/// One Field Specifier of a parsed template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateField {
    /// Information Element identifier (enterprise bit already stripped).
    pub id: u16,
    /// Enterprise Number, 0 for IANA.
    pub en: u32,
    /// Declared length; [`VAR_IE_LEN`] for variable-length fields.
    pub length: u16,
    /// Offset inside a data record; [`VAR_OFFSET`] once any preceding field
    /// is variable-length.
    pub offset: u16,
    pub flags: FieldFlags,
    /// Resolved definition, set by [`Template::ies_define`].
    #[serde(skip_serializing)]
    pub def: Option<Arc<Element>>,
}

/// A parsed (Options) Template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Template {
    pub id: u16,
    pub ttype: TemplateType,
    pub fields_cnt_total: u16,
    /// Scope field count; non-zero only for Options Templates.
    pub fields_cnt_scope: u16,
    pub fields: Vec<TemplateField>,
    /// Reverse field view, materialised only for biflow templates.
    pub fields_rev: Option<Vec<TemplateField>>,
    /// Minimum byte length of a conforming data record.
    pub data_length: u32,
    pub flags: TemplateFlags,
    pub opts_types: OptsTypes,
    /// Raw wire bytes of the template record, preserved verbatim.
    pub raw: Vec<u8>,
    /// Export time the template was first defined (set by the manager).
    pub first_seen: u32,
    /// Export time the template was last seen (set by the manager).
    pub last_seen: u32,
}

fn take_u16(input: &[u8]) -> Result<(&[u8], u16), Error> {
    be_u16::<_, nom::error::Error<&[u8]>>(input)
        .map_err(|_| Error::Format("unexpected end of template record".to_string()))
}

fn take_u32(input: &[u8]) -> Result<(&[u8], u32), Error> {
    be_u32::<_, nom::error::Error<&[u8]>>(input)
        .map_err(|_| Error::Format("unexpected end of template record".to_string()))
}

impl Template {
    /// Parses one template record from the start of `data`.
    ///
    /// Returns the template and the number of bytes consumed, which is the
    /// exact length of [`Template::raw`]. Withdrawal records (field count 0)
    /// parse into a template without fields; the caller classifies them.
    pub fn parse(ttype: TemplateType, data: &[u8]) -> Result<(Self, usize), Error> {
        let (rest, id) = take_u16(data)?;
        let (rest, field_count) = take_u16(rest)?;

        if id < MIN_DATA_SET_ID {
            // Below the data-set range only the all-withdrawal ids are legal.
            if id != SET_TEMPLATE && id != SET_OPTS_TEMPLATE {
                return Err(Error::Format(format!("invalid template id {id}")));
            }
            if field_count != 0 {
                return Err(Error::Format(format!(
                    "reserved template id {id} with non-zero field count"
                )));
            }
            let matches_type = (ttype == TemplateType::Data && id == SET_TEMPLATE)
                || (ttype == TemplateType::Options && id == SET_OPTS_TEMPLATE);
            if !matches_type {
                return Err(Error::Format(format!(
                    "all-withdrawal id {id} does not match the template type"
                )));
            }
        }

        let mut rest = rest;
        let mut scope_count = 0;
        if field_count != 0 && ttype == TemplateType::Options {
            let (r, sc) = take_u16(rest)?;
            rest = r;
            scope_count = sc;
            if scope_count == 0 || scope_count > field_count {
                return Err(Error::Format(format!(
                    "options template {id}: scope count {scope_count} out of range (field count \
                     {field_count})"
                )));
            }
        }

        let mut fields = Vec::with_capacity(usize::from(field_count));
        for _ in 0..field_count {
            let (r, raw_id) = take_u16(rest)?;
            let (r, length) = take_u16(r)?;
            rest = r;

            let (ie_id, en) = if raw_id & 0x8000 != 0 {
                let (r, en) = take_u32(rest)?;
                rest = r;
                (raw_id & 0x7FFF, en)
            } else {
                (raw_id, 0)
            };

            fields.push(TemplateField {
                id: ie_id,
                en,
                length,
                offset: 0,
                flags: FieldFlags::empty(),
                def: None,
            });
        }

        let consumed = data.len() - rest.len();
        let mut tmplt = Self {
            id,
            ttype,
            fields_cnt_total: field_count,
            fields_cnt_scope: scope_count,
            fields,
            fields_rev: None,
            data_length: 0,
            flags: TemplateFlags::empty(),
            opts_types: OptsTypes::empty(),
            raw: data[..consumed].to_vec(),
            first_seen: 0,
            last_seen: 0,
        };

        if field_count != 0 {
            tmplt.calc_features()?;
        }

        trace!(
            "parsed {:?} template {} ({} fields, {} raw bytes)",
            ttype, id, field_count, consumed
        );
        Ok((tmplt, consumed))
    }

    /// True for withdrawal records (field count 0).
    pub fn is_withdrawal(&self) -> bool {
        self.fields_cnt_total == 0
    }

    /// Finds the first field with the given (enterprise, id).
    pub fn find(&self, en: u32, id: u16) -> Option<&TemplateField> {
        self.fields.iter().find(|f| f.id == id && f.en == en)
    }

    /// Compares the raw wire representation with another template.
    pub fn raw_cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw
            .len()
            .cmp(&other.raw.len())
            .then_with(|| self.raw.cmp(&other.raw))
    }

    /// Derives per-field flags, offsets, the record length and (for Options
    /// Templates) the known shapes.
    fn calc_features(&mut self) -> Result<(), Error> {
        self.calc_field_flags();

        let mut data_len: u32 = 0;
        let mut offset: u16 = 0;
        let mut multi = false;
        let mut dynamic = false;

        for field in &mut self.fields {
            field.offset = offset;
            multi |= field.flags.contains(FieldFlags::MULTI_IE);

            if field.length == VAR_IE_LEN {
                // A variable-length element occupies at least its length byte.
                dynamic = true;
                data_len += 1;
                offset = VAR_OFFSET;
                continue;
            }

            data_len += u32::from(field.length);
            if offset != VAR_OFFSET {
                // Overflow is caught by the total length check below.
                offset = offset.wrapping_add(field.length);
            }
        }

        if data_len > MAX_RECORD_LEN {
            return Err(Error::Format(format!(
                "template {}: record length {data_len} exceeds the IPFIX maximum {MAX_RECORD_LEN}",
                self.id
            )));
        }

        self.flags.set(TemplateFlags::MULTI_IE, multi);
        self.flags.set(TemplateFlags::DYNAMIC, dynamic);
        self.data_length = data_len;

        if self.ttype == TemplateType::Options {
            self.detect_opts_types();
        }
        Ok(())
    }

    /// Labels SCOPE, MULTI_IE and LAST_IE flags.
    ///
    /// Scanning runs back-to-front; a 64-bit presence screen over `id % 64`
    /// skips the quadratic duplicate search whenever no hash collision is
    /// possible.
    fn calc_field_flags(&mut self) {
        for field in self.fields.iter_mut().take(usize::from(self.fields_cnt_scope)) {
            field.flags |= FieldFlags::SCOPE;
        }

        let total = self.fields.len();
        let mut hash: u64 = 0;

        for i in (0..total).rev() {
            let my_hash = 1u64 << (self.fields[i].id % 64);
            if hash & my_hash == 0 {
                self.fields[i].flags |= FieldFlags::LAST_IE;
                hash |= my_hash;
                continue;
            }

            let (en, id) = (self.fields[i].en, self.fields[i].id);
            let mut same_found = false;
            for x in i + 1..total {
                if self.fields[x].id != id || self.fields[x].en != en {
                    continue;
                }
                self.fields[i].flags |= FieldFlags::MULTI_IE;
                self.fields[x].flags |= FieldFlags::MULTI_IE;
                same_found = true;
                break;
            }

            if !same_found {
                self.fields[i].flags |= FieldFlags::LAST_IE;
            }
        }
    }

    /// Checks that every required non-scope IANA element is present.
    fn opts_has_required(&self, required: &[u16]) -> bool {
        let non_scope =
            &self.fields[usize::from(self.fields_cnt_scope)..usize::from(self.fields_cnt_total)];
        required
            .iter()
            .all(|id| non_scope.iter().any(|f| f.en == 0 && f.id == *id))
    }

    /// Checks for exactly two non-scope `observationTime*` elements (322-325).
    fn opts_has_obs_time(&self) -> bool {
        let non_scope =
            &self.fields[usize::from(self.fields_cnt_scope)..usize::from(self.fields_cnt_total)];
        let matches = non_scope
            .iter()
            .filter(|f| f.en == 0 && (322..=325).contains(&f.id))
            .count();
        matches == 2
    }

    fn detect_opts_types(&mut self) {
        self.detect_opts_mproc();
        self.detect_opts_eproc();
        self.detect_opts_flowkey();
        self.detect_opts_ietype();
    }

    /// Metering Process statistics shapes (RFC 7011, Sections 4.1-4.2).
    fn detect_opts_mproc(&mut self) {
        const IE_ODID: u16 = 149; // observationDomainId
        const IE_MPID: u16 = 143; // meteringProcessId

        let odid = self.find(0, IE_ODID);
        let mpid = self.find(0, IE_MPID);
        if odid.is_none() && mpid.is_none() {
            return;
        }

        for field in [odid, mpid].into_iter().flatten() {
            if !field.flags.contains(FieldFlags::SCOPE)
                || field.flags.contains(FieldFlags::MULTI_IE)
            {
                return;
            }
        }

        // exported{Octet,Message,FlowRecord}TotalCount
        if self.opts_has_required(&[40, 41, 42]) {
            self.opts_types |= OptsTypes::MPROC_STAT;
        }

        // ignored{Packet,Octet}TotalCount
        if self.opts_has_required(&[164, 165]) && self.opts_has_obs_time() {
            self.opts_types |= OptsTypes::MPROC_RELIABILITY_STAT;
        }
    }

    /// Exporting Process reliability statistics (RFC 7011, Section 4.3).
    fn detect_opts_eproc(&mut self) {
        // exporterIPv4Address, exporterIPv6Address, exportingProcessId
        let found = [130u16, 131, 144].iter().any(|id| {
            self.find(0, *id).is_some_and(|f| {
                f.flags.contains(FieldFlags::SCOPE) && f.flags.contains(FieldFlags::LAST_IE)
            })
        });
        if !found {
            return;
        }

        // notSent{Flow,Packet,Octet}TotalCount
        if self.opts_has_required(&[166, 167, 168]) && self.opts_has_obs_time() {
            self.opts_types |= OptsTypes::EPROC_RELIABILITY_STAT;
        }
    }

    /// Flow Keys shape (RFC 7011, Section 4.4).
    fn detect_opts_flowkey(&mut self) {
        const IE_TEMPLATE_ID: u16 = 145;

        let Some(field) = self.find(0, IE_TEMPLATE_ID) else {
            return;
        };
        if !field.flags.contains(FieldFlags::SCOPE) || field.flags.contains(FieldFlags::MULTI_IE) {
            return;
        }

        // flowKeyIndicator
        if self.opts_has_required(&[173]) {
            self.opts_types |= OptsTypes::FKEYS;
        }
    }

    /// Information Element type definition shape (RFC 5610, Section 3.9).
    fn detect_opts_ietype(&mut self) {
        const IE_IE_ID: u16 = 303; // informationElementId
        const IE_PEN: u16 = 346; // privateEnterpriseNumber

        for id in [IE_IE_ID, IE_PEN] {
            let Some(field) = self.find(0, id) else {
                return;
            };
            if !field.flags.contains(FieldFlags::SCOPE)
                || field.flags.contains(FieldFlags::MULTI_IE)
            {
                return;
            }
        }

        // informationElementDataType/Semantics/Name
        if self.opts_has_required(&[339, 344, 341]) {
            self.opts_types |= OptsTypes::IE_TYPE;
        }
    }

    /// (Re-)binds Information Element definitions to the template fields.
    ///
    /// With `preserve` set, fields that already carry a definition keep it and
    /// only unknown fields are resolved; otherwise every binding and every
    /// derived flag (REVERSE, STRUCT, BKEY, BIFLOW) is recomputed from
    /// scratch. Passing no manager with `preserve` unset clears all
    /// definitions. For biflow templates the reverse field view is
    /// (re-)materialised.
    pub fn ies_define(&mut self, iemgr: Option<&IeManager>, preserve: bool) {
        if iemgr.is_none() && preserve {
            return;
        }

        if !preserve {
            self.fields_rev = None;
        }

        let mut has_reverse = preserve && self.flags.contains(TemplateFlags::BIFLOW);
        let mut has_struct = preserve && self.flags.contains(TemplateFlags::STRUCT);
        // A lone reverse IE cannot make the template biflow retroactively
        // when preserving previously unknown fields.
        let ignore_rev = preserve && !has_reverse;

        for field in &mut self.fields {
            if preserve && field.def.is_some() {
                continue;
            }

            field.flags -= FieldFlags::STRUCT | FieldFlags::REVERSE | FieldFlags::BKEY;

            let mut def = iemgr.and_then(|mgr| mgr.elem_find_id(field.en, field.id));
            if ignore_rev && def.as_ref().is_some_and(|d| d.is_reverse) {
                def = None;
            }

            field.def = def;
            let Some(def) = &field.def else {
                continue;
            };

            if def.is_reverse {
                field.flags |= FieldFlags::REVERSE;
                has_reverse = true;
            }
            if def.data_type.is_structured() {
                field.flags |= FieldFlags::STRUCT;
                has_struct = true;
            }
        }

        self.flags.set(TemplateFlags::BIFLOW, has_reverse);
        self.flags.set(TemplateFlags::STRUCT, has_struct);

        if let Some(iemgr) = iemgr {
            self.define_biflow_fields(iemgr);
        }
    }

    /// Builds or updates the reverse field view of a biflow template.
    ///
    /// Each field is classified per RFC 5103: reverse-only fields flip back to
    /// their forward definition, forward fields whose reverse twin is also in
    /// the template flip forward, and everything else is a biflow key shared
    /// by both directions (directional keys additionally swap src and dst).
    fn define_biflow_fields(&mut self, iemgr: &IeManager) {
        if !self.flags.contains(TemplateFlags::BIFLOW) {
            return;
        }

        let forward_keys: Vec<(u32, u16)> = self.fields.iter().map(|f| (f.en, f.id)).collect();
        let mut rev = self.fields_rev.take().unwrap_or_else(|| {
            self.fields
                .iter()
                .map(|f| TemplateField { def: None, ..f.clone() })
                .collect()
        });

        for i in 0..self.fields.len() {
            if self.fields[i].def.is_none() {
                self.fields[i].flags |= FieldFlags::BKEY;
                rev[i].flags |= FieldFlags::BKEY;
                continue;
            }
            if rev[i].def.is_some() {
                // Processed by an earlier pass.
                continue;
            }

            self.fields[i].flags -= FieldFlags::BKEY;
            rev[i].flags -= FieldFlags::BKEY;

            let Some(fwd_def) = self.fields[i].def.clone() else {
                continue;
            };
            let reverse_key = fwd_def.reverse_key;

            if fwd_def.is_reverse {
                // Reverse-only field: the opposite view shows the forward IE.
                if let Some((en, id)) = reverse_key {
                    rev[i].flags -= FieldFlags::REVERSE;
                    rev[i].en = en;
                    rev[i].id = id;
                    rev[i].def = iemgr.elem_find_id(en, id);
                    continue;
                }
            } else if let Some((en, id)) = reverse_key {
                if forward_keys.contains(&(en, id)) {
                    // Forward-only field with its reverse twin in-template.
                    rev[i].flags |= FieldFlags::REVERSE;
                    rev[i].en = en;
                    rev[i].id = id;
                    rev[i].def = iemgr.elem_find_id(en, id);
                    continue;
                }
            }

            // Biflow key; directional keys swap source and destination.
            self.fields[i].flags |= FieldFlags::BKEY;
            rev[i].flags |= FieldFlags::BKEY;

            let (en, id) = (self.fields[i].en, self.fields[i].id);
            if let Some(new_id) = biflow_src2dst(iemgr, en, id) {
                rev[i].id = new_id;
                rev[i].def = iemgr.elem_find_id(en, new_id);
            } else {
                rev[i].def = Some(fwd_def);
            }
        }

        self.fields_rev = Some(rev);
    }

    /// Checks that a flow key mask does not address fields beyond the
    /// template's field count.
    pub fn flowkey_applicable(&self, flowkey: u64) -> Result<(), Error> {
        let highest = 64 - flowkey.leading_zeros();
        if highest > u32::from(self.fields_cnt_total) {
            return Err(Error::Format(format!(
                "flow key bit {} exceeds the field count {}",
                highest, self.fields_cnt_total
            )));
        }
        Ok(())
    }

    /// Attaches a flow key: bit `i` of `flowkey` marks field `i`.
    pub fn flowkey_define(&mut self, flowkey: u64) -> Result<(), Error> {
        self.flowkey_applicable(flowkey)?;
        self.flags.set(TemplateFlags::FKEY, flowkey != 0);

        let mut key = flowkey;
        for i in 0..self.fields.len() {
            let set = key & 0x1 != 0;
            self.fields[i].flags.set(FieldFlags::FKEY, set);
            if let Some(rev) = &mut self.fields_rev {
                rev[i].flags.set(FieldFlags::FKEY, set);
            }
            key >>= 1;
        }
        Ok(())
    }

    /// Compares the attached flow key with an expected mask.
    pub fn flowkey_cmp(&self, flowkey: u64) -> bool {
        if (flowkey != 0) != self.flags.contains(TemplateFlags::FKEY) {
            return false;
        }
        if self.flowkey_applicable(flowkey).is_err() {
            return false;
        }

        let mut key = flowkey;
        for field in &self.fields {
            if (key & 0x1 != 0) != field.flags.contains(FieldFlags::FKEY) {
                return false;
            }
            key >>= 1;
        }
        true
    }
}

/// Maps a directional-key IE to its opposite direction within a PEN.
///
/// IANA elements use the published source/destination pair table; everything
/// else falls back to the `source*` / `destination*` naming convention looked
/// up within the element's own scope.
fn biflow_src2dst(iemgr: &IeManager, pen: u32, id: u16) -> Option<u16> {
    // Standard SRC <-> DST conversions.
    // URL: www.iana.org/assignments/ipfix/ipfix.xhtml
    const PAIRS: [(u16, u16); 25] = [
        (7, 11),    // sourceTransportPort            X destinationTransportPort
        (8, 12),    // sourceIPv4Address              X destinationIPv4Address
        (9, 13),    // sourceIPv4PrefixLength         X destinationIPv4PrefixLength
        (10, 14),   // ingressInterface               X egressInterface
        (16, 17),   // bgpSourceAsNumber              X bgpDestinationAsNumber
        (27, 28),   // sourceIPv6Address              X destinationIPv6Address
        (29, 30),   // sourceIPv6PrefixLength         X destinationIPv6PrefixLength
        (44, 45),   // sourceIPv4Prefix               X destinationIPv4Prefix
        (56, 80),   // sourceMacAddress               X destinationMacAddress
        (58, 59),   // vlanId                         X postVlanId
        (81, 57),   // postSourceMacAddress           X postDestinationMacAddress
        (92, 93),   // srcTrafficIndex                X dstTrafficIndex
        (128, 129), // bgpNextAdjacentAsNumber        X bgpPrevAdjacentAsNumber
        (170, 169), // sourceIPv6Prefix               X destinationIPv6Prefix
        (180, 181), // udpSourcePort                  X udpDestinationPort
        (182, 183), // tcpSourcePort                  X tcpDestinationPort
        (225, 226), // postNATSourceIPv4Address       X postNATDestinationIPv4Address
        (227, 228), // postNAPTSourceTransportPort    X postNAPTDestinationTransportPort
        (234, 235), // ingressVRFID                   X egressVRFID
        (281, 282), // postNATSourceIPv6Address       X postNATDestinationIPv6Address
        (368, 369), // ingressInterfaceType           X egressInterfaceType
        (414, 415), // dot1qCustomerSourceMacAddress  X dot1qCustomerDestinationMacAddress
        (484, 485), // bgpSourceCommunityList         X bgpDestinationCommunityList
        (487, 488), // bgpSourceExtendedCommunityList X bgpDestinationExtendedCommunityList
        (490, 491), // bgpSourceLargeCommunityList    X bgpDestinationLargeCommunityList
    ];

    if pen == 0 {
        for (src, dst) in PAIRS {
            if src == id {
                return Some(dst);
            }
            if dst == id {
                return Some(src);
            }
        }
    }

    // Naming convention fallback.
    let elem = iemgr.elem_find_id(pen, id)?;
    let name = elem.name.as_str();

    let flipped = if let Some(rest) = strip_prefix_ignore_case(name, "source") {
        format!("destination{rest}")
    } else if let Some(rest) = strip_prefix_ignore_case(name, "destination") {
        format!("source{rest}")
    } else {
        return None;
    };

    iemgr.elem_find_scoped_name(pen, &flipped).map(|e| e.id)
}

fn strip_prefix_ignore_case<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let head = name.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&name[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends one field specifier to a raw template body.
    fn push_field(buf: &mut Vec<u8>, en: u32, id: u16, len: u16) {
        if en != 0 {
            buf.extend_from_slice(&(id | 0x8000).to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&en.to_be_bytes());
        } else {
            buf.extend_from_slice(&id.to_be_bytes());
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }

    fn build_template(id: u16, fields: &[(u32, u16, u16)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        for (en, fid, len) in fields {
            push_field(&mut buf, *en, *fid, *len);
        }
        buf
    }

    fn build_options_template(id: u16, scope: u16, fields: &[(u32, u16, u16)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&(fields.len() as u16).to_be_bytes());
        buf.extend_from_slice(&scope.to_be_bytes());
        for (en, fid, len) in fields {
            push_field(&mut buf, *en, *fid, *len);
        }
        buf
    }

    #[test]
    fn parse_round_trip() {
        let raw = build_template(256, &[(0, 8, 4), (0, 12, 4), (10000, 100, 8)]);
        let (tmplt, consumed) = Template::parse(TemplateType::Data, &raw).unwrap();

        assert_eq!(consumed, raw.len());
        assert_eq!(tmplt.raw, raw);
        assert_eq!(tmplt.fields_cnt_total, 3);
        assert_eq!(tmplt.fields[2].en, 10000);
        assert_eq!(tmplt.fields[2].id, 100);

        // Reparsing the preserved raw bytes gives an equivalent template.
        let (again, _) = Template::parse(TemplateType::Data, &tmplt.raw).unwrap();
        assert_eq!(again, tmplt);
    }

    #[test]
    fn offsets_and_data_length() {
        let raw = build_template(256, &[(0, 8, 4), (0, 2, VAR_IE_LEN), (0, 1, 8)]);
        let (tmplt, _) = Template::parse(TemplateType::Data, &raw).unwrap();

        assert_eq!(tmplt.fields[0].offset, 0);
        assert_eq!(tmplt.fields[1].offset, 4);
        assert_eq!(tmplt.fields[2].offset, VAR_OFFSET);
        // 4 fixed + 1 minimum for the variable field + 8 fixed
        assert_eq!(tmplt.data_length, 13);
        assert!(tmplt.flags.contains(TemplateFlags::DYNAMIC));
    }

    #[test]
    fn multi_ie_and_last_ie() {
        let raw = build_template(300, &[(0, 1, 8), (0, 2, 4), (0, 1, 8)]);
        let (tmplt, _) = Template::parse(TemplateType::Data, &raw).unwrap();

        assert!(tmplt.fields[0].flags.contains(FieldFlags::MULTI_IE));
        assert!(!tmplt.fields[0].flags.contains(FieldFlags::LAST_IE));
        assert!(tmplt.fields[2].flags.contains(FieldFlags::MULTI_IE));
        assert!(tmplt.fields[2].flags.contains(FieldFlags::LAST_IE));
        assert!(tmplt.fields[1].flags.contains(FieldFlags::LAST_IE));
        assert!(tmplt.flags.contains(TemplateFlags::MULTI_IE));

        // Same id, different enterprise: not a multi-IE.
        let raw = build_template(300, &[(0, 5, 4), (700, 5, 4)]);
        let (tmplt, _) = Template::parse(TemplateType::Data, &raw).unwrap();
        assert!(!tmplt.fields[0].flags.contains(FieldFlags::MULTI_IE));
        assert!(tmplt.fields[0].flags.contains(FieldFlags::LAST_IE));
        assert!(tmplt.fields[1].flags.contains(FieldFlags::LAST_IE));
    }

    #[test]
    fn record_length_boundary() {
        let ok = build_template(256, &[(0, 1, 65515)]);
        assert!(Template::parse(TemplateType::Data, &ok).is_ok());

        let too_long = build_template(256, &[(0, 1, 65515), (0, 2, 1)]);
        let err = Template::parse(TemplateType::Data, &too_long).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);
    }

    #[test]
    fn options_scope_count_bounds() {
        let zero_scope = {
            let mut buf = Vec::new();
            buf.extend_from_slice(&400u16.to_be_bytes());
            buf.extend_from_slice(&1u16.to_be_bytes());
            buf.extend_from_slice(&0u16.to_be_bytes());
            push_field(&mut buf, 0, 8, 4);
            buf
        };
        assert!(Template::parse(TemplateType::Options, &zero_scope).is_err());

        let excess_scope = build_options_template(400, 3, &[(0, 8, 4), (0, 12, 4)]);
        assert!(Template::parse(TemplateType::Options, &excess_scope).is_err());
    }

    #[test]
    fn withdrawal_records() {
        let all = build_template(2, &[]);
        let (tmplt, _) = Template::parse(TemplateType::Data, &all).unwrap();
        assert!(tmplt.is_withdrawal());

        // All-withdrawal id must match the template type.
        assert!(Template::parse(TemplateType::Options, &all).is_err());

        let single = build_template(257, &[]);
        let (tmplt, _) = Template::parse(TemplateType::Data, &single).unwrap();
        assert!(tmplt.is_withdrawal());

        // Reserved ids other than 2/3 are never valid.
        let bad = build_template(100, &[]);
        assert!(Template::parse(TemplateType::Data, &bad).is_err());
    }

    #[test]
    fn truncated_template_fails() {
        let raw = build_template(256, &[(0, 8, 4), (0, 12, 4)]);
        for cut in 1..raw.len() {
            assert!(Template::parse(TemplateType::Data, &raw[..cut]).is_err());
        }
    }

    #[test]
    fn ie_type_shape_detection() {
        // RFC 5610 shape: PEN + IE id as scope, type/semantics/name as data.
        let raw = build_options_template(
            333,
            2,
            &[(0, 346, 4), (0, 303, 2), (0, 339, 1), (0, 344, 1), (0, 341, VAR_IE_LEN)],
        );
        let (tmplt, _) = Template::parse(TemplateType::Options, &raw).unwrap();

        assert!(tmplt.opts_types.contains(OptsTypes::IE_TYPE));
        assert!(tmplt.flags.contains(TemplateFlags::DYNAMIC));
        assert!(tmplt.fields[0].flags.contains(FieldFlags::SCOPE));
        assert!(tmplt.fields[1].flags.contains(FieldFlags::SCOPE));
        assert!(!tmplt.fields[2].flags.contains(FieldFlags::SCOPE));
        assert_eq!(tmplt.fields[4].offset, VAR_OFFSET);
    }

    #[test]
    fn mproc_shape_detection() {
        // observationDomainId as scope + exported*TotalCount.
        let raw = build_options_template(
            334,
            1,
            &[(0, 149, 4), (0, 40, 8), (0, 41, 8), (0, 42, 8)],
        );
        let (tmplt, _) = Template::parse(TemplateType::Options, &raw).unwrap();
        assert!(tmplt.opts_types.contains(OptsTypes::MPROC_STAT));
        assert!(!tmplt.opts_types.contains(OptsTypes::MPROC_RELIABILITY_STAT));

        // Reliability variant needs ignored* counters + exactly two
        // observationTime* elements.
        let raw = build_options_template(
            335,
            1,
            &[(0, 149, 4), (0, 164, 8), (0, 165, 8), (0, 322, 4), (0, 323, 8)],
        );
        let (tmplt, _) = Template::parse(TemplateType::Options, &raw).unwrap();
        assert!(tmplt.opts_types.contains(OptsTypes::MPROC_RELIABILITY_STAT));
    }

    #[test]
    fn fkeys_shape_detection() {
        let raw = build_options_template(336, 1, &[(0, 145, 2), (0, 173, 8)]);
        let (tmplt, _) = Template::parse(TemplateType::Options, &raw).unwrap();
        assert!(tmplt.opts_types.contains(OptsTypes::FKEYS));

        // templateId outside the scope does not match the shape.
        let raw = build_options_template(336, 1, &[(0, 149, 4), (0, 145, 2), (0, 173, 8)]);
        let (tmplt, _) = Template::parse(TemplateType::Options, &raw).unwrap();
        assert!(!tmplt.opts_types.contains(OptsTypes::FKEYS));
    }

    #[test]
    fn flowkey_define_and_cmp() {
        let raw = build_template(256, &[(0, 8, 4), (0, 12, 4), (0, 7, 2)]);
        let (mut tmplt, _) = Template::parse(TemplateType::Data, &raw).unwrap();

        tmplt.flowkey_define(0b101).unwrap();
        assert!(tmplt.flags.contains(TemplateFlags::FKEY));
        assert!(tmplt.fields[0].flags.contains(FieldFlags::FKEY));
        assert!(!tmplt.fields[1].flags.contains(FieldFlags::FKEY));
        assert!(tmplt.fields[2].flags.contains(FieldFlags::FKEY));
        assert!(tmplt.flowkey_cmp(0b101));
        assert!(!tmplt.flowkey_cmp(0b111));

        // A mask addressing a fourth field is not applicable.
        let err = tmplt.flowkey_define(0b1000).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);

        tmplt.flowkey_define(0).unwrap();
        assert!(!tmplt.flags.contains(TemplateFlags::FKEY));
        assert!(tmplt.flowkey_cmp(0));
    }
}
