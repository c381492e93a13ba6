//! Information Element manager.
//!
//! The manager is a registry of IE definitions keyed by `(enterprise, id)`
//! and by `"scope:name"`, loaded from XML definition files. It owns every
//! element; cross-references between forward and reverse elements are stored
//! as `(enterprise, id)` keys and resolved through the manager, never as
//! owning pointers, so deep copies stay trivially correct.
//!
//! Biflow support follows RFC 5103: depending on the scope's biflow mode,
//! reverse elements live in a synthesised reverse scope (`pen` mode), share
//! the forward scope with a flipped ID bit (`split` mode) or carry explicit
//! per-element reverse IDs (`individual` mode).

pub mod xml;

use crate::Error;
use crate::bytes::TimePrecision;

use log::{debug, trace};
use serde::Serialize;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Name suffix of a synthesised reverse scope (`pen` biflow mode).
const REVERSE_SCOPE_SUFFIX: &str = "@reverse";

/// Scope name assumed for bare element names.
const DEFAULT_SCOPE: &str = "iana";

/// Prefix qualifiers accepted in front of an alias name.
const ALIAS_PREFIXES: [&str; 6] = ["in", "out", "ingress", "egress", "src", "dst"];

/// Abstract data type of an Information Element (RFC 7012 + RFC 6313).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IeDataType {
    OctetArray,
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float32,
    Float64,
    Boolean,
    MacAddress,
    String,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
    Ipv4Address,
    Ipv6Address,
    BasicList,
    SubTemplateList,
    SubTemplateMultiList,
}

impl IeDataType {
    /// Parses the `<dataType>` spelling used by definition files.
    pub fn from_type_name(name: &str) -> Option<Self> {
        let ttype = match name {
            "octetArray" => Self::OctetArray,
            "unsigned8" => Self::Unsigned8,
            "unsigned16" => Self::Unsigned16,
            "unsigned32" => Self::Unsigned32,
            "unsigned64" => Self::Unsigned64,
            "signed8" => Self::Signed8,
            "signed16" => Self::Signed16,
            "signed32" => Self::Signed32,
            "signed64" => Self::Signed64,
            "float32" => Self::Float32,
            "float64" => Self::Float64,
            "boolean" => Self::Boolean,
            "macAddress" => Self::MacAddress,
            "string" => Self::String,
            "dateTimeSeconds" => Self::DateTimeSeconds,
            "dateTimeMilliseconds" => Self::DateTimeMilliseconds,
            "dateTimeMicroseconds" => Self::DateTimeMicroseconds,
            "dateTimeNanoseconds" => Self::DateTimeNanoseconds,
            "ipv4Address" => Self::Ipv4Address,
            "ipv6Address" => Self::Ipv6Address,
            "basicList" => Self::BasicList,
            "subTemplateList" => Self::SubTemplateList,
            "subTemplateMultiList" => Self::SubTemplateMultiList,
            _ => return None,
        };
        Some(ttype)
    }

    /// True for the RFC 6313 structured list types.
    pub fn is_structured(self) -> bool {
        matches!(
            self,
            Self::BasicList | Self::SubTemplateList | Self::SubTemplateMultiList
        )
    }

    /// Timestamp precision for the dateTime* types.
    pub fn time_precision(self) -> Option<TimePrecision> {
        match self {
            Self::DateTimeSeconds => Some(TimePrecision::Seconds),
            Self::DateTimeMilliseconds => Some(TimePrecision::Milliseconds),
            Self::DateTimeMicroseconds => Some(TimePrecision::Microseconds),
            Self::DateTimeNanoseconds => Some(TimePrecision::Nanoseconds),
            _ => None,
        }
    }
}

/// Data semantics of an Information Element (RFC 7012, Section 3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IeSemantics {
    #[default]
    Default,
    Quantity,
    TotalCounter,
    DeltaCounter,
    Identifier,
    Flags,
    List,
    SnapshotInterval,
}

impl IeSemantics {
    fn from_name(name: &str) -> Option<Self> {
        let sem = match name {
            "default" => Self::Default,
            "quantity" => Self::Quantity,
            "totalCounter" => Self::TotalCounter,
            "deltaCounter" => Self::DeltaCounter,
            "identifier" => Self::Identifier,
            "flags" => Self::Flags,
            "list" => Self::List,
            "snapshotInterval" => Self::SnapshotInterval,
            _ => return None,
        };
        Some(sem)
    }
}

/// Registration status of an Information Element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum IeStatus {
    #[default]
    Current,
    Deprecated,
}

/// Biflow mode of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum BiflowMode {
    #[default]
    None,
    Pen,
    Individual,
    Split,
}

/// A single Information Element definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Element {
    /// IE identifier (0..=32767).
    pub id: u16,
    /// Private Enterprise Number of the owning scope (0 = IANA).
    pub en: u32,
    pub name: String,
    /// Owning scope name, used for `"scope:name"` rendering.
    pub scope_name: String,
    pub data_type: IeDataType,
    pub data_semantics: IeSemantics,
    pub units: String,
    pub status: IeStatus,
    /// True when the element describes the reverse direction of a biflow.
    pub is_reverse: bool,
    /// Key of the element describing the opposite direction, if any.
    pub reverse_key: Option<(u32, u16)>,
}

impl Element {
    /// Creates a forward element with default semantics, ready for
    /// [`IeManager::elem_add`]. Scope-derived fields are filled at insertion.
    pub fn new(id: u16, name: &str, data_type: IeDataType) -> Self {
        Self {
            id,
            en: 0,
            name: name.to_string(),
            scope_name: String::new(),
            data_type,
            data_semantics: IeSemantics::Default,
            units: String::new(),
            status: IeStatus::Current,
            is_reverse: false,
            reverse_key: None,
        }
    }

    /// Full lookup name, `"scope:name"`.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.scope_name, self.name)
    }
}

/// A named namespace of Information Elements sharing an enterprise number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub pen: u32,
    pub name: String,
    pub biflow_mode: BiflowMode,
    /// Mode-specific: reverse-scope PEN (`pen`), flipped bit position
    /// (`split`), unused otherwise.
    pub biflow_id: u32,
    pub is_reverse: bool,
    /// Whether definitions from user files may override this scope.
    pub can_overwrite: bool,
}

/// Alias source resolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AliasMode {
    /// The first listed source present in a record wins.
    FirstOf,
    /// Any listed source is an acceptable match.
    AnyOf,
}

/// A logical name for one or more source Information Elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alias {
    pub name: String,
    pub aliased_names: Vec<String>,
    pub mode: AliasMode,
    /// Source elements as `(enterprise, id)` keys.
    pub sources: Vec<(u32, u16)>,
}

/// A named key-to-value table used to render enumerated values symbolically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mapping {
    pub name: String,
    pub case_sensitive: bool,
    items: BTreeMap<String, i64>,
}

impl Mapping {
    /// Looks up a key, honouring the table's case sensitivity.
    pub fn lookup(&self, key: &str) -> Option<i64> {
        if self.case_sensitive {
            self.items.get(key).copied()
        } else {
            self.items.get(&key.to_ascii_lowercase()).copied()
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Registry of Information Element definitions.
#[derive(Debug, Default, Clone)]
pub struct IeManager {
    scopes: BTreeMap<u32, Scope>,
    scope_names: BTreeMap<String, u32>,
    elements: BTreeMap<(u32, u16), Arc<Element>>,
    /// Name index over non-reverse elements, `(pen, element name)` -> id.
    names: BTreeMap<(u32, String), u16>,
    /// Aliases keyed by each of their aliased names.
    aliases: BTreeMap<String, Arc<Alias>>,
    mappings: BTreeMap<String, Arc<Mapping>>,
    /// Mappings attached to concrete elements (directly or via alias).
    mapping_index: BTreeMap<(u32, u16), Arc<Mapping>>,
    /// Modification time of every file read, for change detection.
    mtimes: Vec<(PathBuf, SystemTime)>,
}

impl IeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produces an independent deep copy of the registry.
    ///
    /// Definitions are immutable once stored and cross-references are plain
    /// keys, so the clone shares no mutable state with the original.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Finds an element by `(enterprise, id)`.
    pub fn elem_find_id(&self, en: u32, id: u16) -> Option<Arc<Element>> {
        self.elements.get(&(en, id)).cloned()
    }

    /// Finds an element by `"scope:name"`; a bare name implies the `iana`
    /// scope.
    ///
    /// Fails with [`Error::InvalidName`] when the name contains more than one
    /// colon and [`Error::NotFound`] when the scope or element is unknown.
    pub fn elem_find_name(&self, name: &str) -> Result<Arc<Element>, Error> {
        let (scope_name, elem_name) = split_qualified_name(name)?;
        let pen = *self
            .scope_names
            .get(scope_name)
            .ok_or_else(|| Error::NotFound(format!("unknown scope '{scope_name}'")))?;

        let id = self
            .names
            .get(&(pen, elem_name.to_string()))
            .copied()
            .ok_or_else(|| Error::NotFound(format!("unknown element '{name}'")))?;

        self.elements
            .get(&(pen, id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown element '{name}'")))
    }

    /// Finds a non-reverse element by name inside a concrete scope.
    pub fn elem_find_scoped_name(&self, en: u32, name: &str) -> Option<Arc<Element>> {
        let id = self.names.get(&(en, name.to_string()))?;
        self.elements.get(&(en, *id)).cloned()
    }

    /// Finds a scope by PEN.
    pub fn scope_find_pen(&self, pen: u32) -> Option<&Scope> {
        self.scopes.get(&pen)
    }

    /// Finds a scope by name.
    pub fn scope_find_name(&self, name: &str) -> Option<&Scope> {
        self.scope_names.get(name).and_then(|pen| self.scopes.get(pen))
    }

    /// Finds an alias by one of its aliased names.
    pub fn alias_find(&self, name: &str) -> Option<Arc<Alias>> {
        self.aliases.get(name).cloned()
    }

    /// Finds a mapping table by group name.
    pub fn mapping_find(&self, name: &str) -> Option<Arc<Mapping>> {
        self.mappings.get(name).cloned()
    }

    /// Finds the mapping attached to an element, if any.
    pub fn mapping_for(&self, en: u32, id: u16) -> Option<Arc<Mapping>> {
        self.mapping_index.get(&(en, id)).cloned()
    }

    /// Number of registered elements (reverse elements included).
    pub fn elem_count(&self) -> usize {
        self.elements.len()
    }

    /// Adds a forward element to the scope identified by `en`.
    ///
    /// An unknown scope is created on the fly with a generated `penXX` name
    /// and no biflow support. Re-adding an existing `(en, id)` is `Denied`
    /// unless `overwrite` is set.
    pub fn elem_add(&mut self, en: u32, mut elem: Element, overwrite: bool) -> Result<(), Error> {
        if elem.id > 0x7FFF {
            return Err(Error::Format(format!(
                "element ID {} exceeds the 15-bit IPFIX range",
                elem.id
            )));
        }

        let scope = self.scopes.entry(en).or_insert_with(|| {
            let name = format!("pen{en}");
            Scope {
                pen: en,
                name,
                biflow_mode: BiflowMode::None,
                biflow_id: 0,
                is_reverse: false,
                can_overwrite: true,
            }
        });
        let scope = scope.clone();
        self.scope_names.entry(scope.name.clone()).or_insert(en);

        if self.elements.contains_key(&(en, elem.id)) && !overwrite {
            return Err(Error::Denied(format!(
                "element ({en}, {}) is already defined",
                elem.id
            )));
        }

        elem.en = en;
        elem.scope_name = scope.name.clone();
        elem.is_reverse = false;
        elem.reverse_key = None;
        self.insert_element(elem)?;

        // Scope-wide biflow modes materialise the reverse twin immediately.
        match scope.biflow_mode {
            BiflowMode::Pen => self.materialize_pen_reverse(&scope)?,
            BiflowMode::Split => self.materialize_split_reverse(&scope)?,
            _ => {}
        }
        Ok(())
    }

    /// Defines a reverse element for `(en, id)` under `new_id` in the same
    /// scope. Only scopes with `individual` biflow mode accept this.
    pub fn elem_add_reverse(
        &mut self,
        en: u32,
        id: u16,
        new_id: u16,
        overwrite: bool,
    ) -> Result<(), Error> {
        let scope = self
            .scopes
            .get(&en)
            .ok_or_else(|| Error::NotFound(format!("unknown scope with PEN {en}")))?;
        if scope.biflow_mode != BiflowMode::Individual {
            return Err(Error::Denied(format!(
                "scope with PEN {en} does not use individual biflow mode"
            )));
        }

        let forward = self
            .elements
            .get(&(en, id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("unknown element ({en}, {id})")))?;
        if forward.is_reverse {
            return Err(Error::InvalidArg(format!(
                "element ({en}, {id}) is itself a reverse element"
            )));
        }

        if self.elements.contains_key(&(en, new_id)) && !overwrite {
            return Err(Error::Denied(format!(
                "element ({en}, {new_id}) is already defined"
            )));
        }

        self.link_reverse(&forward, en, new_id)
    }

    /// Removes an element and its reverse twin.
    pub fn elem_remove(&mut self, en: u32, id: u16) -> Result<(), Error> {
        let elem = self
            .elements
            .remove(&(en, id))
            .ok_or_else(|| Error::NotFound(format!("unknown element ({en}, {id})")))?;
        self.names.remove(&(en, elem.name.clone()));

        if let Some((rev_en, rev_id)) = elem.reverse_key {
            if let Some(rev) = self.elements.remove(&(rev_en, rev_id)) {
                self.names.remove(&(rev_en, rev.name.clone()));
            }
        }
        Ok(())
    }

    /// Loads a definition directory.
    ///
    /// Reads `<path>/system/elements/*.xml` (defining), then
    /// `<path>/user/elements/*.xml` (overriding, where the scope permits it),
    /// then `system/aliases.xml` and `system/mappings.xml` when present.
    /// Modification times of all files are recorded for
    /// [`compare_timestamps`](Self::compare_timestamps).
    pub fn load_dir(&mut self, path: &Path) -> Result<(), Error> {
        let system = path.join("system").join("elements");
        for file in xml_files_sorted(&system)? {
            self.load_elements_file(&file, false)?;
        }

        let user = path.join("user").join("elements");
        if user.is_dir() {
            for file in xml_files_sorted(&user)? {
                self.load_elements_file(&file, true)?;
            }
        }

        let aliases = path.join("system").join("aliases.xml");
        if aliases.is_file() {
            self.load_aliases_file(&aliases)?;
        }

        let mappings = path.join("system").join("mappings.xml");
        if mappings.is_file() {
            self.load_mappings_file(&mappings)?;
        }

        debug!(
            "loaded IE definitions from {}: {} scopes, {} elements, {} aliases, {} mappings",
            path.display(),
            self.scopes.len(),
            self.elements.len(),
            self.aliases.len(),
            self.mappings.len()
        );
        Ok(())
    }

    /// Loads a single element definition file.
    pub fn load_elements_file(&mut self, path: &Path, user_override: bool) -> Result<(), Error> {
        let content = read_tracked(path, &mut self.mtimes)?;
        let ctx = path.display().to_string();
        let scopes = xml::parse_elements_file(&content, &ctx)?;
        for decl in scopes {
            self.apply_scope_decl(decl, user_override, &ctx)?;
        }
        trace!("parsed element definitions from {ctx}");
        Ok(())
    }

    /// Loads definitions from an in-memory elements document.
    pub fn load_elements_str(&mut self, content: &str, user_override: bool) -> Result<(), Error> {
        let scopes = xml::parse_elements_file(content, "<memory>")?;
        for decl in scopes {
            self.apply_scope_decl(decl, user_override, "<memory>")?;
        }
        Ok(())
    }

    /// Loads an alias definition file.
    pub fn load_aliases_file(&mut self, path: &Path) -> Result<(), Error> {
        let content = read_tracked(path, &mut self.mtimes)?;
        let ctx = path.display().to_string();
        self.load_aliases_str(&content, &ctx)
    }

    /// Loads aliases from an in-memory document.
    pub fn load_aliases_str(&mut self, content: &str, ctx: &str) -> Result<(), Error> {
        for decl in xml::parse_aliases_file(content, ctx)? {
            self.apply_alias_decl(decl, ctx)?;
        }
        Ok(())
    }

    /// Loads a mapping definition file.
    pub fn load_mappings_file(&mut self, path: &Path) -> Result<(), Error> {
        let content = read_tracked(path, &mut self.mtimes)?;
        let ctx = path.display().to_string();
        self.load_mappings_str(&content, &ctx)
    }

    /// Loads mappings from an in-memory document.
    pub fn load_mappings_str(&mut self, content: &str, ctx: &str) -> Result<(), Error> {
        for decl in xml::parse_mappings_file(content, ctx)? {
            self.apply_mapping_decl(decl, ctx)?;
        }
        Ok(())
    }

    /// Checks whether any previously read file changed on disk.
    ///
    /// Returns [`Error::Differs`] when a modification time changed or a file
    /// disappeared; files are never re-read automatically.
    pub fn compare_timestamps(&self) -> Result<(), Error> {
        for (path, recorded) in &self.mtimes {
            let current = fs::metadata(path)
                .and_then(|m| m.modified())
                .map_err(|_| Error::Differs(format!("file {} is gone", path.display())))?;
            if current != *recorded {
                return Err(Error::Differs(format!(
                    "file {} changed since it was read",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn apply_scope_decl(
        &mut self,
        decl: xml::ScopeDecl,
        user_override: bool,
        ctx: &str,
    ) -> Result<(), Error> {
        let Some(pen) = decl.pen else {
            return Err(Error::Format(format!("{ctx}: <scope> without mandatory <pen>")));
        };
        let biflow_mode = match decl.biflow_mode.as_deref() {
            None | Some("none") => BiflowMode::None,
            Some("pen") => BiflowMode::Pen,
            Some("individual") => BiflowMode::Individual,
            Some("split") => BiflowMode::Split,
            Some(other) => {
                return Err(Error::Format(format!("{ctx}: invalid biflow mode '{other}'")));
            }
        };

        if biflow_mode == BiflowMode::Pen || biflow_mode == BiflowMode::Split {
            if decl.biflow_id.is_none() {
                return Err(Error::Format(format!(
                    "{ctx}: biflow mode of scope {pen} requires an identifier"
                )));
            }
            if biflow_mode == BiflowMode::Split && decl.biflow_id.unwrap() > 14 {
                return Err(Error::Format(format!(
                    "{ctx}: split bit {} of scope {pen} exceeds the 15-bit ID space",
                    decl.biflow_id.unwrap()
                )));
            }
        }

        let scope = Scope {
            pen,
            name: decl.name.unwrap_or_else(|| format!("pen{pen}")),
            biflow_mode,
            biflow_id: decl.biflow_id.unwrap_or(0),
            is_reverse: false,
            can_overwrite: decl.overwrite,
        };

        match self.scopes.get(&pen) {
            Some(existing) if user_override && !existing.can_overwrite => {
                return Err(Error::Denied(format!(
                    "{ctx}: scope '{}' (PEN {pen}) does not permit user overrides",
                    existing.name
                )));
            }
            Some(existing) if existing.name != scope.name => {
                return Err(Error::Format(format!(
                    "{ctx}: scope with PEN {pen} redefined with a different name"
                )));
            }
            _ => {}
        }
        self.scope_names.insert(scope.name.clone(), pen);
        self.scopes.insert(pen, scope.clone());

        for elem_decl in decl.elements {
            self.apply_element_decl(&scope, elem_decl, user_override, ctx)?;
        }

        match scope.biflow_mode {
            BiflowMode::Pen => self.materialize_pen_reverse(&scope)?,
            BiflowMode::Split => self.materialize_split_reverse(&scope)?,
            _ => {}
        }
        Ok(())
    }

    fn apply_element_decl(
        &mut self,
        scope: &Scope,
        decl: xml::ElementDecl,
        user_override: bool,
        ctx: &str,
    ) -> Result<(), Error> {
        let Some(id) = decl.id else {
            return Err(Error::Format(format!("{ctx}: <element> without mandatory <id>")));
        };
        if id > 0x7FFF {
            return Err(Error::Format(format!(
                "{ctx}: element ID {id} exceeds the 15-bit IPFIX range"
            )));
        }

        if let Some(existing) = self.elements.get(&(scope.pen, id)) {
            if !user_override {
                return Err(Error::Format(format!(
                    "{ctx}: element ({}, {id}) is already defined",
                    scope.pen
                )));
            }
            if !scope.can_overwrite {
                return Err(Error::Denied(format!(
                    "{ctx}: scope '{}' does not permit overriding element {id}",
                    scope.name
                )));
            }
            let name = existing.name.clone();
            self.names.remove(&(scope.pen, name));
        }

        let data_type = match decl.data_type.as_deref() {
            None => IeDataType::OctetArray,
            Some(name) => IeDataType::from_type_name(name)
                .ok_or_else(|| Error::Format(format!("{ctx}: unknown data type '{name}'")))?,
        };
        let data_semantics = match decl.data_semantics.as_deref() {
            None => IeSemantics::Default,
            Some(name) => IeSemantics::from_name(name)
                .ok_or_else(|| Error::Format(format!("{ctx}: unknown data semantics '{name}'")))?,
        };
        let status = match decl.status.as_deref() {
            None | Some("current") => IeStatus::Current,
            Some("deprecated") => IeStatus::Deprecated,
            Some(other) => {
                return Err(Error::Format(format!("{ctx}: unknown status '{other}'")));
            }
        };

        if decl.biflow_id.is_some() && scope.biflow_mode != BiflowMode::Individual {
            return Err(Error::Format(format!(
                "{ctx}: element {id} declares <biflowId> but scope '{}' is not in individual mode",
                scope.name
            )));
        }

        let elem = Element {
            id,
            en: scope.pen,
            name: decl.name.unwrap_or_else(|| format!("id{id}")),
            scope_name: scope.name.clone(),
            data_type,
            data_semantics,
            units: decl.units.unwrap_or_default(),
            status,
            is_reverse: false,
            reverse_key: None,
        };
        self.insert_element(elem.clone())?;

        if let Some(rev_id) = decl.biflow_id {
            self.link_reverse(&elem, scope.pen, rev_id)?;
        }
        Ok(())
    }

    fn insert_element(&mut self, elem: Element) -> Result<(), Error> {
        let key = (elem.en, elem.id);
        if !elem.is_reverse {
            self.names.insert((elem.en, elem.name.clone()), elem.id);
        }
        self.elements.insert(key, Arc::new(elem));
        Ok(())
    }

    /// Creates the reverse twin of `forward` under `(rev_en, rev_id)` and
    /// cross-links both directions.
    fn link_reverse(&mut self, forward: &Element, rev_en: u32, rev_id: u16) -> Result<(), Error> {
        let rev_scope_name = self
            .scopes
            .get(&rev_en)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| format!("pen{rev_en}"));

        let reverse = Element {
            id: rev_id,
            en: rev_en,
            name: forward.name.clone(),
            scope_name: rev_scope_name,
            data_type: forward.data_type,
            data_semantics: forward.data_semantics,
            units: forward.units.clone(),
            status: forward.status,
            is_reverse: true,
            reverse_key: Some((forward.en, forward.id)),
        };

        let mut fwd = forward.clone();
        fwd.reverse_key = Some((rev_en, rev_id));
        self.elements.insert((fwd.en, fwd.id), Arc::new(fwd));
        self.elements.insert((rev_en, rev_id), Arc::new(reverse));
        Ok(())
    }

    /// Synthesises the whole reverse scope for a `pen`-mode scope.
    fn materialize_pen_reverse(&mut self, scope: &Scope) -> Result<(), Error> {
        let rev_pen = scope.biflow_id;
        if let Some(existing) = self.scopes.get(&rev_pen) {
            if !existing.is_reverse {
                return Err(Error::Format(format!(
                    "reverse PEN {rev_pen} of scope '{}' collides with an existing scope",
                    scope.name
                )));
            }
        }

        let rev_scope = Scope {
            pen: rev_pen,
            name: format!("{}{}", scope.name, REVERSE_SCOPE_SUFFIX),
            biflow_mode: BiflowMode::Pen,
            biflow_id: scope.pen,
            is_reverse: true,
            can_overwrite: scope.can_overwrite,
        };
        self.scope_names.insert(rev_scope.name.clone(), rev_pen);
        self.scopes.insert(rev_pen, rev_scope);

        let forwards: Vec<Arc<Element>> = self
            .elements
            .range((scope.pen, 0)..=(scope.pen, u16::MAX))
            .map(|(_, e)| e.clone())
            .collect();
        for fwd in forwards {
            if fwd.reverse_key.is_none() {
                self.link_reverse(&fwd, rev_pen, fwd.id)?;
            }
        }
        Ok(())
    }

    /// Adds in-scope reverse elements for a `split`-mode scope.
    fn materialize_split_reverse(&mut self, scope: &Scope) -> Result<(), Error> {
        let bit = 1u16 << scope.biflow_id;

        let forwards: Vec<Arc<Element>> = self
            .elements
            .range((scope.pen, 0)..=(scope.pen, u16::MAX))
            .filter(|(_, e)| !e.is_reverse)
            .map(|(_, e)| e.clone())
            .collect();

        for fwd in forwards {
            if fwd.id & bit != 0 {
                return Err(Error::Format(format!(
                    "element {} in scope '{}' has the split bit {} already set",
                    fwd.id, scope.name, scope.biflow_id
                )));
            }
            if fwd.reverse_key.is_none() {
                self.link_reverse(&fwd, scope.pen, fwd.id | bit)?;
            }
        }
        Ok(())
    }

    fn apply_alias_decl(&mut self, decl: xml::AliasDecl, ctx: &str) -> Result<(), Error> {
        let Some(name) = decl.name else {
            return Err(Error::Format(format!("{ctx}: alias <element> without <name>")));
        };
        let mode = match decl.mode.as_deref() {
            None | Some("firstOf") => AliasMode::FirstOf,
            Some("anyOf") => AliasMode::AnyOf,
            Some(other) => {
                return Err(Error::Format(format!("{ctx}: invalid alias mode '{other}'")));
            }
        };

        let mut sources = Vec::with_capacity(decl.sources.len());
        for source in &decl.sources {
            let elem = self.elem_find_name(source)?;
            sources.push((elem.en, elem.id));
        }

        let mut keys = decl.aliased_names;
        if keys.is_empty() {
            keys.push(name.clone());
        }

        let alias = Arc::new(Alias {
            name,
            aliased_names: keys.clone(),
            mode,
            sources,
        });

        for key in keys {
            if !alias_name_valid(&key) {
                return Err(Error::InvalidName(format!(
                    "{ctx}: '{key}' is not a valid alias name"
                )));
            }
            if self.aliases.contains_key(&key) {
                return Err(Error::Format(format!(
                    "{ctx}: alias name '{key}' is already taken"
                )));
            }
            self.aliases.insert(key, alias.clone());
        }
        Ok(())
    }

    fn apply_mapping_decl(&mut self, decl: xml::MappingDecl, ctx: &str) -> Result<(), Error> {
        let Some(name) = decl.name else {
            return Err(Error::Format(format!("{ctx}: mapping <group> without <name>")));
        };
        if self.mappings.contains_key(&name) {
            return Err(Error::Format(format!(
                "{ctx}: mapping group '{name}' is already defined"
            )));
        }

        let mut items = BTreeMap::new();
        for (key, value) in decl.items {
            let key = if decl.case_sensitive {
                key
            } else {
                key.to_ascii_lowercase()
            };
            items.insert(key, value);
        }

        let mapping = Arc::new(Mapping {
            name: name.clone(),
            case_sensitive: decl.case_sensitive,
            items,
        });

        // A match entry may be an alias (attach to all sources) or a direct
        // element name.
        for target in &decl.matches {
            if let Some(alias) = self.alias_find(target) {
                for key in &alias.sources {
                    self.mapping_index.insert(*key, mapping.clone());
                }
            } else {
                let elem = self.elem_find_name(target)?;
                self.mapping_index.insert((elem.en, elem.id), mapping.clone());
            }
        }
        self.mappings.insert(name, mapping);
        Ok(())
    }
}

/// Splits `"scope:name"`, defaulting the scope to `iana` for bare names.
fn split_qualified_name(name: &str) -> Result<(&str, &str), Error> {
    let mut parts = name.split(':');
    let first = parts.next().unwrap_or("");
    match (parts.next(), parts.next()) {
        (None, _) => Ok((DEFAULT_SCOPE, first)),
        (Some(second), None) => Ok((first, second)),
        (Some(_), Some(_)) => Err(Error::InvalidName(format!(
            "'{name}' contains more than one ':'"
        ))),
    }
}

/// Validates an alias name: an identifier, optionally preceded by
/// space-separated direction qualifiers.
fn alias_name_valid(name: &str) -> bool {
    let mut tokens: Vec<&str> = name.split(' ').collect();
    let Some(base) = tokens.pop() else {
        return false;
    };

    let mut chars = base.chars();
    let valid_base = match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {
            chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        }
        _ => false,
    };

    valid_base && tokens.iter().all(|t| ALIAS_PREFIXES.contains(t))
}

fn xml_files_sorted(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::NotFound(format!("cannot read directory {}: {e}", dir.display()))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "xml"))
        .collect();
    files.sort();
    Ok(files)
}

fn read_tracked(path: &Path, mtimes: &mut Vec<(PathBuf, SystemTime)>) -> Result<String, Error> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::NotFound(format!("cannot read {}: {e}", path.display())))?;
    let mtime = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Error::NotFound(format!("cannot stat {}: {e}", path.display())))?;
    mtimes.push((path.to_path_buf(), mtime));
    Ok(content)
}
