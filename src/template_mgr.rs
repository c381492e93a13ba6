//! Per-session template store.
//!
//! The manager tracks every template of one transport session, indexed by
//! template id and export time. A time cursor ([`TemplateManager::set_time`])
//! selects the point of view for all other operations; the transport class
//! decides whether templates may be replaced in place (UDP, file), must be
//! withdrawn first (TCP, SCTP) and whether the cursor may move backwards
//! (everything but TCP).
//!
//! Templates are immutable once stored and shared via [`Arc`]: snapshots are
//! cheap to take, stay frozen regardless of later manager operations, and may
//! be read from other threads. Physically removed templates move to a garbage
//! batch which keeps them alive until both the batch is dropped and no
//! snapshot references them.
//!
//! Export time is 32-bit and circular: ordering between two times is decided
//! by which wrap-around distance is shorter, so sessions running across the
//! 2^32 boundary keep working.

use crate::Error;
use crate::iemgr::IeManager;
use crate::template::{MIN_DATA_SET_ID, Template, TemplateType};

use log::{debug, trace};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Transport class of a session (RFC 7011, Section 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Udp,
    Tcp,
    Sctp,
    File,
}

impl SessionType {
    /// In-place template redefinition without a prior withdrawal.
    fn allows_replacement(self) -> bool {
        matches!(self, Self::Udp | Self::File)
    }

    /// Explicit template withdrawals.
    fn allows_withdrawal(self) -> bool {
        !matches!(self, Self::Udp)
    }

    /// Moving the time cursor backwards to query history.
    fn allows_backward_time(self) -> bool {
        !matches!(self, Self::Tcp)
    }
}

/// Circular `a <= b` over the 32-bit export-time space.
fn time_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 0x8000_0000
}

/// Circular `a < b`.
fn time_lt(a: u32, b: u32) -> bool {
    a != b && time_le(a, b)
}

/// One lifetime span of a template id.
#[derive(Debug, Clone)]
struct Lifetime {
    /// Export time the template became active.
    since: u32,
    /// Export time it stopped being active (withdrawal or replacement).
    until: Option<u32>,
    tmplt: Arc<Template>,
}

impl Lifetime {
    fn active_at(&self, t: u32) -> bool {
        time_le(self.since, t) && self.until.is_none_or(|u| time_lt(t, u))
    }
}

/// An immutable view of all templates active at one export time.
///
/// Snapshots are cheaply cloneable, `Send + Sync`, and independent of every
/// later manager operation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

#[derive(Debug)]
struct SnapshotInner {
    export_time: u32,
    templates: BTreeMap<u16, Arc<Template>>,
}

impl Snapshot {
    /// Export time the snapshot was taken at.
    pub fn export_time(&self) -> u32 {
        self.inner.export_time
    }

    /// Looks up a template by id.
    pub fn get(&self, id: u16) -> Option<&Arc<Template>> {
        self.inner.templates.get(&id)
    }

    /// Iterates all templates of the snapshot.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Arc<Template>)> {
        self.inner.templates.iter().map(|(id, t)| (*id, t))
    }

    pub fn len(&self) -> usize {
        self.inner.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.templates.is_empty()
    }
}

/// Templates retired from the manager since the previous collection.
///
/// Dropping the batch releases the manager's ownership; the underlying memory
/// is freed once no snapshot references the contained templates either.
#[derive(Debug, Default)]
pub struct GarbageBatch {
    templates: Vec<Arc<Template>>,
}

impl GarbageBatch {
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Time-indexed template store of one transport session.
#[derive(Debug)]
pub struct TemplateManager {
    session: SessionType,
    now: Option<u32>,
    history: BTreeMap<u16, Vec<Lifetime>>,
    iemgr: Option<Arc<IeManager>>,
    garbage: Vec<Arc<Template>>,
    snapshot_cache: Option<Snapshot>,
}

impl TemplateManager {
    pub fn new(session: SessionType) -> Self {
        Self {
            session,
            now: None,
            history: BTreeMap::new(),
            iemgr: None,
            garbage: Vec::new(),
            snapshot_cache: None,
        }
    }

    pub fn session_type(&self) -> SessionType {
        self.session
    }

    /// Installs the export-time cursor for subsequent operations.
    ///
    /// TCP sessions reject backward moves with [`Error::InvalidArg`]; other
    /// transports may navigate back to query historical state.
    pub fn set_time(&mut self, t: u32) -> Result<(), Error> {
        if let Some(now) = self.now {
            if time_lt(t, now) && !self.session.allows_backward_time() {
                return Err(Error::InvalidArg(format!(
                    "TCP session time cannot move backwards ({now} -> {t})"
                )));
            }
        }
        if self.now != Some(t) {
            self.snapshot_cache = None;
        }
        self.now = Some(t);
        Ok(())
    }

    fn cursor(&self) -> Result<u32, Error> {
        self.now
            .ok_or_else(|| Error::InvalidArg("export-time cursor is not set".to_string()))
    }

    fn active_index(entries: &[Lifetime], t: u32) -> Option<usize> {
        entries.iter().rposition(|e| e.active_at(t))
    }

    /// Inserts or refreshes a template under its own id.
    ///
    /// UDP and file sessions replace an existing template when the raw bytes
    /// differ and refresh `last_seen` when they match; TCP and SCTP deny any
    /// add over a template that is still defined at the cursor.
    pub fn template_add(&mut self, mut tmplt: Template) -> Result<(), Error> {
        let t = self.cursor()?;

        if tmplt.is_withdrawal() || tmplt.id < MIN_DATA_SET_ID {
            return Err(Error::InvalidArg(format!(
                "template {} is not a definition",
                tmplt.id
            )));
        }

        let entries = self.history.entry(tmplt.id).or_default();

        if let Some(last) = entries.last() {
            if time_lt(t, last.since) {
                return Err(Error::Denied(format!(
                    "template {}: cannot define a template in the past",
                    tmplt.id
                )));
            }
        }

        if let Some(idx) = Self::active_index(entries, t) {
            if entries[idx].until.is_some() {
                // The span is closed later in history; redefining inside it
                // would rewrite an already-observed interval.
                return Err(Error::Denied(format!(
                    "template {}: cannot modify historical state",
                    tmplt.id
                )));
            }

            if !self.session.allows_replacement() {
                return Err(Error::Denied(format!(
                    "template {}: this transport requires a withdrawal before the id is reused",
                    tmplt.id
                )));
            }

            let current = &entries[idx].tmplt;
            if current.raw == tmplt.raw {
                // Refresh: keep the definition (including flow-key flags),
                // bump last_seen via clone so live snapshots stay frozen.
                let mut refreshed = (**current).clone();
                refreshed.last_seen = t;
                entries[idx].tmplt = Arc::new(refreshed);
                self.snapshot_cache = None;
                trace!("template {} refreshed at {t}", tmplt.id);
                return Ok(());
            }

            // Replace: close the old span and retire its template.
            let old = entries[idx].tmplt.clone();
            entries[idx].until = Some(t);
            self.garbage.push(old);
            debug!("template {} replaced at {t}", tmplt.id);
        }

        tmplt.first_seen = t;
        tmplt.last_seen = t;
        if self.iemgr.is_some() {
            tmplt.ies_define(self.iemgr.as_deref(), false);
        }

        let id = tmplt.id;
        self.history.entry(id).or_default().push(Lifetime {
            since: t,
            until: None,
            tmplt: Arc::new(tmplt),
        });
        self.snapshot_cache = None;
        trace!("template {id} defined at {t}");
        Ok(())
    }

    /// Logically removes a template id from the cursor forward.
    ///
    /// UDP sessions have no withdrawal mechanism and return
    /// [`Error::Denied`]. The template stays queryable at earlier times on
    /// transports that may navigate backwards.
    pub fn template_withdraw(
        &mut self,
        id: u16,
        type_hint: Option<TemplateType>,
    ) -> Result<(), Error> {
        let t = self.cursor()?;

        if !self.session.allows_withdrawal() {
            return Err(Error::Denied(
                "UDP sessions cannot withdraw templates".to_string(),
            ));
        }

        let entries = self
            .history
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined")))?;
        let idx = Self::active_index(entries, t)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined at time {t}")))?;

        if let Some(hint) = type_hint {
            if entries[idx].tmplt.ttype != hint {
                return Err(Error::InvalidArg(format!(
                    "template {id} has type {:?}, not {hint:?}",
                    entries[idx].tmplt.ttype
                )));
            }
        }
        if entries[idx].until.is_some() {
            return Err(Error::Denied(format!(
                "template {id}: cannot modify historical state"
            )));
        }

        entries[idx].until = Some(t);
        if !self.session.allows_backward_time() {
            // No way back to observe it again; retire immediately.
            self.garbage.push(entries[idx].tmplt.clone());
        }
        self.snapshot_cache = None;
        debug!("template {id} withdrawn at {t}");
        Ok(())
    }

    /// Withdraws every template of the given type (all-withdrawal record).
    pub fn template_withdraw_all(&mut self, ttype: TemplateType) -> Result<(), Error> {
        let t = self.cursor()?;
        if !self.session.allows_withdrawal() {
            return Err(Error::Denied(
                "UDP sessions cannot withdraw templates".to_string(),
            ));
        }

        let ids: Vec<u16> = self
            .history
            .iter()
            .filter_map(|(id, entries)| {
                Self::active_index(entries, t)
                    .filter(|idx| entries[*idx].tmplt.ttype == ttype)
                    .map(|_| *id)
            })
            .collect();
        for id in ids {
            self.template_withdraw(id, Some(ttype))?;
        }
        Ok(())
    }

    /// Physically removes a template id across the whole history.
    pub fn template_remove(
        &mut self,
        id: u16,
        type_hint: Option<TemplateType>,
    ) -> Result<(), Error> {
        self.cursor()?;

        let entries = self
            .history
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined")))?;
        if let (Some(hint), Some(last)) = (type_hint, entries.last()) {
            if last.tmplt.ttype != hint {
                return Err(Error::InvalidArg(format!(
                    "template {id} has type {:?}, not {hint:?}",
                    last.tmplt.ttype
                )));
            }
        }

        let entries = self.history.remove(&id).unwrap_or_default();
        self.garbage.extend(entries.into_iter().map(|e| e.tmplt));
        self.snapshot_cache = None;
        debug!("template {id} removed");
        Ok(())
    }

    /// Returns the template active at the cursor.
    pub fn template_get(&self, id: u16) -> Result<Arc<Template>, Error> {
        let t = self.cursor()?;
        let entries = self
            .history
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined")))?;
        Self::active_index(entries, t)
            .map(|idx| entries[idx].tmplt.clone())
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined at time {t}")))
    }

    /// Attaches a flow-key bit mask to the template active at the cursor.
    ///
    /// Bit `i` of the mask corresponds to field `i`; bits beyond the field
    /// count fail with [`Error::Format`]. The key survives refreshes (same
    /// raw bytes) and is cleared by redefinition.
    pub fn template_set_fkey(&mut self, id: u16, mask: u64) -> Result<(), Error> {
        let t = self.cursor()?;
        let entries = self
            .history
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined")))?;
        let idx = Self::active_index(entries, t)
            .ok_or_else(|| Error::NotFound(format!("template {id} is not defined at time {t}")))?;

        let mut updated = (*entries[idx].tmplt).clone();
        updated.flowkey_define(mask)?;
        entries[idx].tmplt = Arc::new(updated);
        self.snapshot_cache = None;
        Ok(())
    }

    /// Takes an immutable snapshot of everything active at the cursor.
    pub fn snapshot_get(&mut self) -> Result<Snapshot, Error> {
        let t = self.cursor()?;

        if let Some(cached) = &self.snapshot_cache {
            return Ok(cached.clone());
        }

        let templates: BTreeMap<u16, Arc<Template>> = self
            .history
            .iter()
            .filter_map(|(id, entries)| {
                Self::active_index(entries, t).map(|idx| (*id, entries[idx].tmplt.clone()))
            })
            .collect();

        let snapshot = Snapshot {
            inner: Arc::new(SnapshotInner { export_time: t, templates }),
        };
        self.snapshot_cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Hands out every template retired since the previous call.
    pub fn garbage_get(&mut self) -> GarbageBatch {
        let batch = GarbageBatch {
            templates: std::mem::take(&mut self.garbage),
        };
        trace!("collected {} retired templates", batch.len());
        batch
    }

    /// Installs (or clears) the Information Element manager and re-runs IE
    /// definition on every stored template.
    ///
    /// Clearing keeps all templates but resets their per-field definitions
    /// and the derived BIFLOW/STRUCT flags.
    pub fn set_iemgr(&mut self, iemgr: Option<Arc<IeManager>>) {
        self.iemgr = iemgr;

        for entries in self.history.values_mut() {
            for entry in entries.iter_mut() {
                let mut updated = (*entry.tmplt).clone();
                updated.ies_define(self.iemgr.as_deref(), false);
                entry.tmplt = Arc::new(updated);
            }
        }
        self.snapshot_cache = None;
    }

    /// The currently installed Information Element manager.
    pub fn iemgr(&self) -> Option<&Arc<IeManager>> {
        self.iemgr.as_ref()
    }
}
