#![doc = include_str!("../README.md")]

pub mod bytes;
pub mod iemgr;
pub mod json;
pub mod list;
pub mod message;
pub mod protocol;
pub mod record;
pub mod template;
pub mod template_mgr;

use log::debug;
use thiserror::Error as ThisError;

use std::sync::Arc;

pub use iemgr::IeManager;
pub use json::{JsonBuffer, JsonFlags, record_to_json};
pub use list::{
    BasicListIter, ListFlags, ListSemantics, SubTemplateListIter, SubTemplateMultiListIter,
};
pub use message::{MessageHeader, SetView, SetsIter, TemplateSetIter, TsetRecord};
pub use record::{DataRecord, DataSetIter, DrecFlags, DrecIter};
pub use template::{Template, TemplateType};
pub use template_mgr::{GarbageBatch, SessionType, Snapshot, TemplateManager};

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wire data violates the protocol specification.
    Format,
    /// A value cannot be decoded for its declared type.
    InvalidData,
    /// A looked-up template, element, alias or key is absent.
    NotFound,
    /// The operation violates the transport session policy.
    Denied,
    /// A caller precondition is unmet.
    InvalidArg,
    /// A name does not follow the `scope:element` or alias grammar.
    InvalidName,
    /// The caller-supplied output buffer is too small to grow.
    InsufficientBuffer,
    /// Allocation failure.
    OutOfMemory,
    /// A definition file changed on disk since it was read.
    Differs,
}

/// Library error: a category plus a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("malformed data: {0}")]
    Format(String),
    #[error("invalid value: {0}")]
    InvalidData(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("denied by session policy: {0}")]
    Denied(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("insufficient buffer: {0}")]
    InsufficientBuffer(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("definitions differ: {0}")]
    Differs(String),
}

impl Error {
    /// The machine-readable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Format(_) => ErrorKind::Format,
            Error::InvalidData(_) => ErrorKind::InvalidData,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Denied(_) => ErrorKind::Denied,
            Error::InvalidArg(_) => ErrorKind::InvalidArg,
            Error::InvalidName(_) => ErrorKind::InvalidName,
            Error::InsufficientBuffer(_) => ErrorKind::InsufficientBuffer,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::Differs(_) => ErrorKind::Differs,
        }
    }
}

/// One parsed message: its header, the Data Sets it carried, and the
/// template snapshot valid at its export time.
#[derive(Debug, Clone)]
pub struct ParsedMessage<'a> {
    pub header: MessageHeader,
    pub data_sets: Vec<SetView<'a>>,
    pub snapshot: Snapshot,
}

impl<'a> ParsedMessage<'a> {
    /// Iterates the Data Records of one of the message's Data Sets.
    ///
    /// Fails with [`Error::NotFound`] when no template matches the set id.
    pub fn records(&self, set: &SetView<'a>) -> Result<DataSetIter<'a>, Error> {
        DataSetIter::new(set.id, set.body, &self.snapshot)
    }
}

/// Builder for configuring and constructing a [`SessionParser`].
#[derive(Debug, Clone)]
pub struct SessionParserBuilder {
    session: SessionType,
    iemgr: Option<Arc<IeManager>>,
}

impl SessionParserBuilder {
    /// Attaches an Information Element manager; templates get their field
    /// definitions (and biflow views) resolved against it.
    #[must_use = "builder methods consume self and return a new builder; the return value must be used"]
    pub fn with_iemgr(mut self, iemgr: Arc<IeManager>) -> Self {
        self.iemgr = Some(iemgr);
        self
    }

    pub fn build(self) -> SessionParser {
        let mut tmgr = TemplateManager::new(self.session);
        if self.iemgr.is_some() {
            tmgr.set_iemgr(self.iemgr);
        }
        SessionParser { tmgr }
    }
}

/// Message-level parser for one transport session.
///
/// Ties the Set walker to the session's [`TemplateManager`]: template sets
/// and withdrawals update the manager, Data Sets are handed back together
/// with the snapshot they decode under.
///
/// # Examples
///
/// ```rust
/// use ipfix_parser::{SessionParser, SessionType};
///
/// let mut parser = SessionParser::new(SessionType::Udp);
/// assert!(parser.process_message(&[]).is_err()); // too short for a header
/// ```
#[derive(Debug)]
pub struct SessionParser {
    tmgr: TemplateManager,
}

impl SessionParser {
    pub fn new(session: SessionType) -> Self {
        Self::builder(session).build()
    }

    pub fn builder(session: SessionType) -> SessionParserBuilder {
        SessionParserBuilder { session, iemgr: None }
    }

    /// The session's template manager.
    pub fn template_manager(&mut self) -> &mut TemplateManager {
        &mut self.tmgr
    }

    /// Parses one message: advances the session cursor to the message's
    /// export time, applies all (Options) Template Sets to the template
    /// manager, and returns the Data Sets with a matching snapshot.
    ///
    /// A failed template operation aborts the message; the template manager
    /// keeps every update applied before the failure.
    pub fn process_message<'a>(&mut self, data: &'a [u8]) -> Result<ParsedMessage<'a>, Error> {
        let (header, body, _) = MessageHeader::parse_message(data)?;
        self.tmgr.set_time(header.export_time)?;

        let mut data_sets = Vec::new();
        for set in SetsIter::new(body) {
            let set = set?;
            if set.is_template_set() {
                for record in TemplateSetIter::new(&set)? {
                    match record? {
                        TsetRecord::Definition(tmplt) => self.tmgr.template_add(tmplt)?,
                        TsetRecord::Withdrawal { id, ttype } => {
                            self.tmgr.template_withdraw(id, Some(ttype))?
                        }
                        TsetRecord::AllWithdrawal { ttype } => {
                            self.tmgr.template_withdraw_all(ttype)?
                        }
                    }
                }
            } else if set.is_data_set() {
                data_sets.push(set);
            }
            // Set ids 4-255 are reserved; their content is ignored.
        }

        debug!(
            "message at {} processed: {} data sets, sequence {}",
            header.export_time,
            data_sets.len(),
            header.sequence_number
        );

        Ok(ParsedMessage {
            header,
            data_sets,
            snapshot: self.tmgr.snapshot_get()?,
        })
    }
}
