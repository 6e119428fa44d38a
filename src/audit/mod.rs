//! Audit log module.
//!
//! Provides a tamper-evident, sequence-numbered record of every terminal
//! outcome the gateway produces.

pub mod entry;
pub mod log;

pub use entry::{AuditAction, AuditDraft, AuditEntry, GENESIS_HASH};
pub use log::{read_journal, verify_entries, verify_inclusion, AuditExport, AuditLog, ChainError};
