//! Durable state shared by the gateway components.
//!
//! Everything is kept in memory and mirrored to JSON-lines journals under
//! the configured data directory so that it survives a restart.

pub mod dir_lock;
pub mod idempotency;
pub mod journal;
pub mod lease;

pub use dir_lock::{DirLock, LOCK_FILE};
pub use idempotency::{Claim, ClaimOutcome, CompletedOperation, IdempotencyStore, PendingOperation};
pub use journal::Journal;
pub use lease::{Lease, LeaseGuard, LeaseTable};

/// Journal file names inside the data directory.
pub const REGISTRY_JOURNAL: &str = "keys.jsonl";
pub const CERTIFICATE_JOURNAL: &str = "certificates.jsonl";
pub const AUDIT_JOURNAL: &str = "audit.jsonl";
pub const IDEMPOTENCY_JOURNAL: &str = "requests.jsonl";
pub const LEASE_JOURNAL: &str = "leases.jsonl";
pub const HSM_KEYSTORE_DIR: &str = "hsm";
