// =============================================================================
// Audit Module
// =============================================================================
//
// Reproducibility layer observing every stage:
// - Canonical JSON + SHA-256 hashing
// - Append-only logs with an upsertable score/decision log

pub mod hashing;
pub mod ledger;

pub use ledger::{Anomaly, AnomalyKind, AuditLedger, AuditRecord, FailedCycle};
