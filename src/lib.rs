// ABOUTME: Library root for database-auditor
// ABOUTME: Row fingerprinting, change classification and the audit store

pub mod auditor;
pub mod commands;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod normalize;
pub mod source;
pub mod stats;
pub mod store;
pub mod tracker;
pub mod utils;

pub use auditor::{AuditOptions, Auditor};
pub use config::Config;
pub use error::{EncodeError, ScanError};
pub use store::AuditStore;
