//! Serde data model shared by the publisher and the consumer: restore-point
//! names, manifests, the LATEST pointer, receipts, and instance descriptors.
//!
//! Everything here is plain data. The two daemons never talk to each other
//! directly; these types *are* the protocol, serialized as JSON files in the
//! manifest directory and the receipts directory.

pub mod instance;
pub mod manifest;
pub mod name;
pub mod receipt;

pub use instance::InstanceDescriptor;
pub use manifest::{LatestPointer, Manifest, ManifestInstance};
pub use name::RestorePointName;
pub use receipt::{EvidenceVerdict, InstanceOutcome, Receipt, ReceiptStatus, RecoveryMode};

/// `segment_id` of the cluster coordinator in topology listings, manifests
/// and DR configuration.
pub const COORDINATOR_SEGMENT_ID: i32 = -1;
