//! Common types for the VM restore controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod quantity;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every write made by the controller
pub const FIELD_MANAGER: &str = "vmrestore-controller";

/// Annotation on the target machine naming the last restore applied to it
///
/// The value is `<restore-name>-<restore-uid>`.
pub const LAST_RESTORE_ANNOTATION: &str = "restore.kubevirt.io/lastRestoreUID";

/// Annotation on restored claims naming the restore that created them
pub const RESTORE_NAME_ANNOTATION: &str = "restore.kubevirt.io/name";

/// Annotation linking a claim to the DataVolume that populates it
pub const POPULATED_FOR_ANNOTATION: &str = "cdi.kubevirt.io/storage.populatedFor";
