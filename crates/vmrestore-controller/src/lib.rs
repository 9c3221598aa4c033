//! VirtualMachineRestore controller
//!
//! Restores a virtual machine's spec and disks from a VirtualMachineSnapshot,
//! either onto the machine the snapshot was taken of or onto a new one.
//! Every invocation of [`controller::reconcile`] recomputes the restore's
//! state from persisted status and advances it by one step.

pub mod client;
pub mod conditions;
pub mod controller;
pub mod state;
pub mod storage;
pub mod target;
pub mod watch;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};

/// Requeue delay after writing the restore's owner reference
pub const REQUEUE_OWNER_SECS: u64 = 1;

/// Requeue delay while another restore holds the target's lock
pub const REQUEUE_LOCKED_SECS: u64 = 30;

/// Requeue delay after an optimistic-concurrency conflict
pub const REQUEUE_API_CONFLICT_SECS: u64 = 1;

/// Requeue delay after any other reconcile error
pub const REQUEUE_ERROR_SECS: u64 = 5;

/// Default periodic resync while a restore waits on external state
pub const DEFAULT_RESYNC_SECS: u64 = 60;
