//! Release watcher state infrastructure.
//!
//! Implements the [`watcher::WatermarkStore`] trait on the local filesystem.
//! The state directory is expected to survive between scheduled runs (a
//! persistent volume, a cached CI directory, or a checked-in state branch).
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** File layout, encoding, atomic replacement, and lock
//! files live here. The [`watcher`] crate sees only [`watcher::WatermarkStore`].
//!
//! ## Guarantees
//!
//! - Writes go to a temporary file in the state directory and are renamed over
//!   the previous record, so a cancelled run never leaves a partial value.
//! - A write older than the stored watermark is refused with
//!   [`watcher::StoreError::Regression`].
//! - The run lock is an exclusively-created file. Locks older than the
//!   configured TTL are treated as abandoned and broken.

mod file;
mod io;

pub use file::{FileWatermarkStore, LockRecord, WatermarkRecord, DEFAULT_LOCK_TTL};
