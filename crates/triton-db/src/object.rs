//! Persistable domain objects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::connection::Connection;
use crate::error::DbResult;

/// Per-object persistence state: the save-coalescing sequence and the
/// auto-save flag.
///
/// Every call to [`crate::PersistenceDaemon::pend_for_saving`] advances the
/// sequence and stamps the new value onto the queued intent. Only the intent
/// whose stamp still equals the current sequence at dispatch time is live;
/// older ones are tombstones and are dropped without touching the database.
#[derive(Debug, Default)]
pub struct SaveContext {
    sequence: AtomicU64,
    auto_save: AtomicBool,
}

impl SaveContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Supersedes all earlier save intents and returns the new live stamp.
    pub fn advance(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The stamp of the currently live intent.
    pub fn current(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Marks the object as eligible for write-behind saving. Set by the
    /// daemon after a successful load.
    pub fn enable_auto_saving(&self) {
        self.auto_save.store(true, Ordering::Release);
    }

    pub fn is_auto_saving(&self) -> bool {
        self.auto_save.load(Ordering::Acquire)
    }
}

/// An entity the persistence daemon can save and load.
///
/// Saves receive a shared view: the daemon clones the `Arc` it was pended
/// with, so implementations synchronize their own field access (the framework
/// objects use atomics or a mutex). Loads also run through `&self` and
/// populate the object's interior before the completion callback fires.
pub trait Persistable: Send + Sync + 'static {
    /// The object's coalescing state. Implementations return a field.
    fn save_context(&self) -> &SaveContext;

    /// Serializes the current state into the database.
    fn sync_save(&self, conn: &mut dyn Connection) -> DbResult<()>;

    /// Populates the object from rows matching `filter`.
    fn sync_load(&self, conn: &mut dyn Connection, filter: &str) -> DbResult<()>;
}
