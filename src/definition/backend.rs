//! The shared services workflows are wired to: Postgres when a database is
//! configured, in-process otherwise.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::archive::{MemoryRunArchive, RunArchive};
use crate::db::pgmq::{PgmqDeadLetters, PgmqSource};
use crate::db::{Db, PgIdempotencyStore};
use crate::error::Result;
use crate::notify::{MemoryTopic, TopicPublisher};
use crate::store::{IdempotencyStore, MemoryIdempotencyStore};
use crate::trigger::{DeadLetterQueue, MemoryDeadLetters, MemoryQueue, MessageSource};

pub enum Backend {
    Postgres(Arc<Db>),
    Memory(MemoryBackend),
}

/// In-process services. Queues and dead-letter queues are created on first
/// use and shared by name.
#[derive(Default)]
pub struct MemoryBackend {
    pub store: Arc<MemoryIdempotencyStore>,
    pub archive: Arc<MemoryRunArchive>,
    pub topic: Arc<MemoryTopic>,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    dead_letters: Mutex<HashMap<String, Arc<MemoryDeadLetters>>>,
}

impl MemoryBackend {
    pub fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        Arc::clone(
            self.queues
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryQueue::new(name))),
        )
    }

    pub fn dead_letter_queue(&self, name: &str) -> Arc<MemoryDeadLetters> {
        Arc::clone(
            self.dead_letters
                .lock()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryDeadLetters::new())),
        )
    }
}

impl Backend {
    pub fn in_memory() -> Self {
        Backend::Memory(MemoryBackend::default())
    }

    pub fn postgres(db: Arc<Db>) -> Self {
        Backend::Postgres(db)
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Backend::Postgres(_))
    }

    /// Idempotency store for `workflow`. A dedicated store gets its own
    /// table; in memory it gets its own map.
    pub async fn store(
        &self,
        workflow: &str,
        dedicated: bool,
    ) -> Result<Arc<dyn IdempotencyStore>> {
        Ok(match (self, dedicated) {
            (Backend::Postgres(db), false) => Arc::new(PgIdempotencyStore::shared(Arc::clone(db))),
            (Backend::Postgres(db), true) => {
                Arc::new(PgIdempotencyStore::dedicated(Arc::clone(db), workflow).await?)
            }
            (Backend::Memory(m), false) => Arc::clone(&m.store) as Arc<dyn IdempotencyStore>,
            (Backend::Memory(_), true) => Arc::new(MemoryIdempotencyStore::new()),
        })
    }

    pub fn archive(&self) -> Arc<dyn RunArchive> {
        match self {
            Backend::Postgres(db) => Arc::clone(db) as Arc<dyn RunArchive>,
            Backend::Memory(m) => Arc::clone(&m.archive) as Arc<dyn RunArchive>,
        }
    }

    pub fn publisher(&self) -> Arc<dyn TopicPublisher> {
        match self {
            Backend::Postgres(db) => Arc::clone(db) as Arc<dyn TopicPublisher>,
            Backend::Memory(m) => Arc::clone(&m.topic) as Arc<dyn TopicPublisher>,
        }
    }

    /// Make sure a queue exists before anything reads or writes it.
    pub async fn ensure_queue(&self, name: &str) -> Result<()> {
        match self {
            Backend::Postgres(db) => db.create_queue(name).await,
            Backend::Memory(m) => {
                m.queue(name);
                Ok(())
            }
        }
    }

    pub fn source(&self, queue: &str) -> Arc<dyn MessageSource> {
        match self {
            Backend::Postgres(db) => Arc::new(PgmqSource::new(Arc::clone(db), queue)),
            Backend::Memory(m) => m.queue(queue) as Arc<dyn MessageSource>,
        }
    }

    pub fn dead_letters(&self, queue: &str) -> Arc<dyn DeadLetterQueue> {
        match self {
            Backend::Postgres(db) => Arc::new(PgmqDeadLetters::new(Arc::clone(db), queue)),
            Backend::Memory(m) => m.dead_letter_queue(queue) as Arc<dyn DeadLetterQueue>,
        }
    }
}
