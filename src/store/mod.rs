//! Idempotency store: the admission gate.
//!
//! The only shared mutable state between concurrent runs. Implementations must
//! make `insert_if_absent` atomic per key: exactly one concurrent caller gets
//! [`Admission::Admitted`]. Records are never updated or deleted here; expiry
//! belongs to the backing store.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Admission, IdempotencyRecord};

pub use memory::MemoryIdempotencyStore;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert the record unless its key already exists.
    ///
    /// An `Err` means the outcome is unknown (timeout, connection loss) and is
    /// distinct from `AlreadyExists`.
    async fn insert_if_absent(&self, record: &IdempotencyRecord) -> Result<Admission>;
}
