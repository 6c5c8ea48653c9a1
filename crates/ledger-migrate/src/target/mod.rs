//! Target system implementations.
//!
//! [`InMemoryTarget`] is the reference implementation of the
//! [`TargetSystem`] contract; [`JsonFileTarget`] persists the same state to
//! disk after every mutation.

mod file;
mod memory;

pub use file::JsonFileTarget;
pub use memory::{InMemoryTarget, TargetSnapshot};

use crate::config::RetryConfig;
use crate::core::{Document, EntityType, TargetSystem};
use crate::error::Result;
use crate::resilience::retry_with_backoff;

/// Create a record, retrying transient target failures with backoff.
///
/// Validation errors are returned on the first attempt.
pub async fn create_with_retry(
    target: &dyn TargetSystem,
    entity: EntityType,
    data: Document,
    attempts: u32,
    retry: &RetryConfig,
) -> Result<String> {
    let config = RetryConfig {
        max_attempts: attempts.max(1),
        ..retry.clone()
    };
    let label = format!("create {}", entity);
    retry_with_backoff(&config, &label, || target.create(entity, data.clone())).await
}
