//! Process-wide `DataKit` for hosts that prefer a singleton.
//!
//! The instance is built on first access; the accessing thread becomes its
//! main thread. It is never torn down.

use crate::context::{ContextError, WorkContext};
use crate::save::SaveResult;
use crate::stack::DataKit;
use once_cell::sync::Lazy;

static SHARED: Lazy<DataKit> = Lazy::new(DataKit::new);

impl DataKit {
    /// Returns the process-wide instance.
    pub fn shared() -> &'static DataKit {
        &SHARED
    }
}

/// `DataKit::shared().save(mutation, completion)`.
pub fn save<M, C>(mutation: M, completion: C)
where
    M: FnOnce(&mut WorkContext<'_>) -> Result<(), ContextError> + Send + 'static,
    C: FnOnce(SaveResult) + Send + 'static,
{
    DataKit::shared().save(mutation, completion);
}
