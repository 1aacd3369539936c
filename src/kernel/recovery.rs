//! Panic recovery for built-in service calls.
//!
//! A bug in one built-in service must surface as an `INTERNAL_SERVICE_ERROR`
//! for that one task, never as a crashed kernel.

use crate::types::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// A panic is captured, logged, and converted to
/// [`Error::InternalService`].
///
/// # Example
/// ```
/// use polyroute_core::kernel::with_recovery;
///
/// let result = with_recovery(|| Ok(2 + 2), "arithmetic");
/// assert_eq!(result.unwrap(), 4);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                "panic_recovered"
            );

            Err(Error::internal_service(format!(
                "{operation_name} failed: {panic_msg}"
            )))
        }
    }
}

fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
