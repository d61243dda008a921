//! Small shared helpers.

use crate::operator::OperatorError;

/// Run a CPU-bound function off the async executor.
///
/// Operators are cooperative; anything that would monopolize the worker
/// thread (large parses, scoring loops over big corpora) goes through
/// here.
pub async fn blocking_func_to_async<F, T>(func: F) -> Result<T, OperatorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(func)
        .await
        .map_err(|err| OperatorError::Internal(format!("blocking task failed: {err}")))
}
