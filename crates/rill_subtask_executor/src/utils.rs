use std::error::Error;
use std::future::Future;

use rill_subtask_types::errors::{SubtaskExecutionError, SubtaskExecutionResult};
use tokio_util::sync::CancellationToken;

/// Awaits `fut`, bailing out with `Cancelled` as soon as the token fires.
/// Cancellation wins over a simultaneously ready result.
pub(crate) async fn cancellable<T, E>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, E>>,
) -> SubtaskExecutionResult<T>
where
    E: Into<SubtaskExecutionError>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SubtaskExecutionError::Cancelled),
        result = fut => result.map_err(Into::into),
    }
}

pub(crate) fn check_cancelled(token: &CancellationToken) -> SubtaskExecutionResult<()> {
    if token.is_cancelled() {
        return Err(SubtaskExecutionError::Cancelled);
    }
    Ok(())
}

/// Renders an error with its full source chain, used as the traceback of
/// results that carry no kernel-provided one.
pub(crate) fn error_chain(err: &dyn Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
