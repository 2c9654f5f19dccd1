//! Generic worker loop shared by all pipeline stages.
//!
//! Every stage exposes one `step()` that performs a single unit of work. The
//! loop here drives it, classifies failures, and turns a fatal error into a
//! pipeline-wide cancel so sibling stages unblock instead of waiting forever
//! on their queues.

use crate::cancel::{CancelToken, Cancelled};
use crate::error::PlayerError;

/// Consecutive recoverable failures a stage tolerates before giving up.
const MAX_CONSECUTIVE_RETRIES: u32 = 3;

/// Outcome of one successful stage iteration.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// More work may follow; call again.
    Continue,
    /// The stage handled end of stream and is finished.
    Done,
}

/// Failure of one stage iteration.
#[derive(Debug)]
pub enum StageError {
    /// The current unit was lost but the stream can go on (one bad packet).
    /// The loop skips it and counts consecutive misses.
    Retryable(PlayerError),
    /// The stage cannot continue; the whole pipeline is cancelled.
    Fatal(PlayerError),
    /// A blocking wait was interrupted by the cancel token.
    Cancelled,
}

impl From<Cancelled> for StageError {
    fn from(_: Cancelled) -> Self {
        StageError::Cancelled
    }
}

/// How a stage ended; reported to the pipeline supervisor.
#[derive(Debug)]
pub enum StageExit {
    /// Ran to end of stream.
    Completed,
    /// Stopped because the cancel token fired.
    Cancelled,
    /// Hit a fatal error. The loop cancels the token before returning this.
    Failed(PlayerError),
}

/// Drive one stage to completion.
///
/// Calls `step` until it reports [`Step::Done`], a cancellation, or a fatal
/// error. Recoverable errors are logged and skipped; after
/// [`MAX_CONSECUTIVE_RETRIES`] in a row the stage gives up and the last
/// error becomes fatal.
pub fn run_stage<F>(name: &'static str, token: &CancelToken, mut step: F) -> StageExit
where
    F: FnMut() -> Result<Step, StageError>,
{
    let mut misses = 0u32;
    loop {
        if token.is_cancelled() {
            return StageExit::Cancelled;
        }
        match step() {
            Ok(Step::Continue) => misses = 0,
            Ok(Step::Done) => {
                tracing::debug!(stage = name, "stage completed");
                return StageExit::Completed;
            }
            Err(StageError::Cancelled) => return StageExit::Cancelled,
            Err(StageError::Retryable(err)) => {
                misses += 1;
                if misses >= MAX_CONSECUTIVE_RETRIES {
                    tracing::error!(
                        stage = name,
                        error = %err,
                        misses,
                        "giving up after consecutive failures"
                    );
                    token.cancel();
                    return StageExit::Failed(err);
                }
                tracing::warn!(stage = name, error = %err, "skipping unit after recoverable error");
            }
            Err(StageError::Fatal(err)) => {
                tracing::error!(stage = name, error = %err, "fatal stage error");
                token.cancel();
                return StageExit::Failed(err);
            }
        }
    }
}
