//! First-fatal-error capture for the fetch pipeline.
//!
//! A fatal error can originate in either background task: the flush loop
//! (storage rejected an ordered batch) or the scheduler loop (a task ran out
//! of retries under the abort policy). Whichever fires first wins the slot,
//! cancels the run and root tokens, and is replayed to the caller when the
//! fetcher winds down. Later fatals are logged by their trigger site and
//! otherwise ignored.

use crate::sink::SinkError;
use anyhow::Error as AnyError;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    first_error: Mutex<Option<Arc<AnyError>>>,
}

/// The captured error is handed out twice (to the trigger site and from
/// [`FatalErrorHandler::error`]), so it lives behind an `Arc` and each
/// hand-out wraps the shared value.
struct SharedFatal(Arc<AnyError>);

impl fmt::Debug for SharedFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.0.as_ref(), f)
    }
}

impl fmt::Display for SharedFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0.as_ref(), f)
    }
}

impl std::error::Error for SharedFatal {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref().as_ref())
    }
}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                root_shutdown,
                run_shutdown,
                first_error: Mutex::new(None),
            }),
        }
    }

    /// Records a fatal sink error and starts the shutdown cascade.
    pub fn trigger(&self, error: SinkError) -> AnyError {
        let stage = error.stage();
        self.capture(error.into(), |error| {
            tracing::error!(
                stage = ?stage,
                error = %error,
                "fatal sink error; initiating shutdown"
            );
        })
    }

    /// Records a fatal error raised outside the sink, e.g. a task exhausting
    /// its retries under the abort policy.
    pub fn trigger_external(&self, context: &str, error: AnyError) -> AnyError {
        self.capture(error, |error| {
            tracing::error!(
                context,
                error = %error,
                "fatal pipeline error; initiating shutdown"
            );
        })
    }

    fn capture(&self, error: AnyError, log: impl FnOnce(&AnyError)) -> AnyError {
        let shared = {
            let mut slot = self.inner.first_error.lock().unwrap();
            if slot.is_some() {
                // Already shutting down; the late error is the caller's to
                // report.
                tracing::debug!(error = %error, "fatal error after shutdown began");
                return error;
            }
            log(&error);
            let shared = Arc::new(error);
            *slot = Some(shared.clone());
            shared
        };

        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();

        AnyError::new(SharedFatal(shared))
    }

    /// Returns the first captured fatal error, if any. Callable repeatedly.
    pub fn error(&self) -> Option<AnyError> {
        self.inner
            .first_error
            .lock()
            .unwrap()
            .as_ref()
            .map(|shared| AnyError::new(SharedFatal(shared.clone())))
    }
}
