//! Embedding helpers for hosts that are not async themselves.
//!
//! An editor main loop is typically synchronous; these helpers give it one
//! process-wide Tokio runtime to create the broker on and to pump channel
//! futures through.

use std::future::Future;

use once_cell::sync::OnceCell;
use tokio::runtime::{Handle, Runtime};
use tracing_subscriber::EnvFilter;

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Returns the process-wide runtime, building it on first use.
pub fn global_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime")
    })
}

/// Fire-and-forget a future on the global runtime.
pub fn spawn_detached<F>(fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    global_runtime().spawn(fut);
}

/// Drive a future to completion from synchronous host code.
pub fn run_blocking<F, R>(fut: F) -> R
where
    F: Future<Output = R> + Send,
    R: Send + 'static,
{
    global_runtime().block_on(fut)
}

/// Handle to the global runtime, for entering it manually.
pub fn handle() -> Handle {
    global_runtime().handle().clone()
}

/// Install a stderr tracing subscriber filtered by `RUST_LOG`. Idempotent:
/// later calls (and an already-installed subscriber) are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_blocking_uses_one_shared_runtime() {
        let a = run_blocking(async { 21 * 2 });
        assert_eq!(a, 42);
        // Second call must reuse the runtime, not rebuild it.
        let b = run_blocking(async { handle().metrics().num_workers() });
        assert!(b >= 1);
    }
}
