//! Shared fixtures for channel tests.

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};

use crate::channel::{CloneableHostChannel, CloneablePluginChannel, HostChannel, PluginChannel};
use crate::envelope::Envelope;

/// Spawns a responder that answers every matched request with a `kind`
/// envelope echoing the request as payload. The request's `"context"` field
/// (or the whole request, if absent) is used as the correlation token.
pub fn spawn_echo_plugin(
    mut plugin: Box<dyn CloneablePluginChannel>,
    kind: &'static str,
) -> JoinHandle<()> {
    let responder = plugin.clone();
    tokio::spawn(async move {
        while let Some(request) = plugin.next_request().await {
            let token = match request.get("context") {
                Some(context) => context.clone(),
                None => request.clone(),
            };
            let _ = responder.send(kind, token, json!({ "echo": request }));
        }
    })
}

/// Collects `n` response envelopes from `host`, failing the test if they do
/// not all arrive within `wait`.
pub async fn collect_responses(
    host: &mut Box<dyn CloneableHostChannel>,
    n: usize,
    wait: Duration,
) -> Vec<Envelope> {
    let mut collected = Vec::with_capacity(n);
    for _ in 0..n {
        let envelope = timeout(wait, host.next_response())
            .await
            .expect("timed out waiting for a response")
            .expect("response stream closed");
        collected.push(envelope);
    }
    collected
}

/// Convenience wrapper for the request `Value` most tests broadcast.
pub fn request(cmd: &str, context: &str) -> Value {
    json!({ "cmd": cmd, "context": context })
}
