//! In-process broker: the one concrete implementation of the channel
//! contract shipped with this crate.
//!
//! The broker is a single task owning an append-only registry of plugin
//! channels. Every host request and every plugin response crosses the
//! broker's command queue, so delivery always happens strictly after the
//! call that triggered it returned. That matches the latency profile of a
//! cross-process transport and rules out reentrant handler execution, even
//! when a plugin handler itself sends further messages.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};
use uuid::Uuid;

use crate::channel::{
    ActivationFn, Channel, ChannelError, CloneableHostChannel, CloneablePluginChannel,
    HostChannel, PluginChannel,
};
use crate::envelope::Envelope;
use crate::metadata::{self, PluginFilter, PluginMetadata};

const RESPONSE_STREAM_CAPACITY: usize = 64;
const REQUEST_STREAM_CAPACITY: usize = 16;

enum BrokerCommand {
    Register(Registration),
    Broadcast { message: Value, filter: PluginFilter },
    Relay(Envelope),
}

struct Registration {
    id: Uuid,
    metadata: PluginMetadata,
    requests: broadcast::Sender<Value>,
    /// Taken out on first matching request; `None` afterwards means the
    /// plugin is activated (or its activation already failed and will not be
    /// retried).
    activation: Option<ActivationFn>,
}

/// In-process [`Channel`]. Spawns its broker task on construction, so it must
/// be created inside a Tokio runtime; synchronous hosts can lean on
/// [`crate::runtime::run_blocking`].
pub struct InProcessChannel {
    commands: mpsc::UnboundedSender<BrokerCommand>,
    responses: Arc<broadcast::Sender<Envelope>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (responses, _) = broadcast::channel(RESPONSE_STREAM_CAPACITY);
        let responses = Arc::new(responses);
        tokio::spawn(run_broker(command_rx, Arc::clone(&responses)));
        Self { commands, responses }
    }
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for InProcessChannel {
    fn host(&self) -> Box<dyn CloneableHostChannel> {
        Box::new(InProcessHostChannel {
            commands: self.commands.clone(),
            responses: self.responses.subscribe(),
            responses_src: Arc::clone(&self.responses),
        })
    }

    fn create_plugin_channel(
        &self,
        metadata: PluginMetadata,
        on_activate: ActivationFn,
    ) -> Result<Box<dyn CloneablePluginChannel>, ChannelError> {
        let (requests, request_rx) = broadcast::channel(REQUEST_STREAM_CAPACITY);
        let registration = Registration {
            id: Uuid::new_v4(),
            metadata: metadata.clone(),
            requests: requests.clone(),
            activation: Some(on_activate),
        };
        // Commands are processed in order, so a broadcast queued after this
        // registration is guaranteed to see the entry.
        self.commands
            .send(BrokerCommand::Register(registration))
            .map_err(|_| ChannelError::Closed)?;

        Ok(Box::new(InProcessPluginChannel {
            metadata,
            commands: self.commands.clone(),
            requests: request_rx,
            requests_src: Arc::new(requests),
        }))
    }
}

async fn run_broker(
    mut commands: mpsc::UnboundedReceiver<BrokerCommand>,
    responses: Arc<broadcast::Sender<Envelope>>,
) {
    let mut registry: Vec<Registration> = Vec::new();

    while let Some(command) = commands.recv().await {
        match command {
            BrokerCommand::Register(entry) => {
                debug!(plugin = %entry.metadata.name, id = %entry.id, "registered plugin channel");
                registry.push(entry);
            }
            BrokerCommand::Broadcast { message, filter } => {
                if let Err(err) = broadcast_step(&mut registry, &message, &filter) {
                    // The failed activation is consumed and not retried; the
                    // rest of this broadcast step is abandoned, later
                    // commands are served normally.
                    error!(error = %err, "plugin activation failed, aborting broadcast step");
                }
            }
            BrokerCommand::Relay(envelope) => {
                // No live host subscriber is not an error: the contract gives
                // no delivery guarantee.
                let _ = responses.send(envelope);
            }
        }
    }
}

fn broadcast_step(
    registry: &mut [Registration],
    message: &Value,
    filter: &PluginFilter,
) -> anyhow::Result<()> {
    let mut matched = 0usize;
    for entry in registry
        .iter_mut()
        .filter(|e| metadata::matches(&e.metadata, filter))
    {
        matched += 1;
        if let Some(activate) = entry.activation.take() {
            debug!(plugin = %entry.metadata.name, id = %entry.id, "activating plugin");
            activate()?;
        }
        // A dropped plugin channel just means nobody is listening any more.
        let _ = entry.requests.send(message.clone());
    }
    debug!(matched, total = registry.len(), "broadcast delivered");
    Ok(())
}

/// Host endpoint handed out by [`InProcessChannel::host`]. Cloning yields an
/// independent subscription to the response stream.
pub struct InProcessHostChannel {
    commands: mpsc::UnboundedSender<BrokerCommand>,
    responses: broadcast::Receiver<Envelope>,
    responses_src: Arc<broadcast::Sender<Envelope>>,
}

impl CloneableHostChannel for InProcessHostChannel {
    fn clone_box(&self) -> Box<dyn CloneableHostChannel> {
        Box::new(Self {
            commands: self.commands.clone(),
            responses: self.responses_src.subscribe(),
            responses_src: Arc::clone(&self.responses_src),
        })
    }
}

#[async_trait::async_trait]
impl HostChannel for InProcessHostChannel {
    fn send(&self, message: Value, filter: PluginFilter) -> Result<(), ChannelError> {
        self.commands
            .send(BrokerCommand::Broadcast { message, filter })
            .map_err(|_| ChannelError::Closed)
    }

    async fn next_response(&mut self) -> Option<Envelope> {
        loop {
            match self.responses.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "host response subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Plugin endpoint returned by [`InProcessChannel::create_plugin_channel`].
pub struct InProcessPluginChannel {
    metadata: PluginMetadata,
    commands: mpsc::UnboundedSender<BrokerCommand>,
    requests: broadcast::Receiver<Value>,
    requests_src: Arc<broadcast::Sender<Value>>,
}

impl CloneablePluginChannel for InProcessPluginChannel {
    fn clone_box(&self) -> Box<dyn CloneablePluginChannel> {
        Box::new(Self {
            metadata: self.metadata.clone(),
            commands: self.commands.clone(),
            requests: self.requests_src.subscribe(),
            requests_src: Arc::clone(&self.requests_src),
        })
    }
}

#[async_trait::async_trait]
impl PluginChannel for InProcessPluginChannel {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn send(&self, kind: &str, origin_event: Value, payload: Value) -> Result<(), ChannelError> {
        self.commands
            .send(BrokerCommand::Relay(Envelope::message(
                kind,
                origin_event,
                payload,
            )))
            .map_err(|_| ChannelError::Closed)
    }

    fn send_error(
        &self,
        kind: &str,
        origin_event: Value,
        error: &str,
    ) -> Result<(), ChannelError> {
        self.commands
            .send(BrokerCommand::Relay(Envelope::error(
                kind,
                origin_event,
                error,
            )))
            .map_err(|_| ChannelError::Closed)
    }

    async fn next_request(&mut self) -> Option<Value> {
        loop {
            match self.requests.recv().await {
                Ok(request) => return Some(request),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        plugin = %self.metadata.name,
                        skipped,
                        "plugin request subscriber lagged"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{Duration, timeout};

    fn lang_plugin(channel: &InProcessChannel, lang: &str) -> Box<dyn CloneablePluginChannel> {
        channel
            .create_plugin_channel(
                PluginMetadata::new(format!("{lang}-plugin")).with_file_types([lang]),
                Box::new(|| Ok(())),
            )
            .expect("register")
    }

    async fn recv_request(
        plugin: &mut Box<dyn CloneablePluginChannel>,
        ms: u64,
    ) -> Option<Value> {
        timeout(Duration::from_millis(ms), plugin.next_request())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn only_matching_plugins_receive_a_broadcast() {
        let channel = InProcessChannel::new();
        let mut a = lang_plugin(&channel, "x");
        let mut b = lang_plugin(&channel, "y");
        let host = channel.host();

        host.send(json!({"cmd": "ping"}), PluginFilter::for_file_type("x"))
            .expect("send");

        assert_eq!(recv_request(&mut a, 200).await, Some(json!({"cmd": "ping"})));
        assert_eq!(recv_request(&mut b, 50).await, None, "B must not see the request");
    }

    #[tokio::test]
    async fn activation_runs_once_and_only_on_demand() {
        let channel = InProcessChannel::new();
        let activations = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&activations);
        let mut a = channel
            .create_plugin_channel(
                PluginMetadata::new("lazy").with_file_types(["x"]),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .expect("register");

        // Registration alone must not activate.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(activations.load(Ordering::SeqCst), 0);

        // A non-matching broadcast must not activate either.
        let host = channel.host();
        host.send(json!(1), PluginFilter::for_file_type("y")).expect("send");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(activations.load(Ordering::SeqCst), 0);

        // Three matching broadcasts: exactly one activation.
        for _ in 0..3 {
            host.send(json!(2), PluginFilter::for_file_type("x")).expect("send");
        }
        for _ in 0..3 {
            assert!(recv_request(&mut a, 200).await.is_some());
        }
        assert_eq!(activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delivery_is_never_reentrant() {
        // Default test runtime is current-thread: nothing else runs until we
        // await, so an observed delivery before the first await would mean
        // `send` delivered synchronously.
        let channel = InProcessChannel::new();
        let plugin = lang_plugin(&channel, "x");
        let host = channel.host();

        let seen = Arc::new(AtomicBool::new(false));
        let seen_task = Arc::clone(&seen);
        let mut consumer = plugin.clone();
        tokio::spawn(async move {
            if consumer.next_request().await.is_some() {
                seen_task.store(true, Ordering::SeqCst);
            }
        });

        host.send(json!("hello"), PluginFilter::for_file_type("x"))
            .expect("send");
        assert!(!seen.load(Ordering::SeqCst), "send must not deliver in-stack");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.load(Ordering::SeqCst), "delivery must happen on a later turn");
    }

    #[tokio::test]
    async fn responses_are_relayed_with_their_correlation_token() {
        let channel = InProcessChannel::new();
        let plugin = lang_plugin(&channel, "x");
        let mut host = channel.host();

        plugin
            .send_error("validate", json!("ctx123"), "bad input")
            .expect("send_error");

        let envelope = timeout(Duration::from_millis(200), host.next_response())
            .await
            .expect("timed out")
            .expect("stream closed");
        assert_eq!(envelope, Envelope::error("validate", json!("ctx123"), "bad input"));
    }

    #[tokio::test]
    async fn plugin_sends_are_not_reentrant_either() {
        let channel = InProcessChannel::new();
        let plugin = lang_plugin(&channel, "x");
        let host = channel.host();

        let seen = Arc::new(AtomicBool::new(false));
        let seen_task = Arc::clone(&seen);
        let mut responses = host.clone();
        tokio::spawn(async move {
            if responses.next_response().await.is_some() {
                seen_task.store(true, Ordering::SeqCst);
            }
        });

        plugin.send("m", json!(1), json!(2)).expect("send");
        assert!(!seen.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn two_responders_correlate_by_token_not_order() {
        use crate::test_util::{collect_responses, request, spawn_echo_plugin};

        let channel = InProcessChannel::new();
        let mut host = channel.host();

        for name in ["first", "second"] {
            let plugin = channel
                .create_plugin_channel(
                    PluginMetadata::new(name).with_file_types(["x"]),
                    Box::new(|| Ok(())),
                )
                .expect("register");
            spawn_echo_plugin(plugin, "answer");
        }

        host.send(request("ping", "req-7"), PluginFilter::for_file_type("x"))
            .expect("send");

        // Two envelopes in whichever order; each carries the request's token.
        let envelopes = collect_responses(&mut host, 2, Duration::from_millis(500)).await;
        assert_eq!(envelopes.len(), 2);
        for envelope in &envelopes {
            assert_eq!(envelope.kind, "answer");
            assert_eq!(envelope.origin_event(), &json!("req-7"));
        }
    }

    #[tokio::test]
    async fn failed_activation_aborts_the_step_but_not_the_broker() {
        let channel = InProcessChannel::new();

        let mut failing = channel
            .create_plugin_channel(
                PluginMetadata::new("broken").with_file_types(["x"]),
                Box::new(|| anyhow::bail!("refused to start")),
            )
            .expect("register");
        let mut later = lang_plugin(&channel, "x");
        let host = channel.host();

        host.send(json!("first"), PluginFilter::for_file_type("x"))
            .expect("send");
        // The step aborted at the failing entry: neither plugin got the request.
        assert_eq!(recv_request(&mut failing, 50).await, None);
        assert_eq!(recv_request(&mut later, 50).await, None);

        // The broker keeps serving. The broken plugin's activation is spent,
        // so the next matching broadcast reaches both.
        host.send(json!("second"), PluginFilter::for_file_type("x"))
            .expect("send");
        assert_eq!(recv_request(&mut failing, 200).await, Some(json!("second")));
        assert_eq!(recv_request(&mut later, 200).await, Some(json!("second")));
    }

    #[tokio::test]
    async fn every_host_clone_sees_every_response() {
        let channel = InProcessChannel::new();
        let plugin = lang_plugin(&channel, "x");
        let mut host_a = channel.host();
        let mut host_b = host_a.clone();

        plugin.send("m", json!("tok"), json!(42)).expect("send");

        for host in [&mut host_a, &mut host_b] {
            let envelope = timeout(Duration::from_millis(200), host.next_response())
                .await
                .expect("timed out")
                .expect("stream closed");
            assert_eq!(envelope.origin_event(), &json!("tok"));
        }
    }
}
