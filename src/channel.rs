//! The transport-agnostic channel contract.
//!
//! Three capability sets cooperate: a host-side channel that broadcasts
//! filtered requests and consumes the merged response stream, a plugin-side
//! channel that consumes matched requests and produces responses, and a
//! factory binding the two. An in-process broker implements all three in
//! [`crate::broker`]; IPC or websocket brokers would implement the same
//! traits with identical observable semantics.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::metadata::{PluginFilter, PluginMetadata};

/// One-shot startup logic for a plugin. The broker runs it lazily: not at
/// registration, but the first time a request matches the plugin, and at most
/// once overall. A returned error aborts the broadcast step that triggered it.
pub type ActivationFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Errors surfaced by channel endpoints.
#[derive(Error, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum ChannelError {
    /// The broker behind this endpoint is gone.
    #[error("channel is closed")]
    Closed,

    /// Something went wrong encoding or decoding JSON.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> ChannelError {
        ChannelError::Json(err.to_string())
    }
}

/// Host end of the channel.
#[async_trait]
pub trait HostChannel: Send + Sync {
    /// Queue `message` for delivery to every plugin whose metadata matches
    /// `filter`. Returns as soon as the request is queued; delivery happens
    /// strictly after the current unit of work completes, so no plugin
    /// handler ever runs inside this call.
    fn send(&self, message: Value, filter: PluginFilter) -> Result<(), ChannelError>;

    /// Wait for the next envelope relayed from **any** plugin.
    ///
    /// Arrival order is not related to request order or registry order when
    /// several plugins respond; correlate via [`Envelope::origin_event`].
    /// Returns `None` once the broker is gone.
    async fn next_response(&mut self) -> Option<Envelope>;
}

/// Plugin end of the channel.
#[async_trait]
pub trait PluginChannel: Send + Sync {
    fn metadata(&self) -> &PluginMetadata;

    /// Queue a response envelope for the host. `origin_event` is copied
    /// verbatim into `meta.originEvent`.
    fn send(&self, kind: &str, origin_event: Value, payload: Value) -> Result<(), ChannelError>;

    /// Queue an error envelope for the host. Relayed exactly like a success
    /// envelope; interpretation is the host subscriber's business.
    fn send_error(&self, kind: &str, origin_event: Value, error: &str)
    -> Result<(), ChannelError>;

    /// Wait for the next request whose filter matched this plugin's metadata.
    /// Returns `None` once the broker is gone.
    async fn next_request(&mut self) -> Option<Value>;
}

/// Binds the two ends together.
pub trait Channel: Send + Sync {
    /// The single host-side endpoint. Each call hands out an independent
    /// subscription to the merged response stream.
    fn host(&self) -> Box<dyn CloneableHostChannel>;

    /// Register a plugin and return its channel. `on_activate` is **not**
    /// invoked here; see [`ActivationFn`].
    fn create_plugin_channel(
        &self,
        metadata: PluginMetadata,
        on_activate: ActivationFn,
    ) -> Result<Box<dyn CloneablePluginChannel>, ChannelError>;
}

pub trait CloneableHostChannel: HostChannel {
    fn clone_box(&self) -> Box<dyn CloneableHostChannel>;
}

impl<T> CloneableHostChannel for T
where
    T: HostChannel + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn CloneableHostChannel> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn CloneableHostChannel> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

pub trait CloneablePluginChannel: PluginChannel {
    fn clone_box(&self) -> Box<dyn CloneablePluginChannel>;
}

impl<T> CloneablePluginChannel for T
where
    T: PluginChannel + Clone + 'static,
{
    fn clone_box(&self) -> Box<dyn CloneablePluginChannel> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn CloneablePluginChannel> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

#[async_trait]
impl HostChannel for Box<dyn CloneableHostChannel> {
    fn send(&self, message: Value, filter: PluginFilter) -> Result<(), ChannelError> {
        (**self).send(message, filter)
    }

    async fn next_response(&mut self) -> Option<Envelope> {
        (**self).next_response().await
    }
}

#[async_trait]
impl PluginChannel for Box<dyn CloneablePluginChannel> {
    fn metadata(&self) -> &PluginMetadata {
        (**self).metadata()
    }

    fn send(&self, kind: &str, origin_event: Value, payload: Value) -> Result<(), ChannelError> {
        (**self).send(kind, origin_event, payload)
    }

    fn send_error(
        &self,
        kind: &str,
        origin_event: Value,
        error: &str,
    ) -> Result<(), ChannelError> {
        (**self).send_error(kind, origin_event, error)
    }

    async fn next_request(&mut self) -> Option<Value> {
        (**self).next_request().await
    }
}
