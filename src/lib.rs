//! Communication channel between an editor host and its plugins.
//!
//! The channel contract is transport-agnostic: the same interfaces could be
//! implemented in-process, over IPC or over websockets. This crate ships the
//! contract plus the in-process broker.

pub mod broker;
pub mod channel;
pub mod envelope;
pub mod metadata;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_util;
