//! The extensions API of the sliding sync protocol.
//!
//! Extensions contribute a fragment to every request body under their name
//! and receive the equally named fragment of every response.

use std::sync::Mutex;

use serde_json::Value as JsonValue;

use crate::core::sliding::{ToDevice, ToDeviceConfig};

/// When an extension sees the response relative to list processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionPhase {
    /// Invoked after `RequestFinished`, before any room data is emitted.
    PreProcess,
    /// Invoked after `Complete`, before list events.
    PostProcess,
}

/// A named plug-in multiplexed over the sliding sync connection.
pub trait SyncExtension: Send + Sync {
    /// The name this extension contributes under. Must be unique per engine.
    fn name(&self) -> &'static str;

    /// Which side of list processing the response fragment is handled on.
    fn phase(&self) -> ExtensionPhase;

    /// The request fragment for the next request, if any.
    ///
    /// `is_initial` is true while the engine has no `pos`, i.e. on the first
    /// request of a connection.
    fn on_request(&self, is_initial: bool) -> Option<JsonValue>;

    /// Handle this extension's fragment of a response.
    ///
    /// Not invoked for responses that carry no fragment under the extension's
    /// name.
    fn on_response(&self, data: &JsonValue);
}

/// The to-device messages extension ([MSC3885]).
///
/// Tracks the server's `next_batch` token across responses so that each
/// request only asks for messages the client has not seen, and hands incoming
/// event batches to the host-provided handler.
///
/// [MSC3885]: https://github.com/matrix-org/matrix-spec-proposals/pull/3885
pub struct ToDeviceExtension {
    since: Mutex<Option<String>>,
    limit: Option<usize>,
    handler: Box<dyn Fn(&[JsonValue]) + Send + Sync>,
}

impl ToDeviceExtension {
    /// Creates a to-device extension delivering event batches to `handler`.
    pub fn new(handler: impl Fn(&[JsonValue]) + Send + Sync + 'static) -> Self {
        Self {
            since: Mutex::new(None),
            limit: None,
            handler: Box::new(handler),
        }
    }

    /// Caps the number of to-device messages per response.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

impl SyncExtension for ToDeviceExtension {
    fn name(&self) -> &'static str {
        "to_device"
    }

    fn phase(&self) -> ExtensionPhase {
        ExtensionPhase::PreProcess
    }

    fn on_request(&self, _is_initial: bool) -> Option<JsonValue> {
        let config = ToDeviceConfig {
            enabled: Some(true),
            limit: self.limit,
            since: self.since.lock().unwrap().clone(),
        };
        Some(serde_json::to_value(config).expect("to-device config serializes"))
    }

    fn on_response(&self, data: &JsonValue) {
        let to_device: ToDevice = match serde_json::from_value(data.clone()) {
            Ok(to_device) => to_device,
            Err(err) => {
                warn!(%err, "malformed to_device extension fragment");
                return;
            }
        };

        *self.since.lock().unwrap() = Some(to_device.next_batch);
        if !to_device.events.is_empty() {
            (self.handler)(&to_device.events);
        }
    }
}
