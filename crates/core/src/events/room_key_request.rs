//! Types for the [`m.room_key_request`] event.
//!
//! [`m.room_key_request`]: https://spec.matrix.org/latest/client-server-api/#mroom_key_request

use serde::{Deserialize, Serialize};

use crate::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId};

/// The encryption algorithm a session key is to be used with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2,

    /// Megolm version 1 using AES-256 and SHA-256.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2,
}

/// A request for a key, or a cancellation of a previous request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Request a key.
    Request,

    /// Cancel a previous key request.
    RequestCancellation,
}

/// Information about the requested key.
///
/// The `(room_id, session_id)` pair uniquely names a megolm session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedKeyInfo {
    /// The encryption algorithm the requested key in this event is to be used
    /// with.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the key is used.
    pub room_id: OwnedRoomId,

    /// The ID of the session that the key is for.
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// Creates a new `RequestedKeyInfo` for a megolm session.
    pub fn megolm(room_id: OwnedRoomId, session_id: impl Into<String>) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            session_id: session_id.into(),
        }
    }
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a new key request or a cancellation of a previous
    /// request.
    pub action: Action,

    /// ID of the device requesting the key.
    pub requesting_device_id: OwnedDeviceId,

    /// A random string uniquely identifying the request for the key.
    ///
    /// If the key is requested multiple times, it should be reused. It should
    /// also be reused in order to cancel a request.
    pub request_id: OwnedTransactionId,

    /// Information about the requested key.
    ///
    /// Required if `action` is `request`; absent on cancellations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
}

impl RoomKeyRequestContent {
    /// The to-device event type this content is sent as.
    pub const EVENT_TYPE: &'static str = "m.room_key_request";

    /// Creates a new request with the given body.
    pub fn request(
        body: RequestedKeyInfo,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: Action::Request,
            requesting_device_id,
            request_id,
            body: Some(body),
        }
    }

    /// Creates a cancellation of the request with the given ID.
    pub fn cancellation(
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: Action::RequestCancellation,
            requesting_device_id,
            request_id,
            body: None,
        }
    }
}
