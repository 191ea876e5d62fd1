//! Common types for send-to-device messaging ([spec]).
//!
//! [spec]: https://spec.matrix.org/latest/client-server-api/#send-to-device-messaging

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, Unexpected},
};
use serde_json::Value as JsonValue;

use crate::{DeviceId, OwnedDeviceId, OwnedUserId};

/// One addressee slot of a to-device message map.
///
/// Each entry of a user's device map targets either a single device or, via
/// the `*` wildcard, every device the user owns.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageTarget {
    /// One specific device of the user.
    Device(OwnedDeviceId),

    /// All of the user's devices.
    AllDevices,
}

impl MessageTarget {
    /// The wire spelling of the all-devices wildcard.
    pub const WILDCARD: &'static str = "*";

    /// The wire representation of this target.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Device(device_id) => device_id.as_str(),
            Self::AllDevices => Self::WILDCARD,
        }
    }

    /// Whether this is the all-devices wildcard.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::AllDevices)
    }
}

impl fmt::Display for MessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<OwnedDeviceId> for MessageTarget {
    fn from(device_id: OwnedDeviceId) -> Self {
        Self::Device(device_id)
    }
}

impl From<&DeviceId> for MessageTarget {
    fn from(device_id: &DeviceId) -> Self {
        Self::Device(device_id.to_owned())
    }
}

impl FromStr for MessageTarget {
    type Err = InvalidMessageTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(InvalidMessageTarget),
            Self::WILDCARD => Ok(Self::AllDevices),
            device_id => Ok(Self::Device(device_id.into())),
        }
    }
}

/// A to-device target was empty.
#[derive(Clone, Copy, Debug)]
pub struct InvalidMessageTarget;

impl fmt::Display for InvalidMessageTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("to-device target must be a device ID or '*'")
    }
}

impl StdError for InvalidMessageTarget {}

impl Serialize for MessageTarget {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageTarget {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(|_| {
            de::Error::invalid_value(Unexpected::Str(&s), &"a device identifier or '*'")
        })
    }
}

/// Messages to send in a send-to-device request.
///
/// Represented as a map of `{ user-ids => { targets => message-content } }`.
/// Message contents are raw JSON; all events within one request must be of the
/// same type.
pub type Messages = BTreeMap<OwnedUserId, BTreeMap<MessageTarget, JsonValue>>;

/// Request body for `PUT /_matrix/client/*/sendToDevice/{eventType}/{txnId}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SendToDeviceReqBody {
    /// Messages to send.
    pub messages: Messages,
}
