//! `POST /_matrix/client/unstable/org.matrix.msc3575/sync` ([MSC])
//!
//! Get all new events in a sliding window of rooms since the last sync or a
//! given point in time. These are the proxy-dialect types: lists are
//! positional and operations arrive as a flat, ordered `ops` array.
//!
//! [MSC]: https://github.com/matrix-org/matrix-doc/blob/kegan/sync-v3/proposals/3575-sync.md

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::serde::duration::opt_ms;
use crate::{OwnedRoomId, OwnedUserId};

/// Query parameters for the sliding sync endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncRequestArgs {
    /// A point in time to continue a sync from.
    ///
    /// Should be a token from the `pos` field of a previous response. Omitted
    /// on the very first request of a connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,

    /// The maximum time to poll before responding to this request.
    #[serde(with = "opt_ms", default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

/// Request body for the sliding sync endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    /// The list configurations of rooms we are interested in, positional.
    ///
    /// A list whose sticky parameters are unchanged since the last dispatched
    /// request is sent with `ranges` only; the server remembers the rest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lists: Vec<ReqList>,

    /// Specific rooms we want to receive events from, regardless of lists.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub room_subscriptions: BTreeMap<OwnedRoomId, RoomSubscription>,

    /// Specific rooms we no longer want to receive events from.
    #[serde(default, skip_serializing_if = "<[_]>::is_empty")]
    pub unsubscribe_rooms: Vec<OwnedRoomId>,

    /// Extensions API: each registered extension contributes under its name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, JsonValue>,
}

/// Sliding sync request for one list.
///
/// This doubles as the caller-facing list configuration: everything except
/// `ranges` is a sticky parameter.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReqList {
    /// The ranges of rooms we're interested in. Not sticky.
    pub ranges: Vec<(u64, u64)>,

    /// The sort ordering applied to this list of rooms. Sticky.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<String>>,

    /// Filters to apply to the list before sorting. Sticky, opaque to the
    /// engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<JsonValue>,

    /// Required state for each room returned, as event type and state key
    /// tuples. Sticky.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_state: Option<Vec<(String, String)>>,

    /// The maximum number of timeline events to return per room. Sticky.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_limit: Option<usize>,
}

impl ReqList {
    /// A copy of this list containing only the non-sticky parameters.
    pub fn ranges_only(&self) -> Self {
        Self {
            ranges: self.ranges.clone(),
            ..Default::default()
        }
    }
}

/// Configuration for a direct room subscription.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSubscription {
    /// Required state for each room returned, as event type and state key
    /// tuples.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_state: Vec<(String, String)>,

    /// The maximum number of timeline events to return per room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_limit: Option<usize>,
}

/// Response body for the sliding sync endpoint.
///
/// Every field may be absent; an empty object is a valid (if useless)
/// response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The token to supply in the `pos` param of the next request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<String>,

    /// Whether this response describes an initial sync.
    #[serde(default, skip_serializing_if = "crate::serde::is_default")]
    pub initial: bool,

    /// Operations to apply to the lists, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<SyncOp>,

    /// The total number of rooms matching each list's filter, positional.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub counts: Vec<u64>,

    /// Updates for directly subscribed rooms, keyed by room ID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub room_subscriptions: BTreeMap<OwnedRoomId, SyncRoom>,

    /// Extensions API: response fragments keyed by extension name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, JsonValue>,
}

/// Operation applied to a specific sliding window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlidingOp {
    /// Full reset of the given window.
    Sync,
    /// Insert an item at the given point, moving the entries between here and
    /// the last deletion by one.
    Insert,
    /// New data for a room already in the window; no index change.
    Update,
    /// Drop the entry at the given index.
    Delete,
    /// Mark the given window as invalidated.
    Invalidate,
    /// An operation this client does not understand; skipped with a warning.
    #[serde(other)]
    Unknown,
}

/// One entry of the response's `ops` array.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SyncOp {
    /// The operation to apply.
    #[serde(default)]
    pub op: SlidingOp,

    /// The list this operation applies to.
    pub list: usize,

    /// The specific index the operation applies to (INSERT, UPDATE, DELETE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,

    /// The inclusive range the operation applies to (SYNC, INVALIDATE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(u64, u64)>,

    /// The room payload for single-index operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<SyncRoom>,

    /// The room payloads for ranged operations, in window order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<SyncRoom>,
}

impl Default for SlidingOp {
    fn default() -> Self {
        SlidingOp::Unknown
    }
}

/// Data for one room, as attached to ops and room subscriptions.
///
/// Timeline and state events are carried as raw JSON; interpreting them is the
/// host application's concern.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SyncRoom {
    /// The room this payload belongs to.
    ///
    /// Present on op payloads; for `room_subscriptions` entries the map key
    /// carries the ID instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,

    /// The name of the room as calculated by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Was this an initial response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<bool>,

    /// This is a direct message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_dm: Option<bool>,

    /// The timeline of messages and state changes in the room.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timeline: Vec<JsonValue>,

    /// Updates to the state at the beginning of the `timeline`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_state: Vec<JsonValue>,

    /// The prev_batch allowing you to paginate through earlier messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,

    /// True if the number of events returned was limited by the timeline
    /// limit.
    #[serde(default, skip_serializing_if = "crate::serde::is_default")]
    pub limited: bool,

    /// The number of users with membership of `join`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_count: Option<u64>,

    /// The number of users with membership of `invite`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invited_count: Option<u64>,

    /// The number of unread notifications for this room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_count: Option<u64>,

    /// The number of unread highlighted notifications for this room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight_count: Option<u64>,
}

/// To-device messages extension configuration.
///
/// According to [MSC3885](https://github.com/matrix-org/matrix-spec-proposals/pull/3885).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceConfig {
    /// Activate or deactivate this extension. Sticky.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Max number of to-device messages per response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Give messages since this token only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<String>,
}

impl ToDeviceConfig {
    /// Whether all fields are empty or `None`.
    pub fn is_empty(&self) -> bool {
        self.enabled.is_none() && self.limit.is_none() && self.since.is_none()
    }
}

/// To-device messages extension response.
///
/// According to [MSC3885](https://github.com/matrix-org/matrix-spec-proposals/pull/3885).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ToDevice {
    /// Fetch the next batch from this entry.
    pub next_batch: String,

    /// The to-device events.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<JsonValue>,
}

/// E2ee extension response data.
///
/// According to [MSC3884](https://github.com/matrix-org/matrix-spec-proposals/pull/3884).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct E2ee {
    /// Users whose device lists changed or left since the last response.
    #[serde(default, skip_serializing_if = "DeviceLists::is_empty")]
    pub device_lists: DeviceLists,

    /// For each key algorithm, the number of unclaimed one-time keys currently
    /// held on the server for this device.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

impl E2ee {
    /// Whether all fields are empty or `None`.
    pub fn is_empty(&self) -> bool {
        self.device_lists.is_empty() && self.device_one_time_keys_count.is_empty()
    }
}

/// Information on E2ee device updates.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceLists {
    /// List of users who have updated their device identity keys or who now
    /// share an encrypted room with the client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<OwnedUserId>,

    /// List of users who no longer share encrypted rooms with the client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub left: Vec<OwnedUserId>,
}

impl DeviceLists {
    /// Whether there are no device list updates.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}
