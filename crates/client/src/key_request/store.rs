//! The durable store behind the key request manager.
//!
//! The store alone must be sufficient to resume after a crash; the manager
//! keeps no in-memory record state. Implementations must make
//! [`KeyRequestStore::update_if_in_state`] and
//! [`KeyRequestStore::delete_if_in_state`] strictly serializable per record,
//! since several processes may drive the same store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::events::room_key_request::RequestedKeyInfo;
use crate::core::{
    DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, RoomId, TransactionId, UserId,
};
use crate::ClientResult;

/// A `(user, device)` destination of a key request.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Recipient {
    /// The user to send to.
    pub user_id: OwnedUserId,

    /// The target device of that user.
    pub device_id: OwnedDeviceId,
}

impl Recipient {
    /// Creates a recipient for one device of a user.
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self { user_id, device_id }
    }
}

/// Where an outgoing key request is in its lifecycle.
///
/// The cancellation transaction ID lives in the variants that are about to
/// put a cancellation on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyRequestState {
    /// Queued but not yet sent.
    Unsent,

    /// Sent; nothing pending.
    Sent,

    /// A cancellation is waiting to go out, after which the record is
    /// deleted.
    CancellationPending {
        /// Transaction ID for the cancellation send.
        cancellation_txn_id: OwnedTransactionId,
    },

    /// A cancellation is waiting to go out, after which the request is
    /// queued again.
    CancellationPendingAndWillResend {
        /// Transaction ID for the cancellation send.
        cancellation_txn_id: OwnedTransactionId,
    },
}

impl KeyRequestState {
    /// The payload-free discriminant, for store queries and compare-and-set
    /// expectations.
    pub fn kind(&self) -> KeyRequestStateKind {
        match self {
            Self::Unsent => KeyRequestStateKind::Unsent,
            Self::Sent => KeyRequestStateKind::Sent,
            Self::CancellationPending { .. } => KeyRequestStateKind::CancellationPending,
            Self::CancellationPendingAndWillResend { .. } => {
                KeyRequestStateKind::CancellationPendingAndWillResend
            }
        }
    }
}

/// The discriminants of [`KeyRequestState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRequestStateKind {
    Unsent,
    Sent,
    CancellationPending,
    CancellationPendingAndWillResend,
}

/// A durable outgoing room-key request.
///
/// At most one record exists per `(room_id, session_id)` fingerprint.
/// `request_id` never changes over the life of a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    /// Unique identity of the request on the wire; reused by the matching
    /// cancellation.
    pub request_id: OwnedTransactionId,

    /// The session being asked for.
    pub body: RequestedKeyInfo,

    /// The devices the request is fanned out to.
    pub recipients: Vec<Recipient>,

    /// Transaction ID for the request send.
    ///
    /// Refreshed on a resend so that recipients do not deduplicate the new
    /// request against the original; falls back to `request_id` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_txn_id: Option<OwnedTransactionId>,

    /// Lifecycle state.
    pub state: KeyRequestState,
}

impl OutgoingKeyRequest {
    /// The transaction ID to use when putting the request on the wire.
    pub fn wire_txn_id(&self) -> &TransactionId {
        self.request_txn_id.as_deref().unwrap_or(&self.request_id)
    }
}

/// Field updates applied atomically by
/// [`KeyRequestStore::update_if_in_state`]. Unset fields keep their value.
#[derive(Clone, Debug, Default)]
pub struct KeyRequestPatch {
    /// Replaces the lifecycle state.
    pub state: Option<KeyRequestState>,

    /// Replaces the request transaction ID.
    pub request_txn_id: Option<OwnedTransactionId>,
}

impl KeyRequestPatch {
    /// A patch that only replaces the state.
    pub fn state(state: KeyRequestState) -> Self {
        Self {
            state: Some(state),
            request_txn_id: None,
        }
    }
}

/// Durable storage of outgoing key requests.
#[async_trait]
pub trait KeyRequestStore: Send + Sync {
    /// The record for the `(room_id, session_id)` fingerprint, if any.
    async fn get_by_fingerprint(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> ClientResult<Option<OutgoingKeyRequest>>;

    /// Inserts `request` unless a record with the same fingerprint already
    /// exists; returns the effective record either way.
    async fn get_or_insert(&self, request: OutgoingKeyRequest)
    -> ClientResult<OutgoingKeyRequest>;

    /// Atomically applies `patch` iff the record's state matches `expected`.
    ///
    /// Returns the updated record, or `None` when the expectation failed
    /// (another writer got there first) or no such record exists.
    async fn update_if_in_state(
        &self,
        request_id: &TransactionId,
        expected: KeyRequestStateKind,
        patch: KeyRequestPatch,
    ) -> ClientResult<Option<OutgoingKeyRequest>>;

    /// Deletes the record iff its state matches `expected`; whether a record
    /// was deleted.
    async fn delete_if_in_state(
        &self,
        request_id: &TransactionId,
        expected: KeyRequestStateKind,
    ) -> ClientResult<bool>;

    /// Any one record whose state is one of `states`, in the store's
    /// iteration order.
    async fn get_by_state(
        &self,
        states: &[KeyRequestStateKind],
    ) -> ClientResult<Option<OutgoingKeyRequest>>;

    /// All records in `state`.
    async fn get_all_by_state(
        &self,
        state: KeyRequestStateKind,
    ) -> ClientResult<Vec<OutgoingKeyRequest>>;

    /// All records targeting `(user_id, device_id)` whose state is one of
    /// `states`.
    async fn get_by_target(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        states: &[KeyRequestStateKind],
    ) -> ClientResult<Vec<OutgoingKeyRequest>>;
}

/// An in-memory [`KeyRequestStore`].
///
/// The test double, and a real store for deployments that accept losing
/// pending requests on restart.
#[derive(Debug, Default)]
pub struct MemoryKeyRequestStore {
    requests: Mutex<BTreeMap<OwnedTransactionId, OutgoingKeyRequest>>,
}

impl MemoryKeyRequestStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRequestStore for MemoryKeyRequestStore {
    async fn get_by_fingerprint(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> ClientResult<Option<OutgoingKeyRequest>> {
        let requests = self.requests.lock().unwrap();
        Ok(requests
            .values()
            .find(|request| {
                request.body.room_id.as_str() == room_id.as_str()
                    && request.body.session_id == session_id
            })
            .cloned())
    }

    async fn get_or_insert(
        &self,
        request: OutgoingKeyRequest,
    ) -> ClientResult<OutgoingKeyRequest> {
        let mut requests = self.requests.lock().unwrap();
        if let Some(existing) = requests.values().find(|existing| {
            existing.body.room_id == request.body.room_id
                && existing.body.session_id == request.body.session_id
        }) {
            return Ok(existing.clone());
        }
        requests.insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    async fn update_if_in_state(
        &self,
        request_id: &TransactionId,
        expected: KeyRequestStateKind,
        patch: KeyRequestPatch,
    ) -> ClientResult<Option<OutgoingKeyRequest>> {
        let mut requests = self.requests.lock().unwrap();
        let Some(request) = requests.get_mut(request_id) else {
            return Ok(None);
        };
        if request.state.kind() != expected {
            return Ok(None);
        }
        if let Some(state) = patch.state {
            request.state = state;
        }
        if let Some(request_txn_id) = patch.request_txn_id {
            request.request_txn_id = Some(request_txn_id);
        }
        Ok(Some(request.clone()))
    }

    async fn delete_if_in_state(
        &self,
        request_id: &TransactionId,
        expected: KeyRequestStateKind,
    ) -> ClientResult<bool> {
        let mut requests = self.requests.lock().unwrap();
        let Some(request) = requests.get(request_id) else {
            return Ok(false);
        };
        if request.state.kind() != expected {
            return Ok(false);
        }
        requests.remove(request_id);
        Ok(true)
    }

    async fn get_by_state(
        &self,
        states: &[KeyRequestStateKind],
    ) -> ClientResult<Option<OutgoingKeyRequest>> {
        let requests = self.requests.lock().unwrap();
        Ok(requests
            .values()
            .find(|request| states.contains(&request.state.kind()))
            .cloned())
    }

    async fn get_all_by_state(
        &self,
        state: KeyRequestStateKind,
    ) -> ClientResult<Vec<OutgoingKeyRequest>> {
        let requests = self.requests.lock().unwrap();
        Ok(requests
            .values()
            .filter(|request| request.state.kind() == state)
            .cloned()
            .collect())
    }

    async fn get_by_target(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        states: &[KeyRequestStateKind],
    ) -> ClientResult<Vec<OutgoingKeyRequest>> {
        let requests = self.requests.lock().unwrap();
        Ok(requests
            .values()
            .filter(|request| {
                states.contains(&request.state.kind())
                    && request.recipients.iter().any(|recipient| {
                        recipient.user_id.as_str() == user_id.as_str()
                            && recipient.device_id.as_str() == device_id.as_str()
                    })
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use super::{
        KeyRequestPatch, KeyRequestState, KeyRequestStateKind, KeyRequestStore,
        MemoryKeyRequestStore, OutgoingKeyRequest, Recipient,
    };
    use crate::core::TransactionId;
    use crate::core::events::room_key_request::RequestedKeyInfo;

    fn request(request_id: &str, room_id: &str, session_id: &str) -> OutgoingKeyRequest {
        OutgoingKeyRequest {
            request_id: request_id.into(),
            body: RequestedKeyInfo::megolm(room_id.into(), session_id),
            recipients: vec![Recipient::new("@x:example.org".into(), "D1".into())],
            request_txn_id: None,
            state: KeyRequestState::Unsent,
        }
    }

    #[tokio::test]
    async fn get_or_insert_is_idempotent_per_fingerprint() {
        let store = MemoryKeyRequestStore::new();

        let first = store
            .get_or_insert(request("req1", "!r:x", "S"))
            .await
            .unwrap();
        let second = store
            .get_or_insert(request("req2", "!r:x", "S"))
            .await
            .unwrap();

        assert_eq!(first.request_id, second.request_id);
        assert!(
            store
                .get_by_fingerprint("!r:x".into(), "S")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn compare_and_set_rejects_wrong_state() {
        let store = MemoryKeyRequestStore::new();
        store
            .get_or_insert(request("req1", "!r:x", "S"))
            .await
            .unwrap();

        let updated = store
            .update_if_in_state(
                <&TransactionId>::from("req1"),
                KeyRequestStateKind::Sent,
                KeyRequestPatch::state(KeyRequestState::Unsent),
            )
            .await
            .unwrap();
        assert!(updated.is_none());

        let updated = store
            .update_if_in_state(
                <&TransactionId>::from("req1"),
                KeyRequestStateKind::Unsent,
                KeyRequestPatch::state(KeyRequestState::Sent),
            )
            .await
            .unwrap();
        assert_matches!(updated, Some(request));
        assert_eq!(request.state, KeyRequestState::Sent);
    }

    #[tokio::test]
    async fn delete_requires_matching_state() {
        let store = MemoryKeyRequestStore::new();
        store
            .get_or_insert(request("req1", "!r:x", "S"))
            .await
            .unwrap();

        assert!(
            !store
                .delete_if_in_state(<&TransactionId>::from("req1"), KeyRequestStateKind::Sent)
                .await
                .unwrap()
        );
        assert!(
            store
                .delete_if_in_state(<&TransactionId>::from("req1"), KeyRequestStateKind::Unsent)
                .await
                .unwrap()
        );
        assert!(
            store
                .get_by_fingerprint("!r:x".into(), "S")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn get_by_target_filters_state_and_recipient() {
        let store = MemoryKeyRequestStore::new();
        store
            .get_or_insert(request("req1", "!r:x", "S1"))
            .await
            .unwrap();
        store
            .get_or_insert(request("req2", "!r:x", "S2"))
            .await
            .unwrap();
        store
            .update_if_in_state(
                <&TransactionId>::from("req2"),
                KeyRequestStateKind::Unsent,
                KeyRequestPatch::state(KeyRequestState::Sent),
            )
            .await
            .unwrap();

        let sent = store
            .get_by_target(
                "@x:example.org".into(),
                "D1".into(),
                &[KeyRequestStateKind::Sent],
            )
            .await
            .unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id.as_str(), "req2");

        let other_device = store
            .get_by_target(
                "@x:example.org".into(),
                "D2".into(),
                &[KeyRequestStateKind::Sent],
            )
            .await
            .unwrap();
        assert!(other_device.is_empty());
    }
}
