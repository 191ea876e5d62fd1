//! Outgoing room-key request management.
//!
//! A durable four-state machine per megolm session, driven by a
//! timer-based background sender. All state lives in the
//! [`store::KeyRequestStore`]; after a crash the store alone is enough to
//! resume, and concurrent processes are reconciled through per-record
//! compare-and-set transitions.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::core::events::room_key_request::{RequestedKeyInfo, RoomKeyRequestContent};
use crate::core::to_device::Messages;
use crate::core::{DeviceId, OwnedDeviceId, RoomId, TransactionId, UserId};
use crate::http::Transport;
use crate::{ClientError, ClientResult};

pub mod store;

pub use store::{
    KeyRequestPatch, KeyRequestState, KeyRequestStateKind, KeyRequestStore,
    MemoryKeyRequestStore, OutgoingKeyRequest, Recipient,
};

/// How long the sender waits after being armed before it drains the queue,
/// batching bursts of queued requests into one run.
const SEND_KEY_REQUESTS_DELAY: Duration = Duration::from_millis(500);

/// The states the background sender is responsible for.
const PENDING_STATES: [KeyRequestStateKind; 3] = [
    KeyRequestStateKind::Unsent,
    KeyRequestStateKind::CancellationPending,
    KeyRequestStateKind::CancellationPendingAndWillResend,
];

/// Manages the lifecycle of outgoing `m.room_key_request` messages.
///
/// Cheap to clone; all clones share the same sender.
#[derive(Clone)]
pub struct KeyRequestManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KeyRequestStore>,
    transport: Arc<dyn Transport>,
    device_id: OwnedDeviceId,
    /// Whether a sender run is active; only one may run at a time.
    running: AtomicBool,
    /// Whether a sender run is scheduled or active; schedules coalesce.
    timer_armed: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl KeyRequestManager {
    /// Creates a manager sending as `device_id`. Call
    /// [`KeyRequestManager::start`] before expecting any traffic.
    pub fn new(
        store: Arc<dyn KeyRequestStore>,
        transport: Arc<dyn Transport>,
        device_id: OwnedDeviceId,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                device_id,
                running: AtomicBool::new(false),
                timer_armed: AtomicBool::new(false),
                stopped: AtomicBool::new(true),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Starts the background sender and drains whatever the store still
    /// holds from a previous run.
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::SeqCst);
        Inner::arm_timer(&self.inner);
    }

    /// Stops the background sender; queued records stay in the store.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    /// Arms the background sender unless it is already armed or running.
    ///
    /// Call this after queueing requests, typically once per incoming sync
    /// batch. A dispatch failure also parks the sender until the next call.
    pub fn send_queued(&self) {
        Inner::arm_timer(&self.inner);
    }

    /// Queues a request for the session named by `body`, or revives an
    /// existing request for the same session.
    ///
    /// With `resend` set, a request that was already sent is cancelled and
    /// sent again under a fresh transaction ID.
    #[tracing::instrument(skip(self, recipients), fields(room_id = %body.room_id, session_id = %body.session_id))]
    pub async fn queue(
        &self,
        body: RequestedKeyInfo,
        recipients: Vec<Recipient>,
        resend: bool,
    ) -> ClientResult<()> {
        loop {
            let existing = self
                .inner
                .store
                .get_by_fingerprint(&body.room_id, &body.session_id)
                .await?;

            let Some(existing) = existing else {
                let request = OutgoingKeyRequest {
                    request_id: TransactionId::new(),
                    body: body.clone(),
                    recipients: recipients.clone(),
                    request_txn_id: None,
                    state: KeyRequestState::Unsent,
                };
                let effective = self.inner.store.get_or_insert(request).await?;
                debug!(request_id = %effective.request_id, "queued outgoing room key request");
                return Ok(());
            };

            match existing.state.kind() {
                // Already heading for a (re)send.
                KeyRequestStateKind::Unsent
                | KeyRequestStateKind::CancellationPendingAndWillResend => return Ok(()),

                KeyRequestStateKind::CancellationPending => {
                    let state = if resend {
                        KeyRequestState::CancellationPendingAndWillResend {
                            cancellation_txn_id: TransactionId::new(),
                        }
                    } else {
                        // Rescind the pending cancellation; the original
                        // request stands and a future cancel gets a fresh
                        // transaction ID of its own.
                        KeyRequestState::Sent
                    };
                    if self
                        .inner
                        .store
                        .update_if_in_state(
                            &existing.request_id,
                            KeyRequestStateKind::CancellationPending,
                            KeyRequestPatch::state(state),
                        )
                        .await?
                        .is_none()
                    {
                        continue;
                    }
                    return Ok(());
                }

                KeyRequestStateKind::Sent => {
                    if !resend {
                        return Ok(());
                    }
                    let patch = KeyRequestPatch {
                        state: Some(KeyRequestState::CancellationPendingAndWillResend {
                            cancellation_txn_id: TransactionId::new(),
                        }),
                        // Fresh wire txn so recipients do not deduplicate the
                        // resent request against the original.
                        request_txn_id: Some(TransactionId::new()),
                    };
                    match self
                        .inner
                        .store
                        .update_if_in_state(&existing.request_id, KeyRequestStateKind::Sent, patch)
                        .await?
                    {
                        // A concurrent writer won; take it from the top.
                        None => continue,
                        Some(updated) => {
                            self.dispatch_cancellation_soon(updated);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Cancels any request for the session `(room_id, session_id)`.
    pub async fn cancel(&self, room_id: &RoomId, session_id: &str) -> ClientResult<()> {
        loop {
            let Some(existing) = self
                .inner
                .store
                .get_by_fingerprint(room_id, session_id)
                .await?
            else {
                return Ok(());
            };

            match existing.state.kind() {
                KeyRequestStateKind::Unsent => {
                    if !self
                        .inner
                        .store
                        .delete_if_in_state(&existing.request_id, KeyRequestStateKind::Unsent)
                        .await?
                    {
                        // The sender dispatched it in the meantime; re-read
                        // and cancel whatever state it is in now.
                        continue;
                    }
                    return Ok(());
                }
                KeyRequestStateKind::Sent => {
                    let state = KeyRequestState::CancellationPending {
                        cancellation_txn_id: TransactionId::new(),
                    };
                    match self
                        .inner
                        .store
                        .update_if_in_state(
                            &existing.request_id,
                            KeyRequestStateKind::Sent,
                            KeyRequestPatch::state(state),
                        )
                        .await?
                    {
                        // Another actor moved the record on; nothing to do.
                        None => return Ok(()),
                        Some(updated) => {
                            self.dispatch_cancellation_soon(updated);
                            return Ok(());
                        }
                    }
                }
                // A cancellation is already on its way out.
                KeyRequestStateKind::CancellationPending
                | KeyRequestStateKind::CancellationPendingAndWillResend => return Ok(()),
            }
        }
    }

    /// The requests in `Sent` state addressed to `(user_id, device_id)`.
    pub async fn get_sent_requests_for_target(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> ClientResult<Vec<OutgoingKeyRequest>> {
        self.inner
            .store
            .get_by_target(user_id, device_id, &[KeyRequestStateKind::Sent])
            .await
    }

    /// Cancels and re-queues every request in `Sent` state, e.g. after the
    /// device's cross-signing situation changed.
    pub async fn cancel_and_resend_all(&self) -> ClientResult<()> {
        for request in self
            .inner
            .store
            .get_all_by_state(KeyRequestStateKind::Sent)
            .await?
        {
            self.queue(request.body.clone(), request.recipients.clone(), true)
                .await?;
        }
        Ok(())
    }

    /// Fires off the cancellation for a freshly transitioned record without
    /// blocking the caller. On failure the record is left as-is for the
    /// timer-driven sender.
    fn dispatch_cancellation_soon(&self, request: OutgoingKeyRequest) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let (cancellation_txn_id, and_resend) = match &request.state {
                KeyRequestState::CancellationPending {
                    cancellation_txn_id,
                } => (cancellation_txn_id.clone(), false),
                KeyRequestState::CancellationPendingAndWillResend {
                    cancellation_txn_id,
                } => (cancellation_txn_id.clone(), true),
                _ => return,
            };

            if let Err(err) = inner.send_cancellation(&request, &cancellation_txn_id).await {
                debug!(
                    %err,
                    request_id = %request.request_id,
                    "immediate cancellation failed, leaving it to the sender"
                );
                return;
            }

            if and_resend {
                match inner
                    .store
                    .update_if_in_state(
                        &request.request_id,
                        KeyRequestStateKind::CancellationPendingAndWillResend,
                        KeyRequestPatch::state(KeyRequestState::Unsent),
                    )
                    .await
                {
                    // Get the fresh request out.
                    Ok(Some(_)) => Inner::arm_timer(&inner),
                    // The background sender got there first.
                    Ok(None) => {}
                    Err(err) => warn!(%err, "failed to mark key request for resend"),
                }
            } else if let Err(err) = inner
                .store
                .delete_if_in_state(
                    &request.request_id,
                    KeyRequestStateKind::CancellationPending,
                )
                .await
            {
                warn!(%err, "failed to delete cancelled key request");
            }
        });
    }
}

impl Inner {
    fn arm_timer(inner: &Arc<Inner>) {
        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if inner
            .timer_armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Already armed; the scheduled run picks everything up.
            return;
        }

        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let _armed = ClearOnDrop(&task_inner.timer_armed);
            tokio::time::sleep(SEND_KEY_REQUESTS_DELAY).await;
            if let Err(err) = Inner::send_outgoing_requests(&task_inner).await {
                warn!(%err, "sending outgoing key requests failed, waiting for the next trigger");
            }
        });
        *inner.timer.lock().unwrap() = Some(handle);
    }

    /// Drains the store of pending records, one durable transition per
    /// dispatch. Only one run may be active at a time.
    async fn send_outgoing_requests(inner: &Arc<Inner>) -> ClientResult<()> {
        if inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ClientError::SenderAlreadyRunning);
        }
        let _running = ClearOnDrop(&inner.running);

        loop {
            if inner.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            let Some(request) = inner.store.get_by_state(&PENDING_STATES).await? else {
                debug!("no more outgoing room key requests");
                return Ok(());
            };

            match request.state.clone() {
                KeyRequestState::Unsent => {
                    inner.send_request(&request).await?;
                    inner
                        .store
                        .update_if_in_state(
                            &request.request_id,
                            KeyRequestStateKind::Unsent,
                            KeyRequestPatch::state(KeyRequestState::Sent),
                        )
                        .await?;
                }
                KeyRequestState::CancellationPending {
                    cancellation_txn_id,
                } => {
                    inner.send_cancellation(&request, &cancellation_txn_id).await?;
                    inner
                        .store
                        .delete_if_in_state(
                            &request.request_id,
                            KeyRequestStateKind::CancellationPending,
                        )
                        .await?;
                }
                KeyRequestState::CancellationPendingAndWillResend {
                    cancellation_txn_id,
                } => {
                    inner.send_cancellation(&request, &cancellation_txn_id).await?;
                    inner
                        .store
                        .update_if_in_state(
                            &request.request_id,
                            KeyRequestStateKind::CancellationPendingAndWillResend,
                            KeyRequestPatch::state(KeyRequestState::Unsent),
                        )
                        .await?;
                }
                KeyRequestState::Sent => {
                    warn!(
                        request_id = %request.request_id,
                        "store returned a non-pending request, stopping this run"
                    );
                    return Ok(());
                }
            }
        }
    }

    async fn send_request(&self, request: &OutgoingKeyRequest) -> ClientResult<()> {
        let content = RoomKeyRequestContent::request(
            request.body.clone(),
            self.device_id.clone(),
            request.request_id.clone(),
        );
        self.send_to_recipients(request, &content, request.wire_txn_id())
            .await
    }

    async fn send_cancellation(
        &self,
        request: &OutgoingKeyRequest,
        cancellation_txn_id: &TransactionId,
    ) -> ClientResult<()> {
        let content =
            RoomKeyRequestContent::cancellation(self.device_id.clone(), request.request_id.clone());
        self.send_to_recipients(request, &content, cancellation_txn_id)
            .await
    }

    async fn send_to_recipients(
        &self,
        request: &OutgoingKeyRequest,
        content: &RoomKeyRequestContent,
        txn_id: &TransactionId,
    ) -> ClientResult<()> {
        let payload = serde_json::to_value(content)?;
        let mut messages = Messages::new();
        for recipient in &request.recipients {
            messages
                .entry(recipient.user_id.clone())
                .or_default()
                .insert(recipient.device_id.clone().into(), payload.clone());
        }

        debug!(
            request_id = %request.request_id,
            action = ?content.action,
            %txn_id,
            "sending m.room_key_request"
        );
        self.transport
            .send_to_device(RoomKeyRequestContent::EVENT_TYPE, &messages, txn_id)
            .await
    }
}

/// Clears a flag even when the owning task is aborted mid-await.
struct ClearOnDrop<'a>(&'a AtomicBool);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
