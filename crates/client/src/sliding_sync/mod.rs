//! The sliding sync engine.
//!
//! A single cooperative long-poll loop against a sliding sync proxy. The
//! mutation API is synchronous and never awaits: callers toggle flags and
//! abort the in-flight request, and the loop reconciles at its next
//! iteration. Within one response, events reach observers in the order
//! `RequestFinished → RoomData* → Complete → List*`.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::sliding::{
    ReqList, RoomSubscription, SyncRequest, SyncRequestArgs, SyncResponse, SyncRoom,
};
use crate::core::{OwnedRoomId, RoomId};
use crate::http::Transport;
use crate::{ClientError, ClientResult};

pub mod extension;
mod list;
#[cfg(test)]
mod tests;

pub use extension::{ExtensionPhase, SyncExtension, ToDeviceExtension};

use extension::ExtensionPhase as Phase;
use list::ListState;

/// How long the proxy may hold a request open.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side slack on top of the server timeout before a request is
/// considered dead.
const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);

/// Flat pause between retries after a failed request.
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Where the loop is within one request/response cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// A request finished; on success no mutation has been applied yet.
    RequestFinished,
    /// All room data for the response was emitted and list mutations are
    /// applied.
    Complete,
}

/// Receives the engine's events.
///
/// Implementations must not block; panics are caught and logged without
/// interrupting the loop.
pub trait SyncObserver: Send + Sync {
    /// Data for one room arrived, once per appearance in a response.
    fn on_room_data(&self, _room_id: &RoomId, _room: &SyncRoom) {}

    /// The request lifecycle advanced.
    fn on_lifecycle(
        &self,
        _state: LifecycleState,
        _response: Option<&SyncResponse>,
        _error: Option<&ClientError>,
    ) {
    }

    /// A list's contents were affected by an op; fires at most once per list
    /// per response, after `Complete`.
    fn on_list(&self, _list_index: usize, _joined_count: u64, _index_to_room_id: &BTreeMap<u64, OwnedRoomId>) {
    }
}

/// A defensive copy of a list's server-derived data.
#[derive(Clone, Debug, Default)]
pub struct ListData {
    /// Total number of matching rooms reported by the server.
    pub joined_count: u64,

    /// Sparse mapping from window index to room ID.
    pub index_to_room_id: BTreeMap<u64, OwnedRoomId>,
}

/// Configures and builds a [`SlidingSync`].
pub struct SlidingSyncBuilder {
    proxy_base_url: Url,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl SlidingSyncBuilder {
    /// Sets the server-side long-poll timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builds the engine.
    pub fn build(self) -> SlidingSync {
        SlidingSync {
            inner: Arc::new(Inner {
                transport: self.transport,
                proxy_base_url: self.proxy_base_url,
                timeout: self.timeout,
                state: Mutex::new(EngineState::default()),
                terminated: AtomicBool::new(false),
                observers: Mutex::new(Vec::new()),
                extensions: Mutex::new(BTreeMap::new()),
            }),
        }
    }
}

/// The sliding sync engine. Cheap to clone; all clones share one loop state.
#[derive(Clone)]
pub struct SlidingSync {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    proxy_base_url: Url,
    timeout: Duration,
    state: Mutex<EngineState>,
    terminated: AtomicBool,
    observers: Mutex<Vec<Arc<dyn SyncObserver>>>,
    extensions: Mutex<BTreeMap<String, Arc<dyn SyncExtension>>>,
}

#[derive(Default)]
struct EngineState {
    lists: Vec<ListState>,
    desired_subscriptions: BTreeSet<OwnedRoomId>,
    confirmed_subscriptions: BTreeSet<OwnedRoomId>,
    subscription_info: RoomSubscription,
    pos: Option<String>,
    /// Bumped by every list replacement; used to detect that a response no
    /// longer matches the lists it was requested for.
    list_modified_count: u64,
    needs_resend: bool,
    abort: CancellationToken,
}

/// Everything captured at dispatch time that response handling needs.
struct PreparedRequest {
    args: SyncRequestArgs,
    body: SyncRequest,
    list_snapshot: u64,
    to_subscribe: BTreeSet<OwnedRoomId>,
    to_unsubscribe: BTreeSet<OwnedRoomId>,
    abort: CancellationToken,
    is_initial: bool,
}

impl SlidingSync {
    /// Starts building an engine for the proxy at `proxy_base_url`.
    pub fn builder(proxy_base_url: Url, transport: Arc<dyn Transport>) -> SlidingSyncBuilder {
        SlidingSyncBuilder {
            proxy_base_url,
            transport,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Subscribes `observer` to the engine's events.
    ///
    /// Observers live until [`SlidingSync::stop`] drops them.
    pub fn observe(&self, observer: Arc<dyn SyncObserver>) {
        self.inner.observers.lock().unwrap().push(observer);
    }

    /// Registers a named extension. Fails if the name is taken.
    pub fn register_extension(&self, extension: Arc<dyn SyncExtension>) -> ClientResult<()> {
        let mut extensions = self.inner.extensions.lock().unwrap();
        let name = extension.name();
        if extensions.contains_key(name) {
            return Err(ClientError::DuplicateExtension(name.to_owned()));
        }
        extensions.insert(name.to_owned(), extension);
        Ok(())
    }

    /// Replaces the list at `index`, or appends it if there is none.
    ///
    /// The new list starts from empty server data and is marked modified, so
    /// the next request carries its full sticky configuration.
    pub fn add_or_replace_list(&self, index: usize, config: ReqList) {
        let mut state = self.inner.state.lock().unwrap();
        if index < state.lists.len() {
            state.lists[index] = ListState::new(config);
        } else {
            state.lists.push(ListState::new(config));
        }
        state.list_modified_count += 1;
        state.needs_resend = true;
        state.abort.cancel();
    }

    /// Updates only the (non-sticky) ranges of the list at `index`.
    pub fn set_list_ranges(&self, index: usize, ranges: Vec<(u64, u64)>) {
        let mut state = self.inner.state.lock().unwrap();
        let Some(list) = state.lists.get_mut(index) else {
            warn!(index, "set_list_ranges for unknown list, ignoring");
            return;
        };
        list.config.ranges = ranges;
        state.needs_resend = true;
        state.abort.cancel();
    }

    /// The configuration of the list at `index`.
    pub fn get_list(&self, index: usize) -> Option<ReqList> {
        self.inner
            .state
            .lock()
            .unwrap()
            .lists
            .get(index)
            .map(|list| list.config.clone())
    }

    /// The server-derived data of the list at `index`.
    pub fn get_list_data(&self, index: usize) -> Option<ListData> {
        self.inner
            .state
            .lock()
            .unwrap()
            .lists
            .get(index)
            .map(|list| ListData {
                joined_count: list.joined_count,
                index_to_room_id: list.index_to_room_id.clone(),
            })
    }

    /// Replaces the set of rooms the caller wants direct subscriptions to.
    ///
    /// The next request subscribes to rooms not yet confirmed and
    /// unsubscribes from confirmed rooms no longer desired.
    pub fn modify_room_subscriptions(&self, rooms: BTreeSet<OwnedRoomId>) {
        let mut state = self.inner.state.lock().unwrap();
        state.desired_subscriptions = rooms;
        state.needs_resend = true;
        state.abort.cancel();
    }

    /// Replaces the subscription parameters and invalidates every confirmed
    /// subscription, forcing re-subscription of all desired rooms with the
    /// new parameters.
    pub fn modify_room_subscription_info(&self, info: RoomSubscription) {
        let mut state = self.inner.state.lock().unwrap();
        state.subscription_info = info;
        state.confirmed_subscriptions.clear();
        state.needs_resend = true;
        state.abort.cancel();
    }

    /// Aborts the in-flight request so the next one reflects current state.
    pub fn resend(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.needs_resend = true;
        state.abort.cancel();
    }

    /// Stops the loop, aborts the in-flight request and drops all observers.
    pub fn stop(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        self.inner.state.lock().unwrap().abort.cancel();
        self.inner.observers.lock().unwrap().clear();
    }

    /// Runs the sync loop until [`SlidingSync::stop`] is called.
    #[tracing::instrument(skip(self), fields(proxy = %self.inner.proxy_base_url))]
    pub async fn start(&self) {
        debug!("sliding sync loop starting");

        while !self.inner.terminated.load(Ordering::SeqCst) {
            let mut prepared = self.prepare_request();
            prepared.body.extensions = self.extension_fragments(prepared.is_initial);

            let client_timeout = self.inner.timeout + CLIENT_TIMEOUT_MARGIN;
            let send =
                self.inner
                    .transport
                    .sliding_sync(&self.inner.proxy_base_url, &prepared.args, &prepared.body);

            // Biased so that a response which raced the abort still wins; the
            // list-count snapshot sorts out what may be applied from it.
            let result = tokio::select! {
                biased;
                result = tokio::time::timeout(client_timeout, send) => match result {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Timeout),
                },
                () = prepared.abort.cancelled() => Err(ClientError::Aborted),
            };

            match result {
                Ok(response) => {
                    if self.inner.terminated.load(Ordering::SeqCst) {
                        break;
                    }
                    self.handle_response(response, &prepared);
                }
                Err(err) if err.is_aborted() => {
                    debug!("in-flight request aborted");
                }
                Err(err) => {
                    warn!(%err, status = ?err.http_status(), "sliding sync request failed");
                    self.emit_lifecycle(LifecycleState::RequestFinished, None, Some(&err));

                    let needs_resend = self.inner.state.lock().unwrap().needs_resend;
                    if !needs_resend && !self.inner.terminated.load(Ordering::SeqCst) {
                        tokio::select! {
                            () = prepared.abort.cancelled() => {}
                            () = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }

        debug!("sliding sync loop terminated");
        self.inner.observers.lock().unwrap().clear();
    }

    /// Builds the next request from current state and arms a fresh abort
    /// handle for it.
    fn prepare_request(&self) -> PreparedRequest {
        let mut state = self.inner.state.lock().unwrap();
        state.needs_resend = false;
        let abort = CancellationToken::new();
        state.abort = abort.clone();

        let lists = state
            .lists
            .iter()
            .map(|list| {
                if list.is_modified {
                    list.config.clone()
                } else {
                    list.config.ranges_only()
                }
            })
            .collect();

        let to_subscribe: BTreeSet<OwnedRoomId> = state
            .desired_subscriptions
            .difference(&state.confirmed_subscriptions)
            .cloned()
            .collect();
        let to_unsubscribe: BTreeSet<OwnedRoomId> = state
            .confirmed_subscriptions
            .difference(&state.desired_subscriptions)
            .cloned()
            .collect();

        let room_subscriptions = to_subscribe
            .iter()
            .map(|room_id| (room_id.clone(), state.subscription_info.clone()))
            .collect();

        PreparedRequest {
            args: SyncRequestArgs {
                pos: state.pos.clone(),
                timeout: Some(self.inner.timeout),
            },
            body: SyncRequest {
                lists,
                room_subscriptions,
                unsubscribe_rooms: to_unsubscribe.iter().cloned().collect(),
                extensions: BTreeMap::new(),
            },
            list_snapshot: state.list_modified_count,
            is_initial: state.pos.is_none(),
            to_subscribe,
            to_unsubscribe,
            abort,
        }
    }

    fn handle_response(&self, response: SyncResponse, prepared: &PreparedRequest) {
        let drop_list_ops = {
            let mut state = self.inner.state.lock().unwrap();

            if let Some(pos) = &response.pos {
                state.pos = Some(pos.clone());
            }
            for room_id in &prepared.to_unsubscribe {
                state.confirmed_subscriptions.remove(room_id);
            }
            for room_id in &prepared.to_subscribe {
                state.confirmed_subscriptions.insert(room_id.clone());
            }

            let drop_list_ops = state.list_modified_count != prepared.list_snapshot;
            if !drop_list_ops {
                // The dispatched request carried every modified list's full
                // sticky configuration, so the server is up to date now.
                for list in &mut state.lists {
                    list.is_modified = false;
                }
            }
            drop_list_ops
        };

        self.emit_lifecycle(LifecycleState::RequestFinished, Some(&response), None);
        self.invoke_extensions(Phase::PreProcess, &response);

        for (room_id, room) in &response.room_subscriptions {
            self.emit_room_data(room_id, room);
        }

        // Room payloads are collected under the lock and emitted after it is
        // released, so observers may call back into the engine.
        let mut room_payloads: Vec<(OwnedRoomId, SyncRoom)> = Vec::new();
        let mut list_updates: Vec<(usize, u64, BTreeMap<u64, OwnedRoomId>)> = Vec::new();

        if drop_list_ops {
            // The lists were replaced while this request was in flight, so the
            // engine no longer knows which list the ops were computed against.
            // The payloads are still surfaced; the index mutations are not.
            debug!("lists changed mid-flight, discarding list ops");
            for op in &response.ops {
                for room in op.room.iter().chain(op.rooms.iter()) {
                    if let Some(room_id) = &room.room_id {
                        room_payloads.push((room_id.clone(), room.clone()));
                    }
                }
            }
        } else {
            let mut state = self.inner.state.lock().unwrap();
            let affected = list::apply_ops(&mut state.lists, &response.ops, |room_id, room| {
                room_payloads.push((room_id.to_owned(), room.clone()));
            });

            for (index, count) in response.counts.iter().enumerate() {
                match state.lists.get_mut(index) {
                    Some(list) => list.joined_count = *count,
                    None => warn!(index, "count for unknown list, ignoring"),
                }
            }

            for index in affected {
                if let Some(list) = state.lists.get(index) {
                    list_updates.push((index, list.joined_count, list.index_to_room_id.clone()));
                }
            }
        }

        for (room_id, room) in &room_payloads {
            self.emit_room_data(room_id, room);
        }

        self.emit_lifecycle(LifecycleState::Complete, Some(&response), None);
        self.invoke_extensions(Phase::PostProcess, &response);

        for (index, joined_count, index_to_room_id) in &list_updates {
            self.emit_list(*index, *joined_count, index_to_room_id);
        }
    }

    fn extension_fragments(
        &self,
        is_initial: bool,
    ) -> BTreeMap<String, serde_json::Value> {
        self.inner
            .extensions
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(name, ext)| ext.on_request(is_initial).map(|value| (name.clone(), value)))
            .collect()
    }

    fn invoke_extensions(&self, phase: ExtensionPhase, response: &SyncResponse) {
        if response.extensions.is_empty() {
            return;
        }
        let extensions: Vec<Arc<dyn SyncExtension>> = self
            .inner
            .extensions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for ext in extensions {
            if ext.phase() != phase {
                continue;
            }
            if let Some(fragment) = response.extensions.get(ext.name()) {
                guard_listener(|| ext.on_response(fragment));
            }
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SyncObserver>> {
        self.inner.observers.lock().unwrap().clone()
    }

    fn emit_room_data(&self, room_id: &RoomId, room: &SyncRoom) {
        for observer in self.observers() {
            guard_listener(|| observer.on_room_data(room_id, room));
        }
    }

    fn emit_lifecycle(
        &self,
        state: LifecycleState,
        response: Option<&SyncResponse>,
        error: Option<&ClientError>,
    ) {
        for observer in self.observers() {
            guard_listener(|| observer.on_lifecycle(state, response, error));
        }
    }

    fn emit_list(&self, index: usize, joined_count: u64, mapping: &BTreeMap<u64, OwnedRoomId>) {
        for observer in self.observers() {
            guard_listener(|| observer.on_list(index, joined_count, mapping));
        }
    }
}

/// Listeners must not take the loop down with them.
fn guard_listener(f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("sync listener panicked");
    }
}
