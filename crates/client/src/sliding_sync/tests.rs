use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, to_value as to_json_value};
use tokio::sync::{Mutex, mpsc};
use url::Url;

use super::{LifecycleState, SlidingSync, SyncObserver, ToDeviceExtension};
use crate::core::sliding::{
    ReqList, SyncRequest, SyncRequestArgs, SyncResponse, SyncRoom,
};
use crate::core::{OwnedRoomId, RoomId};
use crate::core::to_device::Messages;
use crate::core::TransactionId;
use crate::http::Transport;
use crate::{ClientError, ClientResult};

/// A transport fed from the test: every dispatched request is pushed onto a
/// channel, and the response is whatever the test scripted next. With nothing
/// scripted the call parks forever, like a long poll with a silent server.
struct ScriptedTransport {
    requests: mpsc::UnboundedSender<(SyncRequestArgs, SyncRequest)>,
    responses: Mutex<mpsc::UnboundedReceiver<ClientResult<SyncResponse>>>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn sliding_sync(
        &self,
        _proxy_base_url: &Url,
        args: &SyncRequestArgs,
        body: &SyncRequest,
    ) -> ClientResult<SyncResponse> {
        self.requests.send((args.clone(), body.clone())).ok();
        match self.responses.lock().await.recv().await {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn send_to_device(
        &self,
        _event_type: &str,
        _messages: &Messages,
        _txn_id: &TransactionId,
    ) -> ClientResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    RoomData(String),
    Lifecycle(LifecycleState, bool),
    List(usize, u64, Vec<(u64, String)>),
}

#[derive(Default)]
struct Recorder {
    events: StdMutex<Vec<Event>>,
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl SyncObserver for Recorder {
    fn on_room_data(&self, room_id: &RoomId, _room: &SyncRoom) {
        self.events
            .lock()
            .unwrap()
            .push(Event::RoomData(room_id.to_string()));
    }

    fn on_lifecycle(
        &self,
        state: LifecycleState,
        _response: Option<&SyncResponse>,
        error: Option<&ClientError>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Lifecycle(state, error.is_some()));
    }

    fn on_list(
        &self,
        list_index: usize,
        joined_count: u64,
        index_to_room_id: &BTreeMap<u64, OwnedRoomId>,
    ) {
        let mapping = index_to_room_id
            .iter()
            .map(|(index, room_id)| (*index, room_id.to_string()))
            .collect();
        self.events
            .lock()
            .unwrap()
            .push(Event::List(list_index, joined_count, mapping));
    }
}

struct Harness {
    sync: SlidingSync,
    requests: mpsc::UnboundedReceiver<(SyncRequestArgs, SyncRequest)>,
    responses: mpsc::UnboundedSender<ClientResult<SyncResponse>>,
    recorder: Arc<Recorder>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            requests: req_tx,
            responses: Mutex::new(resp_rx),
        });

        let sync = SlidingSync::builder(
            Url::parse("https://proxy.example.org").unwrap(),
            transport,
        )
        .timeout(Duration::from_secs(30))
        .build();

        let recorder = Arc::new(Recorder::default());
        sync.observe(recorder.clone());

        Self {
            sync,
            requests: req_rx,
            responses: resp_tx,
            recorder,
        }
    }

    fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let sync = self.sync.clone();
        tokio::spawn(async move { sync.start().await })
    }

    async fn next_request(&mut self) -> (SyncRequestArgs, SyncRequest) {
        tokio::time::timeout(Duration::from_secs(30), self.requests.recv())
            .await
            .expect("engine stopped dispatching requests")
            .expect("transport dropped")
    }

    fn respond(&self, response: serde_json::Value) {
        let response: SyncResponse = serde_json::from_value(response).unwrap();
        self.responses.send(Ok(response)).unwrap();
    }
}

fn room_set(ids: &[&str]) -> BTreeSet<OwnedRoomId> {
    ids.iter().map(|id| OwnedRoomId::from(*id)).collect()
}

#[tokio::test]
async fn sync_then_gap_shift_scenario() {
    let mut harness = Harness::new();
    harness.sync.add_or_replace_list(
        0,
        ReqList {
            ranges: vec![(0, 3)],
            ..Default::default()
        },
    );
    let task = harness.spawn();

    let (args, _body) = harness.next_request().await;
    assert_eq!(args.pos, None);

    harness.respond(json!({
        "pos": "p1",
        "counts": [4],
        "ops": [{ "op": "SYNC", "list": 0, "range": [0, 3], "rooms": [
            { "room_id": "A" }, { "room_id": "B" }, { "room_id": "C" }, { "room_id": "D" },
        ]}],
    }));
    let (args, _body) = harness.next_request().await;
    assert_eq!(args.pos.as_deref(), Some("p1"));

    let data = harness.sync.get_list_data(0).unwrap();
    assert_eq!(data.joined_count, 4);
    assert_eq!(data.index_to_room_id.len(), 4);

    let events = harness.recorder.take();
    assert_eq!(
        events,
        vec![
            Event::Lifecycle(LifecycleState::RequestFinished, false),
            Event::RoomData("A".to_owned()),
            Event::RoomData("B".to_owned()),
            Event::RoomData("C".to_owned()),
            Event::RoomData("D".to_owned()),
            Event::Lifecycle(LifecycleState::Complete, false),
            Event::List(
                0,
                4,
                vec![
                    (0, "A".to_owned()),
                    (1, "B".to_owned()),
                    (2, "C".to_owned()),
                    (3, "D".to_owned()),
                ]
            ),
        ]
    );

    harness.respond(json!({
        "pos": "p2",
        "ops": [
            { "op": "DELETE", "list": 0, "index": 3 },
            { "op": "INSERT", "list": 0, "index": 0, "room": { "room_id": "E" } },
        ],
    }));
    harness.next_request().await;

    let data = harness.sync.get_list_data(0).unwrap();
    let mapping: Vec<(u64, String)> = data
        .index_to_room_id
        .iter()
        .map(|(index, room_id)| (*index, room_id.to_string()))
        .collect();
    assert_eq!(
        mapping,
        vec![
            (0, "E".to_owned()),
            (1, "A".to_owned()),
            (2, "B".to_owned()),
            (3, "C".to_owned()),
        ]
    );

    let events = harness.recorder.take();
    assert_eq!(
        events,
        vec![
            Event::Lifecycle(LifecycleState::RequestFinished, false),
            Event::RoomData("E".to_owned()),
            Event::Lifecycle(LifecycleState::Complete, false),
            Event::List(0, 4, mapping),
        ]
    );

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn sticky_parameters_are_elided_once_dispatched() {
    let mut harness = Harness::new();
    harness.sync.add_or_replace_list(
        0,
        ReqList {
            ranges: vec![(0, 9)],
            filters: Some(json!({ "is_dm": true })),
            sort: Some(vec!["by_recency".to_owned()]),
            ..Default::default()
        },
    );
    let task = harness.spawn();

    let (_args, body) = harness.next_request().await;
    assert_eq!(
        to_json_value(&body.lists[0]).unwrap(),
        json!({
            "ranges": [[0, 9]],
            "filters": { "is_dm": true },
            "sort": ["by_recency"],
        })
    );

    harness.respond(json!({ "pos": "p1" }));

    // The follow-up poll elides everything sticky.
    let (args, body) = harness.next_request().await;
    assert_eq!(args.pos.as_deref(), Some("p1"));
    assert_eq!(
        to_json_value(&body.lists[0]).unwrap(),
        json!({ "ranges": [[0, 9]] })
    );

    // A ranges-only change interrupts but stays elided.
    harness.sync.set_list_ranges(0, vec![(0, 19)]);
    let (args, body) = harness.next_request().await;
    assert_eq!(args.pos.as_deref(), Some("p1"));
    assert_eq!(
        to_json_value(&body.lists[0]).unwrap(),
        json!({ "ranges": [[0, 19]] })
    );

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn room_subscription_churn() {
    let mut harness = Harness::new();
    let task = harness.spawn();

    harness.next_request().await;
    harness.respond(json!({ "pos": "p1" }));
    harness.next_request().await;

    harness
        .sync
        .modify_room_subscriptions(room_set(&["!a:x", "!b:x"]));
    let (_args, body) = harness.next_request().await;
    let subscribed: Vec<&str> = body.room_subscriptions.keys().map(|r| r.as_str()).collect();
    assert_eq!(subscribed, vec!["!a:x", "!b:x"]);
    assert!(body.unsubscribe_rooms.is_empty());

    harness.respond(json!({ "pos": "p2" }));
    let (_args, body) = harness.next_request().await;
    assert!(body.room_subscriptions.is_empty());

    harness
        .sync
        .modify_room_subscriptions(room_set(&["!b:x", "!c:x"]));
    let (_args, body) = harness.next_request().await;
    let subscribed: Vec<&str> = body.room_subscriptions.keys().map(|r| r.as_str()).collect();
    assert_eq!(subscribed, vec!["!c:x"]);
    let unsubscribed: Vec<&str> = body.unsubscribe_rooms.iter().map(|r| r.as_str()).collect();
    assert_eq!(unsubscribed, vec!["!a:x"]);

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn new_subscription_info_resubscribes_everything() {
    let mut harness = Harness::new();
    let task = harness.spawn();

    harness.next_request().await;
    harness
        .sync
        .modify_room_subscriptions(room_set(&["!a:x", "!b:x"]));
    harness.next_request().await;
    harness.respond(json!({ "pos": "p1" }));
    let (_args, body) = harness.next_request().await;
    assert!(body.room_subscriptions.is_empty());

    harness
        .sync
        .modify_room_subscription_info(crate::core::sliding::RoomSubscription {
            timeline_limit: Some(50),
            ..Default::default()
        });
    let (_args, body) = harness.next_request().await;
    let subscribed: Vec<&str> = body.room_subscriptions.keys().map(|r| r.as_str()).collect();
    assert_eq!(subscribed, vec!["!a:x", "!b:x"]);
    assert_eq!(
        body.room_subscriptions.values().next().unwrap().timeline_limit,
        Some(50)
    );

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn mid_flight_list_replacement_drops_list_ops() {
    let mut harness = Harness::new();
    harness.sync.add_or_replace_list(
        0,
        ReqList {
            ranges: vec![(0, 3)],
            filters: Some(json!({ "is_dm": true })),
            ..Default::default()
        },
    );
    let task = harness.spawn();

    harness.next_request().await;

    // Deliver the response and replace the list before yielding to the
    // engine: the response races the abort and must still be surfaced, minus
    // its index mutations.
    harness.respond(json!({
        "pos": "p1",
        "counts": [4],
        "ops": [{ "op": "SYNC", "list": 0, "range": [0, 3], "rooms": [
            { "room_id": "A" }, { "room_id": "B" }, { "room_id": "C" }, { "room_id": "D" },
        ]}],
    }));
    harness.sync.add_or_replace_list(
        0,
        ReqList {
            ranges: vec![(0, 3)],
            filters: Some(json!({ "is_dm": false })),
            ..Default::default()
        },
    );

    let (args, body) = harness.next_request().await;
    // The next request carries the new sticky config in full.
    assert_eq!(args.pos.as_deref(), Some("p1"));
    assert_eq!(
        to_json_value(&body.lists[0]).unwrap(),
        json!({
            "ranges": [[0, 3]],
            "filters": { "is_dm": false },
        })
    );

    // Room data still fired, the mapping did not.
    let events = harness.recorder.take();
    assert_eq!(
        events,
        vec![
            Event::Lifecycle(LifecycleState::RequestFinished, false),
            Event::RoomData("A".to_owned()),
            Event::RoomData("B".to_owned()),
            Event::RoomData("C".to_owned()),
            Event::RoomData("D".to_owned()),
            Event::Lifecycle(LifecycleState::Complete, false),
        ]
    );
    assert!(harness.sync.get_list_data(0).unwrap().index_to_room_id.is_empty());

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn duplicate_extension_registration_is_rejected() {
    let harness = Harness::new();
    harness
        .sync
        .register_extension(Arc::new(ToDeviceExtension::new(|_| {})))
        .unwrap();

    let result = harness
        .sync
        .register_extension(Arc::new(ToDeviceExtension::new(|_| {})));
    assert!(matches!(result, Err(ClientError::DuplicateExtension(name)) if name == "to_device"));
}

#[tokio::test]
async fn to_device_extension_round_trip() {
    let mut harness = Harness::new();
    let seen = Arc::new(StdMutex::new(Vec::new()));
    let seen2 = seen.clone();
    harness
        .sync
        .register_extension(Arc::new(ToDeviceExtension::new(move |events| {
            seen2.lock().unwrap().extend(events.to_vec());
        })))
        .unwrap();
    let task = harness.spawn();

    let (_args, body) = harness.next_request().await;
    assert_eq!(body.extensions["to_device"], json!({ "enabled": true }));

    harness.respond(json!({
        "pos": "p1",
        "extensions": {
            "to_device": {
                "next_batch": "t1",
                "events": [{ "type": "m.room_key_request", "content": {} }],
            },
        },
    }));

    let (_args, body) = harness.next_request().await;
    assert_eq!(
        body.extensions["to_device"],
        json!({ "enabled": true, "since": "t1" })
    );
    assert_eq!(seen.lock().unwrap().len(), 1);

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_requests_back_off_before_retrying() {
    let mut harness = Harness::new();
    let task = harness.spawn();

    harness.next_request().await;
    let before = tokio::time::Instant::now();
    harness
        .responses
        .send(Err(ClientError::Status { status: 502 }))
        .unwrap();

    harness.next_request().await;
    assert!(tokio::time::Instant::now() - before >= Duration::from_secs(3));

    let events = harness.recorder.take();
    assert_eq!(
        events,
        vec![Event::Lifecycle(LifecycleState::RequestFinished, true)]
    );

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn resend_skips_the_error_backoff() {
    let mut harness = Harness::new();
    let task = harness.spawn();

    harness.next_request().await;
    // Mutating while the request is in flight sets needs_resend; the error
    // path then skips its pause entirely.
    harness.sync.add_or_replace_list(
        0,
        ReqList {
            ranges: vec![(0, 9)],
            ..Default::default()
        },
    );
    harness
        .responses
        .send(Err(ClientError::Status { status: 502 }))
        .unwrap();

    harness.next_request().await;

    harness.sync.stop();
    task.await.unwrap();
}

#[tokio::test]
async fn stop_ends_the_loop() {
    let mut harness = Harness::new();
    let task = harness.spawn();

    harness.next_request().await;
    harness.sync.stop();
    task.await.unwrap();
}
