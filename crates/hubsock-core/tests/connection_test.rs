#![allow(clippy::unwrap_used)]

// Integration tests for the connection lifecycle and subscriptions, driven
// through the loopback transport.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use hubsock_api::{Emitted, LoopbackPeer, loopback};
use hubsock_core::{
    Connection, ConnectionCallbacks, ConnectionConfig, ConnectionError, ConnectionState,
    IoObject, ObjectHandler, ObjectIdentity, State, StateHandler,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn client(config: ConnectionConfig, callbacks: ConnectionCallbacks) -> (Connection, LoopbackPeer) {
    let (transport, peer, events) = loopback::pair();
    let conn = Connection::new(config, Arc::new(transport), events, callbacks);
    (conn, peer)
}

async fn expect(peer: &mut LoopbackPeer, name: &str) -> Emitted {
    let emitted = peer.recv().await.unwrap();
    assert_eq!(emitted.name, name, "unexpected emit with args {:?}", emitted.args);
    emitted
}

fn system_config() -> Value {
    json!({
        "_id": "system.config",
        "type": "config",
        "common": { "language": "de" },
        "native": {}
    })
}

/// Connect with a server that reports itself ready, authenticate and
/// answer the system config read.
async fn connect_ready(conn: &Connection, peer: &mut LoopbackPeer) {
    let mut state = conn.watch_state();
    peer.connect(true);
    expect(peer, "authenticate")
        .await
        .reply(vec![json!(true), json!(false)]);
    let read = expect(peer, "getObject").await;
    assert_eq!(read.args, vec![json!("system.config")]);
    read.reply(vec![Value::Null, system_config()]);
    state
        .wait_for(|s| *s == ConnectionState::Ready)
        .await
        .unwrap();
}

type StateEvent = (String, Option<Value>);

fn state_handler() -> (Arc<StateHandler>, mpsc::UnboundedReceiver<StateEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<StateHandler> = Arc::new(move |id: &str, state: Option<&State>| {
        let _ = tx.send((id.to_owned(), state.map(|s| s.val.clone())));
    });
    (handler, rx)
}

type ObjectEvent = (String, Option<IoObject>, Option<ObjectIdentity>);

fn object_handler() -> (Arc<ObjectHandler>, mpsc::UnboundedReceiver<ObjectEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<ObjectHandler> = Arc::new(
        move |id: &str, obj: Option<&IoObject>, previous: Option<&ObjectIdentity>| {
            let _ = tx.send((id.to_owned(), obj.cloned(), previous.cloned()));
        },
    );
    (handler, rx)
}

fn connection_channel(conn: &Connection) -> mpsc::UnboundedReceiver<bool> {
    let (tx, rx) = mpsc::unbounded_channel();
    conn.register_connection_handler(Arc::new(move |connected: bool| {
        let _ = tx.send(connected);
    }));
    rx
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_old_server_skips_authentication() {
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new().on_ready(move |objects| {
        let mut ids: Vec<String> = objects.keys().cloned().collect();
        ids.sort();
        let _ = ready_tx.send(ids);
    });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);

    peer.connect(false);
    expect(&mut peer, "getVersion")
        .await
        .reply(vec![Value::Null, json!("4.1.3"), json!("admin")]);
    expect(&mut peer, "getObject")
        .await
        .reply(vec![Value::Null, system_config()]);

    assert_eq!(ready_rx.recv().await.unwrap(), vec!["system.config".to_owned()]);
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.is_connected());
    assert!(!conn.is_secure());
    assert_eq!(conn.system_lang().as_deref(), Some("de"));

    let cached = conn.cached_objects().unwrap();
    assert_eq!(cached.len(), 1);
    assert!(peer.drain().iter().all(|e| e.name != "authenticate"));
}

#[tokio::test]
async fn test_progress_reports_each_stage_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new().on_progress(move |state| {
        let _ = tx.send(state);
    });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);
    connect_ready(&conn, &mut peer).await;

    assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
    assert_eq!(rx.recv().await.unwrap(), ConnectionState::Ready);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_state_announces_and_reads_back() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    let (handler, mut events) = state_handler();
    conn.subscribe_state(&["light.0.state"], handler);

    let announce = expect(&mut peer, "subscribe").await;
    assert_eq!(announce.args, vec![json!(["light.0.state"])]);
    assert!(!announce.wants_ack());

    let read = expect(&mut peer, "getForeignStates").await;
    assert_eq!(read.args, vec![json!("light.0.state")]);
    read.reply(vec![
        Value::Null,
        json!({ "light.0.state": { "val": true, "ack": true, "ts": 1 } }),
    ]);

    assert_eq!(
        events.recv().await.unwrap(),
        ("light.0.state".to_owned(), Some(json!(true)))
    );
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_repeated_subscribe_announces_pattern_once() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    let (first, _first_events) = state_handler();
    let (second, _second_events) = state_handler();

    conn.subscribe_state(&["a.0.x"], Arc::clone(&first));
    expect(&mut peer, "subscribe").await;
    drop(expect(&mut peer, "getForeignStates").await);

    // Same pattern, other handler: read back only.
    conn.subscribe_state(&["a.0.x"], Arc::clone(&second));
    drop(expect(&mut peer, "getForeignStates").await);

    // Same pattern, same handler: read back only, registered once.
    conn.subscribe_state(&["a.0.x"], Arc::clone(&first));
    drop(expect(&mut peer, "getForeignStates").await);

    conn.unsubscribe_state(&["a.0.x"], Some(&first));
    tokio::task::yield_now().await;
    assert!(peer.drain().is_empty());

    conn.unsubscribe_state(&["a.0.x"], Some(&second));
    let gone = expect(&mut peer, "unsubscribe").await;
    assert_eq!(gone.args, vec![json!(["a.0.x"])]);
}

#[tokio::test]
async fn test_state_push_reaches_matching_subscribers() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    let (handler, mut events) = state_handler();
    conn.subscribe_state(&["hm-rpc.0.*"], handler);
    expect(&mut peer, "subscribe").await;
    expect(&mut peer, "getForeignStates")
        .await
        .reply(vec![Value::Null, json!({})]);

    peer.push("stateChange", vec![json!("zigbee.0.lamp"), json!({ "val": 1 })]);
    peer.push("stateChange", vec![json!("hm-rpc.0.dimmer"), json!({ "val": 40 })]);
    peer.push("stateChange", vec![json!("hm-rpc.0.dimmer"), Value::Null]);

    assert_eq!(
        events.recv().await.unwrap(),
        ("hm-rpc.0.dimmer".to_owned(), Some(json!(40)))
    );
    assert_eq!(events.recv().await.unwrap(), ("hm-rpc.0.dimmer".to_owned(), None));
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions_once_per_cycle() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;
    let mut connected = connection_channel(&conn);

    let (states, _state_events) = state_handler();
    conn.subscribe_state(&["light.0.*"], states);
    expect(&mut peer, "subscribe").await;
    expect(&mut peer, "getForeignStates")
        .await
        .reply(vec![Value::Null, json!({})]);

    let (objects, _object_events) = object_handler();
    conn.subscribe_object(&["light.0.*"], objects);
    expect(&mut peer, "subscribeObjects").await;

    conn.subscribe_files("vis.0", &["main/*"], Arc::new(|_: &str, _: &str, _: Option<u64>| {}));
    expect(&mut peer, "subscribeFiles").await;

    peer.disconnect("transport close");
    assert!(!connected.recv().await.unwrap());
    assert_eq!(conn.state(), ConnectionState::Connecting);
    assert!(!conn.is_connected());

    peer.reconnect();
    assert!(connected.recv().await.unwrap());
    assert_eq!(conn.state(), ConnectionState::Ready);

    let replay: Vec<(String, Vec<Value>)> = peer
        .drain()
        .into_iter()
        .map(|e| (e.name.clone(), e.args.clone()))
        .collect();
    assert_eq!(
        replay,
        vec![
            ("subscribeObjects".to_owned(), vec![json!("light.0.*")]),
            ("subscribe".to_owned(), vec![json!("light.0.*")]),
            ("subscribeFiles".to_owned(), vec![json!("vis.0"), json!(["main/*"])]),
        ]
    );

    // A second reconnect within the same cycle does not replay again.
    peer.reconnect();
    assert!(connected.recv().await.unwrap());
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn test_subscriptions_made_offline_are_sent_on_connect() {
    let config = ConnectionConfig {
        auto_subscribes: vec!["system.adapter.*".into()],
        auto_subscribe_log: true,
        ..ConnectionConfig::default()
    };
    let (conn, mut peer) = client(config, ConnectionCallbacks::new());

    let (handler, _events) = state_handler();
    conn.subscribe_state(&["javascript.0.*"], handler);
    tokio::task::yield_now().await;
    assert!(peer.drain().is_empty());

    peer.connect(true);
    expect(&mut peer, "authenticate")
        .await
        .reply(vec![json!(true), json!(true)]);

    let names: Vec<String> = [
        expect(&mut peer, "subscribeObjects").await,
        expect(&mut peer, "requireLog").await,
        expect(&mut peer, "subscribe").await,
    ]
    .iter()
    .map(|e| e.name.clone())
    .collect();
    assert_eq!(names, ["subscribeObjects", "requireLog", "subscribe"]);
    expect(&mut peer, "getObject")
        .await
        .reply(vec![Value::Null, system_config()]);
    conn.wait_for_first_connection().await;
    assert!(conn.is_secure());
}

#[tokio::test]
async fn test_unchanged_object_push_is_suppressed() {
    let (tx, mut hook_events) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new().on_object_change(move |id, _| {
        let _ = tx.send(id.to_owned());
    });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);
    connect_ready(&conn, &mut peer).await;

    let (handler, mut events) = object_handler();
    conn.subscribe_object(&["system.*"], handler);
    expect(&mut peer, "subscribeObjects").await;

    // Identical to the cached copy.
    peer.push("objectChange", vec![json!("system.config"), system_config()]);

    let mut changed = system_config();
    changed["common"]["language"] = json!("en");
    peer.push("objectChange", vec![json!("system.config"), changed]);

    let (id, obj, previous) = events.recv().await.unwrap();
    assert_eq!(id, "system.config");
    assert_eq!(obj.unwrap().common["language"], "en");
    assert_eq!(previous.unwrap().object_type, "config");
    assert_eq!(hook_events.recv().await.unwrap(), "system.config");
    assert!(events.try_recv().is_err());

    peer.push("objectChange", vec![json!("system.config"), Value::Null]);
    let (_, obj, previous) = events.recv().await.unwrap();
    assert!(obj.is_none());
    assert_eq!(previous.unwrap().id, "system.config");
    assert!(!conn.cached_objects().unwrap().contains_key("system.config"));
}

#[tokio::test]
async fn test_deleting_unknown_object_is_suppressed() {
    let (tx, mut hook_events) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new().on_object_change(move |id, _| {
        let _ = tx.send(id.to_owned());
    });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);
    connect_ready(&conn, &mut peer).await;

    let (handler, mut events) = object_handler();
    conn.subscribe_object(&["light.*", "system.*"], handler);
    expect(&mut peer, "subscribeObjects").await;

    peer.push("objectChange", vec![json!("light.0.never"), Value::Null]);
    peer.push("objectChange", vec![json!("light.0.never"), Value::Null]);

    // A real deletion afterwards is the first thing delivered.
    peer.push("objectChange", vec![json!("system.config"), Value::Null]);
    let (id, obj, _) = events.recv().await.unwrap();
    assert_eq!(id, "system.config");
    assert!(obj.is_none());
    assert_eq!(hook_events.recv().await.unwrap(), "system.config");
    assert!(events.try_recv().is_err());
    assert!(hook_events.try_recv().is_err());
}

#[tokio::test]
async fn test_reconnect_revalidates_cached_reads() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;
    let mut connected = connection_channel(&conn);

    // Served from the cache filled during the handshake.
    assert!(conn.get_objects(false).await.unwrap().contains_key("system.config"));
    let compact = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_adapters(false).await }
    });
    expect(&mut peer, "getCompactAdapters")
        .await
        .reply(vec![Value::Null, json!({ "admin": {} })]);
    compact.await.unwrap().unwrap();
    assert!(peer.try_recv().is_none());

    peer.disconnect("transport close");
    assert!(!connected.recv().await.unwrap());
    peer.reconnect();
    assert!(connected.recv().await.unwrap());

    let fetch = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_objects(false).await }
    });
    expect(&mut peer, "getAllObjects").await.reply(vec![
        Value::Null,
        json!({
            "system.config": system_config(),
            "light.0.added": {
                "_id": "light.0.added",
                "type": "state",
                "common": {},
                "native": {}
            }
        }),
    ]);
    let objects = fetch.await.unwrap().unwrap();
    assert!(objects.contains_key("light.0.added"));

    // Fresh again until the next disconnect.
    conn.get_objects(false).await.unwrap();
    assert!(peer.try_recv().is_none());

    let compact = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_adapters(false).await }
    });
    expect(&mut peer, "getCompactAdapters")
        .await
        .reply(vec![Value::Null, json!({})]);
    assert_eq!(compact.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn test_simulated_state_never_reaches_transport() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    conn.set_state_to_ignore("sim.0.value");

    let (handler, mut events) = state_handler();
    conn.subscribe_state(&["sim.0.value"], handler);
    conn.set_state("sim.0.value", 5, None).await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        ("sim.0.value".to_owned(), Some(json!(5)))
    );
    let state = conn.get_state("sim.0.value").await.unwrap().unwrap();
    assert_eq!(state.val, json!(5));

    let obj = conn.get_object("sim.0.value").await.unwrap().unwrap();
    assert_eq!(obj.object_type, "state");

    conn.unsubscribe_state(&["sim.0.value"], None);
    tokio::task::yield_now().await;
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn test_requests_fail_fast_when_disconnected() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    assert_eq!(
        conn.get_state("a.0.b").await,
        Err(ConnectionError::NotConnected)
    );
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn test_instance_messages_are_routed_and_released() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    let (tx, mut messages) = mpsc::unbounded_channel();
    let handler: Arc<hubsock_core::InstanceMessageHandler> =
        Arc::new(move |data: &Value, source: &str, message_type: &str| {
            let _ = tx.send((data.clone(), source.to_owned(), message_type.to_owned()));
        });

    let subscribe = tokio::spawn({
        let conn = conn.clone();
        let handler = Arc::clone(&handler);
        async move {
            conn.subscribe_on_instance("admin.0", "newsFeed", json!({ "since": 0 }), handler)
                .await
        }
    });
    let request = expect(&mut peer, "clientSubscribe").await;
    assert_eq!(
        request.args,
        vec![json!("admin.0"), json!("newsFeed"), json!({ "since": 0 })]
    );
    request.reply(vec![Value::Null, json!({ "accepted": true })]);
    subscribe.await.unwrap().unwrap();

    peer.push("im", vec![json!("newsFeed"), json!("admin.0"), json!({ "n": 1 })]);
    assert_eq!(
        messages.recv().await.unwrap(),
        (
            json!({ "n": 1 }),
            "system.adapter.admin.0".to_owned(),
            "newsFeed".to_owned()
        )
    );

    let release = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.unsubscribe_from_instance("admin.0", Some("newsFeed"), None)
                .await
        }
    });
    let request = expect(&mut peer, "clientUnsubscribe").await;
    assert_eq!(
        request.args,
        vec![json!("system.adapter.admin.0"), json!("newsFeed")]
    );
    request.reply(vec![Value::Null, json!(true)]);
    assert!(release.await.unwrap().unwrap());
}

#[tokio::test]
async fn test_rejected_instance_subscription_is_not_stored() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    let subscribe = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.subscribe_on_instance(
                "admin.0",
                "newsFeed",
                Value::Null,
                Arc::new(|_: &Value, _: &str, _: &str| {}),
            )
            .await
        }
    });
    expect(&mut peer, "clientSubscribe")
        .await
        .reply(vec![Value::Null, json!({ "error": "unknown type" })]);
    assert_eq!(
        subscribe.await.unwrap(),
        Err(ConnectionError::Server {
            message: "unknown type".into()
        })
    );
    assert!(
        !conn
            .unsubscribe_from_instance("admin.0", None, None)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_pushes_reach_hooks_and_handlers() {
    let (tx, mut hooks) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new()
        .on_auth_required({
            let tx = tx.clone();
            move || {
                let _ = tx.send("auth".to_owned());
            }
        })
        .on_error({
            let tx = tx.clone();
            move |message| {
                let _ = tx.send(message.to_owned());
            }
        })
        .on_log(move |entry| {
            let _ = tx.send(format!("log {}", entry.message));
        });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);
    connect_ready(&conn, &mut peer).await;

    let (out_tx, mut output) = mpsc::unbounded_channel();
    conn.register_cmd_stdout_handler(Arc::new(move |id: &str, text: &str| {
        let _ = out_tx.send(format!("{id}: {text}"));
    }));

    peer.push(
        "log",
        vec![json!({ "from": "host.a", "message": "started", "severity": "info", "ts": 1 })],
    );
    peer.push("error", vec![json!("User not authorized")]);
    peer.push("error", vec![json!("disk full")]);
    peer.push(
        "permissionError",
        vec![json!({ "operation": "write", "type": "state", "id": "a.0.b" })],
    );
    peer.push("cmdStdout", vec![json!("cmd1"), json!("npm ok")]);

    assert_eq!(hooks.recv().await.unwrap(), "log started");
    assert_eq!(hooks.recv().await.unwrap(), "auth");
    assert_eq!(hooks.recv().await.unwrap(), "Socket Error: disk full");
    assert_eq!(
        hooks.recv().await.unwrap(),
        "no permission for write state on a.0.b"
    );
    assert_eq!(output.recv().await.unwrap(), "cmd1: npm ok");
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() {
    let (conn, mut peer) = client(ConnectionConfig::default(), ConnectionCallbacks::new());
    connect_ready(&conn, &mut peer).await;

    conn.subscribe_state(
        &["a.0.*"],
        Arc::new(|id: &str, _: Option<&State>| {
            assert!(id.is_empty(), "subscriber bug");
        }),
    );
    let (handler, mut events) = state_handler();
    conn.subscribe_state(&["a.0.*"], handler);

    peer.push("stateChange", vec![json!("a.0.x"), json!({ "val": "on" })]);
    assert_eq!(
        events.recv().await.unwrap(),
        ("a.0.x".to_owned(), Some(json!("on")))
    );
}

#[tokio::test]
async fn test_restart_pending_asks_for_reload_on_reconnect() {
    let (tx, mut restarts) = mpsc::unbounded_channel();
    let callbacks = ConnectionCallbacks::new().on_restart_required(move || {
        let _ = tx.send(());
    });
    let (conn, mut peer) = client(ConnectionConfig::default(), callbacks);
    connect_ready(&conn, &mut peer).await;

    conn.set_wait_for_restart();
    peer.disconnect("server restart");
    peer.reconnect();
    restarts.recv().await.unwrap();
}
