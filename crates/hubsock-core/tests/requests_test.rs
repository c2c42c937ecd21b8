#![allow(clippy::unwrap_used)]

// Integration tests for request-style calls: timeouts, memoization,
// admin gating, listing fallbacks and multi-step admin operations.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use hubsock_api::{DeploymentMode, Emitted, LoopbackPeer, loopback};
use hubsock_core::{
    Connection, ConnectionCallbacks, ConnectionConfig, ConnectionError, ConnectionState,
    FileData, IoObject,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn client(config: ConnectionConfig) -> (Connection, LoopbackPeer) {
    let (transport, peer, events) = loopback::pair();
    let conn = Connection::new(
        config,
        Arc::new(transport),
        events,
        ConnectionCallbacks::new(),
    );
    (conn, peer)
}

async fn expect(peer: &mut LoopbackPeer, name: &str) -> Emitted {
    let emitted = peer.recv().await.unwrap();
    assert_eq!(emitted.name, name, "unexpected emit with args {:?}", emitted.args);
    emitted
}

async fn connect_ready(conn: &Connection, peer: &mut LoopbackPeer) {
    let mut state = conn.watch_state();
    peer.connect(true);
    expect(peer, "authenticate")
        .await
        .reply(vec![json!(true), json!(true)]);
    expect(peer, "getObject").await.reply(vec![
        Value::Null,
        json!({ "_id": "system.config", "type": "config", "common": {}, "native": {} }),
    ]);
    state
        .wait_for(|s| *s == ConnectionState::Ready)
        .await
        .unwrap();
}

async fn ready_client() -> (Connection, LoopbackPeer) {
    let (conn, mut peer) = client(ConnectionConfig::default());
    connect_ready(&conn, &mut peer).await;
    (conn, peer)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_host_command_times_out_without_affecting_others() {
    let (conn, mut peer) = ready_client().await;

    let slow = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_host_info("slow", false, None).await }
    });
    let fast = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_host_info("fast", false, None).await }
    });

    let first = expect(&mut peer, "sendToHost").await;
    let second = expect(&mut peer, "sendToHost").await;
    let (slow_req, fast_req) = if first.args[0] == "system.host.slow" {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(fast_req.args[1], "getHostInfo");
    fast_req.reply(vec![json!({ "Platform": "linux" })]);

    assert_eq!(fast.await.unwrap().unwrap(), json!({ "Platform": "linux" }));
    assert_eq!(
        slow.await.unwrap(),
        Err(ConnectionError::Timeout {
            operation: "getHostInfo".into(),
            timeout_ms: 5000
        })
    );
    // The late answer has nobody left to receive it.
    assert!(!slow_req.reply(vec![json!({ "Platform": "linux" })]));
}

#[tokio::test]
async fn test_host_replies_are_classified() {
    let (conn, mut peer) = ready_client().await;

    let denied = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_installed("main", false, None).await }
    });
    let request = expect(&mut peer, "sendToHost").await;
    assert_eq!(
        request.args,
        vec![json!("system.host.main"), json!("getInstalled"), Value::Null]
    );
    request.reply(vec![json!("permissionError")]);
    assert_eq!(
        denied.await.unwrap(),
        Err(ConnectionError::Denied {
            operation: "getInstalled".into()
        })
    );

    let empty = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_installed("main", false, None).await }
    });
    expect(&mut peer, "sendToHost").await.reply(vec![Value::Null]);
    assert_eq!(
        empty.await.unwrap().unwrap_err().to_string(),
        "Cannot read \"getInstalled\""
    );
}

#[tokio::test]
async fn test_lost_request_reports_not_connected() {
    let (conn, mut peer) = ready_client().await;

    let read = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_state("a.0.b").await }
    });
    drop(expect(&mut peer, "getState").await);
    assert_eq!(read.await.unwrap(), Err(ConnectionError::NotConnected));
}

#[tokio::test]
async fn test_memoized_requests_share_one_round_trip() {
    let (conn, mut peer) = ready_client().await;

    let calls: Vec<_> = (0..2)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.get_compact_adapters(false).await })
        })
        .collect();

    expect(&mut peer, "getCompactAdapters")
        .await
        .reply(vec![Value::Null, json!({ "admin": { "v": "7.0.0" } })]);
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap()["admin"]["v"], "7.0.0");
    }
    assert!(peer.try_recv().is_none());

    // Cached until reset.
    conn.get_compact_adapters(false).await.unwrap();
    assert!(peer.try_recv().is_none());

    conn.reset_adapters_cache(None);
    let again = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_adapters(false).await }
    });
    expect(&mut peer, "getCompactAdapters")
        .await
        .reply(vec![Value::Null, json!({})]);
    assert_eq!(again.await.unwrap().unwrap(), json!({}));
}

#[tokio::test]
async fn test_abandoned_memoized_request_does_not_keep_client_alive() {
    let (conn, mut peer) = ready_client().await;

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_adapters(false).await }
    });
    let request = expect(&mut peer, "getCompactAdapters").await;
    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());

    drop(conn);
    for _ in 0..10 {
        if peer.is_closed() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(peer.is_closed(), "dropping the last handle closes the transport");
    assert!(!request.reply(vec![Value::Null, json!({})]));
}

#[tokio::test]
async fn test_failed_memoized_request_is_retried() {
    let (conn, mut peer) = ready_client().await;

    let first = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_hosts(false).await }
    });
    expect(&mut peer, "getCompactHosts")
        .await
        .reply(vec![json!("busy")]);
    assert!(first.await.unwrap().is_err());

    let second = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_compact_hosts(false).await }
    });
    expect(&mut peer, "getCompactHosts")
        .await
        .reply(vec![Value::Null, json!([{ "_id": "system.host.main" }])]);
    assert!(second.await.unwrap().unwrap().is_array());
}

#[tokio::test]
async fn test_admin_calls_are_refused_in_web_mode() {
    let config = ConnectionConfig {
        mode: DeploymentMode::Web,
        ..ConnectionConfig::default()
    };
    let (conn, mut peer) = client(config);

    assert_eq!(
        conn.get_hosts(false).await,
        Err(ConnectionError::NotAllowed {
            operation: "getHosts".into()
        })
    );
    assert!(matches!(
        conn.chmod_file("vis.0", "main/a.json", json!({ "mode": 420 })).await,
        Err(ConnectionError::NotAllowed { .. })
    ));
    assert!(matches!(
        conn.encrypt("secret").await,
        Err(ConnectionError::NotAllowed { .. })
    ));
    assert!(peer.drain().is_empty());
}

#[tokio::test]
async fn test_web_mode_reads_states_through_get_states() {
    let config = ConnectionConfig {
        mode: DeploymentMode::Web,
        ..ConnectionConfig::default()
    };
    let (conn, mut peer) = client(config);
    connect_ready(&conn, &mut peer).await;

    let read = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_foreign_states(Some("vis.0.*")).await }
    });
    let request = expect(&mut peer, "getStates").await;
    assert_eq!(request.args, vec![json!("vis.0.*")]);
    request.reply(vec![
        Value::Null,
        json!({ "vis.0.control": { "val": "ok", "ack": true }, "vis.0.gone": null }),
    ]);
    let states = read.await.unwrap().unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states["vis.0.control"].val, "ok");
}

#[tokio::test(start_paused = true)]
async fn test_instance_listing_falls_back_to_object_view() {
    let (conn, mut peer) = ready_client().await;

    let listing = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_adapter_instances(Some("hm-rpc"), false).await }
    });

    // Never answered, like servers without the dedicated command.
    let _unanswered = expect(&mut peer, "getAdapterInstances").await;
    let view = expect(&mut peer, "getObjectView").await;
    assert_eq!(
        view.args,
        vec![
            json!("system"),
            json!("instance"),
            json!({ "startkey": "system.adapter.hm-rpc.", "endkey": "system.adapter.hm-rpc.\u{9999}" }),
        ]
    );
    view.reply(vec![
        Value::Null,
        json!({ "rows": [{
            "id": "system.adapter.hm-rpc.0",
            "value": { "_id": "system.adapter.hm-rpc.0", "type": "instance", "common": { "noConfig": true } }
        }] }),
    ]);

    let instances = listing.await.unwrap().unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].id, "system.adapter.hm-rpc.0");
    assert_eq!(instances[0].common["adminUI"]["config"], "none");
}

#[tokio::test]
async fn test_rename_group_moves_sub_groups_first() {
    let (conn, mut peer) = ready_client().await;

    let rename = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.rename_group("system.group.staff", "system.group.team", Some(json!("Team")))
                .await
        }
    });

    expect(&mut peer, "getObjectView").await.reply(vec![
        Value::Null,
        json!({ "rows": [
            { "id": "system.group.staff", "value": { "_id": "system.group.staff", "type": "group", "common": { "name": "Staff" } } },
            { "id": "system.group.staff.ops", "value": { "_id": "system.group.staff.ops", "type": "group", "common": { "name": "Ops" } } },
            { "id": "system.group.guests", "value": { "_id": "system.group.guests", "type": "group", "common": {} } }
        ] }),
    ]);

    let set_sub = expect(&mut peer, "setObject").await;
    assert_eq!(set_sub.args[0], "system.group.team.ops");
    assert_eq!(set_sub.args[1]["_id"], "system.group.team.ops");
    set_sub.reply(vec![Value::Null]);

    let del_sub = expect(&mut peer, "delObject").await;
    assert_eq!(del_sub.args[0], "system.group.staff.ops");
    del_sub.reply(vec![Value::Null]);

    let set_main = expect(&mut peer, "setObject").await;
    assert_eq!(set_main.args[0], "system.group.team");
    assert_eq!(set_main.args[1]["common"]["name"], "Team");
    set_main.reply(vec![Value::Null]);

    let del_main = expect(&mut peer, "delObject").await;
    assert_eq!(del_main.args[0], "system.group.staff");
    del_main.reply(vec![Value::Null]);

    rename.await.unwrap().unwrap();
    assert!(peer.try_recv().is_none());
}

#[tokio::test]
async fn test_set_object_strips_server_fields() {
    let (conn, mut peer) = ready_client().await;

    let mut obj: IoObject = serde_json::from_value(json!({
        "_id": "javascript.0.script",
        "type": "state",
        "common": { "name": "script" },
        "native": {},
        "from": "system.adapter.admin.0",
        "user": "system.user.admin",
        "ts": 1_700_000_000_000_i64,
        "acl": { "owner": "system.user.admin" }
    }))
    .unwrap();
    obj.common["name"] = json!("renamed");

    let write = tokio::spawn({
        let conn = conn.clone();
        async move { conn.set_object("javascript.0.script", &obj).await }
    });
    let request = expect(&mut peer, "setObject").await;
    let sent = request.args[1].as_object().unwrap();
    assert!(!sent.contains_key("from"));
    assert!(!sent.contains_key("user"));
    assert!(!sent.contains_key("ts"));
    assert_eq!(sent["acl"]["owner"], "system.user.admin");
    assert_eq!(sent["common"]["name"], "renamed");
    request.reply(vec![Value::Null]);
    write.await.unwrap().unwrap();

    assert_eq!(
        conn.extend_object("javascript.0.script", Value::Null).await,
        Err(ConnectionError::InvalidArgument {
            message: "Null object is not allowed".into()
        })
    );
}

#[tokio::test]
async fn test_binary_files_travel_as_base64() {
    let (conn, mut peer) = ready_client().await;

    let write = tokio::spawn({
        let conn = conn.clone();
        async move {
            conn.write_file64("vis.0", "img/a.bin", &FileData::Binary(vec![0, 159, 146, 150]))
                .await
        }
    });
    let request = expect(&mut peer, "writeFile64").await;
    assert_eq!(
        request.args,
        vec![json!("vis.0"), json!("img/a.bin"), json!("AJ+Slg==")]
    );
    request.reply(vec![Value::Null]);
    write.await.unwrap().unwrap();

    let read = tokio::spawn({
        let conn = conn.clone();
        async move { conn.read_file("vis.0", "img/a.bin", true).await }
    });
    expect(&mut peer, "readFile64").await.reply(vec![
        Value::Null,
        json!({ "file": "AJ+Slg==", "mimeType": "application/octet-stream" }),
    ]);
    let content = read.await.unwrap().unwrap();
    assert_eq!(content.data.as_bytes(), &[0, 159, 146, 150]);
    assert_eq!(content.mime_type.as_deref(), Some("application/octet-stream"));
}

#[tokio::test]
async fn test_host_by_ip_lists_ipv4_before_ipv6() {
    let (conn, mut peer) = ready_client().await;

    let lookup = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_host_by_ip("system.host.main", false).await }
    });
    let request = expect(&mut peer, "getHostByIp").await;
    assert_eq!(request.args, vec![json!("main")]);
    request.reply(vec![
        json!("main"),
        json!({ "native": { "hardware": { "networkInterfaces": {
            "eth0": [
                { "family": "IPv6", "address": "fe80::1" },
                { "family": "IPv4", "address": "192.168.1.10" }
            ]
        } } } }),
    ]);

    let addresses: Vec<String> = lookup
        .await
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|entry| entry.address)
        .collect();
    assert_eq!(addresses, ["0.0.0.0", "192.168.1.10", "::", "fe80::1"]);
}

#[tokio::test]
async fn test_base_settings_require_feature() {
    let (conn, mut peer) = ready_client().await;

    let read = tokio::spawn({
        let conn = conn.clone();
        async move { conn.read_base_settings("system.host.main").await }
    });
    let probe = expect(&mut peer, "checkFeatureSupported").await;
    assert_eq!(probe.args, vec![json!("CONTROLLER_READWRITE_BASE_SETTINGS")]);
    probe.reply(vec![Value::Null, json!(false)]);

    assert_eq!(
        read.await.unwrap(),
        Err(ConnectionError::NotSupported {
            feature: "CONTROLLER_READWRITE_BASE_SETTINGS".into()
        })
    );
}

#[tokio::test]
async fn test_old_version_reply_shape_is_accepted() {
    let (conn, mut peer) = ready_client().await;

    let version = tokio::spawn({
        let conn = conn.clone();
        async move { conn.get_version(false).await }
    });
    expect(&mut peer, "getVersion")
        .await
        .reply(vec![json!("3.6.2")]);
    let info = version.await.unwrap().unwrap();
    assert_eq!(info.version, "3.6.2");
    assert_eq!(info.server_name, "socketio");
}
