use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rfarm_store::{
    ChannelMessage, PoolSettings, RedisStore, Registry, Store, StoreError, StoreOptions,
};
use rfarm_testkit::{init_tracing, unreachable_addr, FakeServer, Reply};
use tokio::sync::mpsc;
use tracing::Span;

fn options(addr: String, db: u32) -> StoreOptions {
    StoreOptions {
        pool: PoolSettings {
            max_idle: 2,
            max_total: 2,
            connect_timeout_ms: Some(1_000),
            response_timeout_ms: Some(1_000),
        },
        ..StoreOptions::new(addr, db)
    }
}

async fn connected_store(server: &FakeServer, db: u32) -> RedisStore {
    init_tracing();
    let store = RedisStore::with_options(options(server.addr(), db), &Span::none());
    store.connect().await.expect("connect");
    store
}

/// Replies with one confirmation and one message per subscribed channel.
fn echo_subscribe(args: &[String]) -> Option<Vec<Reply>> {
    if args[0] != "SUBSCRIBE" {
        return None;
    }
    let mut frames: Vec<Reply> = args[1..]
        .iter()
        .map(|channel| Reply::subscribed(channel, 1))
        .collect();
    for channel in &args[1..] {
        frames.push(Reply::message(channel, format!("payload for {}", channel)));
    }
    Some(frames)
}

#[tokio::test]
async fn connect_selects_db_on_pool_and_pubsub() {
    let server = FakeServer::spawn(|_| None).await;
    let store = connected_store(&server, 3).await;

    assert_eq!(server.connections(), 2);
    assert_eq!(
        server.commands_named("SELECT"),
        vec![vec!["SELECT", "3"], vec!["SELECT", "3"]]
    );
    assert_eq!(store.db(), 3);
    store.close();
}

#[tokio::test]
async fn publish_uses_prefixed_db_channel() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "PUBLISH" if args[1] == "CMND:3" => Some(vec![Reply::Integer(2)]),
        "PUBLISH" => Some(vec![Reply::Integer(0)]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 3).await;

    assert_eq!(store.default_channel(), "CMND:3");
    assert!(store.publish("intraday:code1").await?);
    assert!(!store.publish_ex("elsewhere", "ping").await?);
    assert_eq!(
        server.commands_named("PUBLISH"),
        vec![
            vec!["PUBLISH", "CMND:3", "intraday:code1"],
            vec!["PUBLISH", "elsewhere", "ping"],
        ]
    );
    Ok(())
}

#[tokio::test]
async fn custom_channel_prefix_is_used() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "PUBLISH" => Some(vec![Reply::Integer(1)]),
        _ => None,
    })
    .await;
    let store = RedisStore::with_options(
        StoreOptions {
            channel_prefix: "EVT".to_string(),
            ..options(server.addr(), 5)
        },
        &Span::none(),
    );
    store.connect().await?;

    store.publish("x").await?;
    assert_eq!(server.commands_named("PUBLISH"), vec![vec!["PUBLISH", "EVT:5", "x"]]);
    Ok(())
}

#[tokio::test]
async fn get_and_mget_report_absence_without_error() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "GET" if args[1] == "a" => Some(vec![Reply::bulk("1")]),
        "GET" => Some(vec![Reply::nil()]),
        "MGET" => Some(vec![Reply::Array(vec![
            Reply::bulk("1"),
            Reply::nil(),
            Reply::bulk("3"),
        ])]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    assert_eq!(store.get("a").await?, Some("1".to_string()));
    assert_eq!(store.get("b").await?, None);

    let values = store.mget(&["a", "b", "c"]).await?;
    assert_eq!(values, vec![Some("1".to_string()), None, Some("3".to_string())]);

    assert!(store.mget(&[]).await?.is_empty());
    assert_eq!(server.commands_named("MGET").len(), 1);
    Ok(())
}

#[tokio::test]
async fn hash_access() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "HGETALL" if args[1] == "H:quote" => Some(vec![Reply::list(["bid", "10.5", "ask", "10.7"])]),
        "HGETALL" => Some(vec![Reply::Array(Vec::new())]),
        "HGET" if args[2] == "bid" => Some(vec![Reply::bulk("10.5")]),
        "HGET" => Some(vec![Reply::nil()]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    let quote = store.get_object("H:quote").await?;
    let expected: HashMap<String, String> = [("bid", "10.5"), ("ask", "10.7")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(quote, expected);
    assert!(store.get_object("H:missing").await?.is_empty());

    assert_eq!(store.hget("H:quote", "bid").await?, "10.5");
    assert_eq!(store.hget("H:quote", "volume").await?, "");
    Ok(())
}

#[tokio::test]
async fn list_len_normalizes_key_names() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "LLEN" if args[1] == "L:foo" => Some(vec![Reply::Integer(4)]),
        "LLEN" => Some(vec![Reply::Integer(0)]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    assert_eq!(store.list_len("M:foo").await?, 4);
    assert_eq!(store.list_len("L:foo").await?, 4);
    assert_eq!(store.list_len("foo").await?, 4);
    assert_eq!(store.llen("M:foo").await?, 0);
    assert_eq!(
        server.commands_named("LLEN"),
        vec![
            vec!["LLEN", "L:foo"],
            vec!["LLEN", "L:foo"],
            vec!["LLEN", "L:foo"],
            vec!["LLEN", "M:foo"],
        ]
    );
    Ok(())
}

#[tokio::test]
async fn list_commands_pass_arguments_through() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "LPUSH" | "RPUSH" | "LREM" => Some(vec![Reply::Integer(1)]),
        "LRANGE" => Some(vec![Reply::list(["x", "y"])]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    store.lpush("L:q", "x").await?;
    store.rpush("L:q", "y").await?;
    store.lrem("L:q", "x", -1).await?;
    assert_eq!(store.list_range("L:q", 0, -1).await?, vec!["x", "y"]);

    let commands: Vec<Vec<String>> = server
        .commands()
        .into_iter()
        .filter(|args| args[0] != "SELECT")
        .collect();
    assert_eq!(
        commands,
        vec![
            vec!["LPUSH", "L:q", "x"],
            vec!["RPUSH", "L:q", "y"],
            vec!["LREM", "L:q", "-1", "x"],
            vec!["LRANGE", "L:q", "0", "-1"],
        ]
    );
    Ok(())
}

#[tokio::test]
async fn scan_follows_cursor_and_drops_duplicates() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match (args[0].as_str(), args[1].as_str()) {
        ("SCAN", "0") => Some(vec![Reply::Array(vec![Reply::bulk("9"), Reply::list(["L:a", "L:b"])])]),
        ("SCAN", "9") => Some(vec![Reply::Array(vec![Reply::bulk("0"), Reply::list(["L:b", "L:c"])])]),
        ("KEYS", _) => Some(vec![Reply::list(["L:a", "L:b", "L:c"])]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    assert_eq!(store.scan("L:*").await?, vec!["L:a", "L:b", "L:c"]);
    assert_eq!(
        server.commands_named("SCAN"),
        vec![vec!["SCAN", "0", "MATCH", "L:*"], vec!["SCAN", "9", "MATCH", "L:*"]]
    );

    let mut keys = store.keys("L:*").await?;
    keys.sort();
    assert_eq!(keys, vec!["L:a", "L:b", "L:c"]);
    Ok(())
}

#[tokio::test]
async fn exists_and_exec() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "EXISTS" => Some(vec![Reply::Integer(if args[1] == "here" { 1 } else { 0 })]),
        "EXPIRE" => Some(vec![Reply::Integer(1)]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    assert!(store.exists("here").await?);
    assert!(!store.exists("gone").await?);
    store.exec("EXPIRE", &["here", "60"]).await?;
    assert_eq!(server.commands_named("EXPIRE"), vec![vec!["EXPIRE", "here", "60"]]);
    Ok(())
}

#[tokio::test]
async fn transport_errors_name_command_and_key() {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "SET" => Some(vec![Reply::error("READONLY You can't write against a read only replica")]),
        _ => None,
    })
    .await;
    let store = connected_store(&server, 0).await;

    let err = store.set("S:price", "1").await.expect_err("read only");
    assert!(matches!(err, StoreError::Transport { .. }));
    let text = err.to_string();
    assert!(text.contains("SET"), "{}", text);
    assert!(text.contains("S:price"), "{}", text);
    assert!(text.contains("READONLY"), "{}", text);

    // Unknown commands fall through to the server's default error reply.
    let err = store.exec("FLUSHALL", &[]).await.expect_err("unknown");
    assert!(err.to_string().contains("FLUSHALL"));
}

#[tokio::test]
async fn lifecycle_guards() {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "GET" => Some(vec![Reply::nil()]),
        _ => None,
    })
    .await;
    let store = RedisStore::with_options(options(server.addr(), 1), &Span::none());

    assert!(matches!(store.get("k").await, Err(StoreError::NotConnected)));
    store.close();
    store.close();
    assert!(matches!(store.get("k").await, Err(StoreError::Closed)));
    assert!(matches!(store.connect().await, Err(StoreError::Closed)));

    let store = RedisStore::with_options(options(server.addr(), 1), &Span::none());
    store.connect().await.expect("connect");
    assert_eq!(store.get("k").await.expect("get"), None);
    store.close();
    assert!(matches!(store.get("k").await, Err(StoreError::Closed)));
    store.close();
}

#[tokio::test]
async fn unreachable_address_is_a_connection_error() {
    let addr = unreachable_addr().await;
    let store = RedisStore::with_options(options(addr.clone(), 2), &Span::none());

    let err = store.connect().await.expect_err("unreachable");
    match &err {
        StoreError::Connection { address, db, .. } => {
            assert_eq!(address, &addr);
            assert_eq!(*db, 2);
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    store.close();
}

#[tokio::test]
async fn partial_connect_keeps_pool_and_close_is_safe() -> anyhow::Result<()> {
    let selects = Arc::new(AtomicUsize::new(0));
    let counter = selects.clone();
    let server = FakeServer::spawn(move |args| match args[0].as_str() {
        // The pool dials first; the pub/sub connection is the second SELECT.
        "SELECT" if counter.fetch_add(1, Ordering::SeqCst) == 1 => {
            Some(vec![Reply::error("ERR max clients reached")])
        }
        "GET" => Some(vec![Reply::bulk("v")]),
        _ => None,
    })
    .await;
    let store = RedisStore::with_options(options(server.addr(), 0), &Span::none());

    let err = store.connect().await.expect_err("pubsub rejected");
    assert!(matches!(err, StoreError::Connection { .. }));
    assert_eq!(store.get("k").await?, Some("v".to_string()));

    let (dst, _rx) = mpsc::channel(1);
    assert!(matches!(
        store.subscribe("t", dst, &["CMND:0"]).await,
        Err(StoreError::NotConnected)
    ));

    // A second connect only dials what is missing.
    store.connect().await?;
    assert_eq!(selects.load(Ordering::SeqCst), 3);

    store.close();
    Ok(())
}

#[tokio::test]
async fn subscriptions_carry_their_tag_and_the_store_db() -> anyhow::Result<()> {
    let server = FakeServer::spawn(echo_subscribe).await;
    let store = connected_store(&server, 3).await;
    let (dst, mut rx) = mpsc::channel::<ChannelMessage>(16);

    store.subscribe("commands", dst.clone(), &["CMND:3"]).await?;
    store.subscribe("alerts", dst, &["ALERT:a", "ALERT:b"]).await?;

    let mut received = Vec::new();
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("message");
        received.push(msg);
    }
    received.sort_by(|a, b| a.message.channel.cmp(&b.message.channel));

    let summary: Vec<(&str, u32, &str)> = received
        .iter()
        .map(|msg| (msg.tag.as_str(), msg.db, msg.message.channel.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("alerts", 3, "ALERT:a"),
            ("alerts", 3, "ALERT:b"),
            ("commands", 3, "CMND:3"),
        ]
    );
    assert_eq!(received[2].message.payload, b"payload for CMND:3".to_vec());
    Ok(())
}

#[tokio::test]
async fn close_ends_delivery_tasks() -> anyhow::Result<()> {
    let server = FakeServer::spawn(echo_subscribe).await;
    let store = connected_store(&server, 0).await;
    let (dst, mut rx) = mpsc::channel(4);

    let delivery = store.subscribe("t", dst, &["CMND:0"]).await?;
    assert!(rx.recv().await.is_some());

    store.close();
    tokio::time::timeout(Duration::from_secs(2), delivery).await??;
    assert!(rx.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn subscriptions_survive_a_backend_disconnect() -> anyhow::Result<()> {
    let server = FakeServer::spawn(echo_subscribe).await;
    let store = connected_store(&server, 0).await;
    let (dst, mut rx) = mpsc::channel(4);

    let delivery = store.subscribe("t", dst.clone(), &["CMND:0"]).await?;
    assert!(rx.recv().await.is_some());

    server.disconnect_all();
    let replayed = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await?
        .expect("delivery keeps running");
    assert_eq!(replayed.tag, "t");
    assert_eq!(replayed.message.channel, "CMND:0");
    assert!(!delivery.is_finished());

    // Subscribing again and reconnecting both keep working after the outage.
    store.subscribe("again", dst, &["ALERT:x"]).await?;
    let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("message");
    assert_eq!(next.tag, "again");
    store.connect().await?;

    store.close();
    tokio::time::timeout(Duration::from_secs(2), delivery).await??;
    Ok(())
}

#[tokio::test]
async fn slow_destination_receives_every_message_in_order() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "SUBSCRIBE" => {
            let mut frames = vec![Reply::subscribed(&args[1], 1)];
            for seq in 0..20 {
                frames.push(Reply::message(&args[1], seq.to_string()));
            }
            Some(frames)
        }
        _ => None,
    })
    .await;
    let store = connected_store(&server, 2).await;
    let (dst, mut rx) = mpsc::channel(1);

    store.subscribe("t", dst, &["CMND:2"]).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for seq in 0..20 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("message");
        assert_eq!(msg.db, 2);
        assert_eq!(msg.message.payload, seq.to_string().into_bytes());
    }
    store.close();
    Ok(())
}

#[tokio::test]
async fn registry_routes_to_connected_stores() -> anyhow::Result<()> {
    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "PUBLISH" => Some(vec![Reply::Integer(1)]),
        _ => None,
    })
    .await;

    let intraday = Arc::new(connected_store(&server, 3).await);
    let history = Arc::new(connected_store(&server, 4).await);
    let mut registry = Registry::new();
    registry.add("intraday", intraday.clone());
    registry.add("history", history.clone());
    let registry = Arc::new(registry);

    let by_db = registry.by_db(3).expect("db 3");
    assert_eq!(by_db.address(), server.addr());
    assert!(by_db.publish("intraday:code1").await?);
    assert!(registry.by_code("history").expect("history").publish("h").await?);
    assert!(registry.by_db(5).is_none());

    assert_eq!(
        server.commands_named("PUBLISH"),
        vec![
            vec!["PUBLISH", "CMND:3", "intraday:code1"],
            vec!["PUBLISH", "CMND:4", "h"],
        ]
    );

    intraday.close();
    history.close();
    Ok(())
}

#[tokio::test]
async fn farm_config_file_builds_connectable_registry() -> anyhow::Result<()> {
    use std::io::Write;

    let server = FakeServer::spawn(|args| match args[0].as_str() {
        "PUBLISH" => Some(vec![Reply::Integer(1)]),
        _ => None,
    })
    .await;

    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "stores": [
                {{"code": "intraday", "address": "{addr}", "db": 3}},
                {{"code": "history", "address": "{addr}", "db": 4}}
            ],
            "pool": {{"max_total": 2, "connect_timeout_ms": 1000}}
        }}"#,
        addr = server.addr()
    )?;

    let config = rfarm_store::FarmConfig::from_json_file(file.path())?;
    let registry = config.build_registry(&Span::none());
    assert_eq!(registry.len(), 2);

    let intraday = registry.by_code("intraday").expect("intraday");
    intraday.connect().await?;
    intraday.publish("code1").await?;
    assert_eq!(server.commands_named("PUBLISH"), vec![vec!["PUBLISH", "CMND:3", "code1"]]);
    intraday.close();

    let missing = file.path().with_extension("missing");
    assert!(matches!(
        rfarm_store::FarmConfig::from_json_file(&missing),
        Err(StoreError::Io(_))
    ));
    Ok(())
}
