use std::sync::Arc;
use std::time::Duration;

use confdb::handler::{Db, DbOptions};
use confdb::server::{ConnectionManager, WsConnectionManager};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(dir: &std::path::Path) -> (Arc<Db>, u16) {
    let db = Db::open(DbOptions::new(dir)).unwrap();
    let port = free_port();
    let server = WsConnectionManager::new(db.clone());
    tokio::spawn(async move {
        let _ = server.serve(([127, 0, 0, 1], port).into()).await;
    });
    (db, port)
}

async fn connect(port: u16) -> Client {
    for _ in 0..50 {
        if let Ok((ws, _)) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}")).await
        {
            return ws;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("server did not come up on port {port}");
}

async fn recv_frame(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Send one request and collect (events_before_response, response).
async fn roundtrip(ws: &mut Client, id: u64, op: &str, args: Value) -> (Vec<Value>, Value) {
    let request = json!({"id": id, "op": op, "args": args});
    ws.send(Message::Text(request.to_string())).await.unwrap();

    let mut events = Vec::new();
    loop {
        let frame = recv_frame(ws).await;
        if frame.get("event").is_some() {
            events.push(frame);
            continue;
        }
        assert_eq!(frame["id"], id, "responses arrive in request order");
        return (events, frame);
    }
}

#[tokio::test]
async fn matching_subscription_delivers_exactly_one_event() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    let (_, resp) = roundtrip(
        &mut ws,
        1,
        "subscribe",
        json!({"realm": "objects", "pattern": "system.adapter.*"}),
    )
    .await;
    assert!(resp.get("error").is_none());

    // The acknowledgement is written before the queued event, so the event
    // is exactly the next frame.
    let (events, resp) = roundtrip(
        &mut ws,
        2,
        "setObject",
        json!({"id": "system.adapter.foo", "obj": {"common": {"name": "foo"}}}),
    )
    .await;
    assert!(resp.get("error").is_none());
    assert!(events.is_empty());
    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["event"], "message");
    assert_eq!(frame["id"], "system.adapter.foo");

    // A non-matching mutation emits nothing: the next frames are only the
    // two acknowledgements.
    let (events, _) = roundtrip(
        &mut ws,
        3,
        "setObject",
        json!({"id": "other.thing", "obj": {}}),
    )
    .await;
    assert!(events.is_empty());
    let (events, resp) = roundtrip(&mut ws, 4, "getObject", json!({"id": "other.thing"})).await;
    assert!(events.is_empty());
    assert_eq!(resp["result"]["_id"], "other.thing");
}

#[tokio::test]
async fn subscription_event_carries_pattern_id_and_object() {
    let dir = tempfile::tempdir().unwrap();
    let (db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    roundtrip(
        &mut ws,
        1,
        "subscribe",
        json!({"realm": "objects", "pattern": "system.adapter.*"}),
    )
    .await;

    // Mutate through a second, independent connection.
    let mut other = connect(port).await;
    roundtrip(
        &mut other,
        1,
        "setObject",
        json!({"id": "system.adapter.web", "obj": {"common": {"enabled": true}}}),
    )
    .await;

    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["event"], "message");
    assert_eq!(frame["realm"], "objects");
    assert_eq!(frame["pattern"], "system.adapter.*");
    assert_eq!(frame["id"], "system.adapter.web");
    assert_eq!(frame["obj"]["common"]["enabled"], true);

    // Deletion pushes a null object.
    roundtrip(&mut other, 2, "delObject", json!({"id": "system.adapter.web"})).await;
    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["id"], "system.adapter.web");
    assert_eq!(frame["obj"], Value::Null);

    db.destroy().await;
}

#[tokio::test]
async fn first_match_wins_per_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    roundtrip(&mut ws, 1, "subscribe", json!({"realm": "objects", "pattern": "system.*"})).await;
    roundtrip(
        &mut ws,
        2,
        "subscribe",
        json!({"realm": "objects", "pattern": "system.adapter.*"}),
    )
    .await;

    let mut other = connect(port).await;
    roundtrip(
        &mut other,
        1,
        "setObject",
        json!({"id": "system.adapter.x", "obj": {}}),
    )
    .await;

    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["pattern"], "system.*", "insertion order wins");

    // And only that one frame: a follow-up request is answered next.
    let (events, resp) = roundtrip(&mut ws, 3, "getObject", json!({"id": "system.adapter.x"})).await;
    assert!(events.is_empty());
    assert_eq!(resp["result"]["_id"], "system.adapter.x");
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    roundtrip(&mut ws, 1, "subscribe", json!({"realm": "objects", "pattern": "a.*"})).await;
    roundtrip(&mut ws, 2, "unsubscribe", json!({"realm": "objects", "pattern": "a.*"})).await;

    let mut other = connect(port).await;
    roundtrip(&mut other, 1, "setObject", json!({"id": "a.x", "obj": {}})).await;

    let (events, _) = roundtrip(&mut ws, 3, "getObject", json!({"id": "a.x"})).await;
    assert!(events.is_empty());
}

#[tokio::test]
async fn file_writes_reach_file_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    roundtrip(&mut ws, 1, "subscribe", json!({"realm": "files", "pattern": "vis.0/*"})).await;

    let mut other = connect(port).await;
    roundtrip(
        &mut other,
        1,
        "writeFile",
        json!({"id": "vis.0", "name": "main/view.json", "data": "{}"}),
    )
    .await;

    let frame = recv_frame(&mut ws).await;
    assert_eq!(frame["realm"], "files");
    assert_eq!(frame["id"], "vis.0/main/view.json");
    assert_eq!(frame["obj"]["mimeType"], "application/json");
}

#[tokio::test]
async fn wire_errors_are_strings() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    let (_, resp) = roundtrip(
        &mut ws,
        1,
        "setObject",
        json!({"id": "bad[id", "obj": {}}),
    )
    .await;
    assert_eq!(resp["error"], "Invalid ID: bad[id");

    let (_, resp) = roundtrip(
        &mut ws,
        2,
        "setObject",
        json!({"id": "x.y", "obj": {}, "options": {"user": "system.user.nobody"}}),
    )
    .await;
    assert_eq!(resp["error"], "permissionError");

    let (_, resp) = roundtrip(&mut ws, 3, "bogusOp", json!({})).await;
    assert_eq!(resp["error"], "invalid parameter");
}

#[tokio::test]
async fn streaming_insert_accumulates_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, port) = start_server(dir.path()).await;
    let mut ws = connect(port).await;

    use base64::{engine::general_purpose::STANDARD, Engine as _};
    roundtrip(
        &mut ws,
        1,
        "insert",
        json!({"id": "o", "name": "big.bin", "data64": STANDARD.encode(b"first-")}),
    )
    .await;
    roundtrip(
        &mut ws,
        2,
        "insert",
        json!({"id": "o", "name": "big.bin", "data64": STANDARD.encode(b"second"), "eof": true}),
    )
    .await;

    let (_, resp) = roundtrip(&mut ws, 3, "readFile", json!({"id": "o", "name": "big.bin"})).await;
    assert_eq!(resp["result"]["data"], "first-second");
}
