// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

pub mod proto;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::PrivateKeyDer;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;

use crate::handler::{CallOptions, Db};
use crate::pubsub::{ChangeEvent, Realm};
use crate::server::proto::{EventFrame, Request, Response};
use crate::storage::files::FileSink;
use crate::storage::objects::ObjectListParams;
use crate::storage::StoreError;

/// Pre-handshake authentication: may reject a connection before any
/// operation is dispatched.
pub type ConnectionAuth = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;

/// Invoked once per connection after the handshake succeeds.
pub type ConnectedHook = Arc<dyn Fn(SocketAddr) + Send + Sync>;

#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    async fn serve(&self, addr: SocketAddr)
        -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// WebSocket connection manager hosting the database façade.
pub struct WsConnectionManager {
    db: Arc<Db>,
    tls: Option<TlsAcceptor>,
    auth: Option<ConnectionAuth>,
    connected: Option<ConnectedHook>,
    next_conn: AtomicU64,
}

impl WsConnectionManager {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            tls: None,
            auth: None,
            connected: None,
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn with_tls(mut self, cert_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        self.tls = Some(build_acceptor(cert_path, key_path)?);
        Ok(self)
    }

    pub fn with_auth(mut self, auth: ConnectionAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_connected(mut self, hook: ConnectedHook) -> Self {
        self.connected = Some(hook);
        self
    }
}

#[async_trait]
impl ConnectionManager for WsConnectionManager {
    async fn serve(
        &self,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, secure = self.tls.is_some(), "listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            if let Some(auth) = &self.auth {
                if !auth(peer) {
                    tracing::warn!(%peer, "connection rejected before handshake");
                    continue;
                }
            }

            let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
            let db = self.db.clone();
            let tls = self.tls.clone();
            let connected = self.connected.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(stream) => handle_socket(db, conn, peer, stream, connected).await,
                        Err(e) => {
                            tracing::warn!(%peer, error = %e, "tls handshake failed");
                            return;
                        }
                    },
                    None => handle_socket(db, conn, peer, stream, connected).await,
                };
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_socket<S>(
    db: Arc<Db>,
    conn: u64,
    peer: SocketAddr,
    stream: S,
    connected: Option<ConnectedHook>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sender, mut receiver) = ws.split();
    tracing::info!(%peer, conn, "connection established");
    if let Some(connected) = connected {
        connected(peer);
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChangeEvent>();
    db.dispatcher.register(conn, event_tx);

    // Streaming inserts in flight on this connection, keyed by id/name.
    let mut sinks: HashMap<String, FileSink> = HashMap::new();

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
        loop {
            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let request: Request = match serde_json::from_str(&text) {
                                Ok(request) => request,
                                Err(e) => {
                                    tracing::warn!(%peer, error = %e, "unparseable request");
                                    continue;
                                }
                            };
                            let id = request.id;
                            let response = match dispatch(&db, conn, &mut sinks, request).await {
                                Ok(result) => Response::ok(id, result),
                                Err(e) => Response::err(id, e.to_string()),
                            };
                            sender.send(Message::Text(serde_json::to_string(&response)?)).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    let frame = EventFrame::from(event);
                    sender.send(Message::Text(serde_json::to_string(&frame)?)).await?;
                }
            }
        }
        Ok(())
    }
    .await;

    db.dispatcher.unregister(conn);
    tracing::info!(%peer, conn, "connection closed");
    result
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct SetArgs {
    id: String,
    #[serde(default)]
    obj: Value,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct PatternArgs {
    pattern: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct KeysArgs {
    keys: Option<Vec<String>>,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(flatten)]
    params: ObjectListParams,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct FindArgs {
    #[serde(rename = "idOrName")]
    id_or_name: String,
    #[serde(rename = "type")]
    type_filter: Option<String>,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct ViewArgs {
    design: String,
    search: String,
    #[serde(default)]
    params: ObjectListParams,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct WriteFileArgs {
    id: String,
    name: String,
    /// UTF-8 payload; binary payloads use `data64`.
    data: Option<String>,
    data64: Option<String>,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct FileArgs {
    id: String,
    name: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct RenameArgs {
    id: String,
    #[serde(rename = "oldName")]
    old_name: String,
    #[serde(rename = "newName")]
    new_name: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct FilePatternArgs {
    id: String,
    pattern: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct MkdirArgs {
    id: String,
    dirname: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct CacheArgs {
    enabled: bool,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct SubscribeArgs {
    realm: Realm,
    pattern: String,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct InsertArgs {
    id: String,
    name: String,
    data64: Option<String>,
    #[serde(default)]
    eof: bool,
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct OptionsArgs {
    #[serde(default)]
    options: CallOptions,
}

#[derive(Deserialize)]
struct ErrorArgs {
    #[serde(default)]
    message: String,
}

fn parse<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, StoreError> {
    serde_json::from_value(args).map_err(|_| StoreError::InvalidParameter)
}

async fn dispatch(
    db: &Arc<Db>,
    conn: u64,
    sinks: &mut HashMap<String, FileSink>,
    request: Request,
) -> Result<Value, StoreError> {
    match request.op.as_str() {
        "getObject" => {
            let args: IdArgs = parse(request.args)?;
            let obj = db.get_object(&args.id, &args.options).await?;
            Ok(obj.unwrap_or(Value::Null))
        }
        "setObject" => {
            let args: SetArgs = parse(request.args)?;
            db.set_object(&args.id, args.obj, &args.options).await?;
            Ok(json!({"id": args.id}))
        }
        "extendObject" => {
            let args: SetArgs = parse(request.args)?;
            let merged = db.extend_object(&args.id, args.obj, &args.options).await?;
            Ok(json!({"id": args.id, "value": merged}))
        }
        "delObject" => {
            let args: IdArgs = parse(request.args)?;
            db.del_object(&args.id, &args.options).await?;
            Ok(Value::Null)
        }
        "getKeys" => {
            let args: PatternArgs = parse(request.args)?;
            let keys = db.get_keys(&args.pattern, &args.options).await?;
            Ok(json!(keys))
        }
        "getObjects" => {
            let args: KeysArgs = parse(request.args)?;
            let objs = db.get_objects(args.keys.as_deref(), &args.options).await?;
            Ok(json!(objs))
        }
        "getObjectsByPattern" => {
            let args: PatternArgs = parse(request.args)?;
            let objs = db.get_objects_by_pattern(&args.pattern, &args.options).await?;
            Ok(json!(objs))
        }
        "getObjectList" => {
            let args: ListArgs = parse(request.args)?;
            let list = db.get_object_list(&args.params, &args.options).await?;
            Ok(serde_json::to_value(list).expect("list serializes"))
        }
        "chownObject" => {
            let args: PatternArgs = parse(request.args)?;
            let modified = db.chown_object(&args.pattern, &args.options).await?;
            Ok(json!(modified))
        }
        "chmodObject" => {
            let args: PatternArgs = parse(request.args)?;
            let modified = db.chmod_object(&args.pattern, &args.options).await?;
            Ok(json!(modified))
        }
        "findObject" => {
            let args: FindArgs = parse(request.args)?;
            let found = db
                .find_object(&args.id_or_name, args.type_filter.as_deref(), &args.options)
                .await?;
            Ok(found.map(Value::String).unwrap_or(Value::Null))
        }
        "getObjectView" => {
            let args: ViewArgs = parse(request.args)?;
            let result = db
                .get_object_view(&args.design, &args.search, &args.params, &args.options)
                .await?;
            Ok(serde_json::to_value(result).expect("view serializes"))
        }
        "destroyDB" => {
            let args: OptionsArgs = serde_json::from_value(request.args).unwrap_or(OptionsArgs {
                options: CallOptions::default(),
            });
            db.destroy_db(&args.options).await?;
            Ok(Value::Null)
        }
        "writeFile" => {
            let args: WriteFileArgs = parse(request.args)?;
            let data = decode_payload(args.data, args.data64)?;
            db.write_file(&args.id, &args.name, data, &args.options).await?;
            Ok(Value::Null)
        }
        "readFile" => {
            let args: FileArgs = parse(request.args)?;
            let (data, mime_type) = db.read_file(&args.id, &args.name, &args.options).await?;
            Ok(encode_payload(&data, &mime_type))
        }
        "readDir" => {
            let args: FileArgs = parse(request.args)?;
            let entries = db.read_dir(&args.id, &args.name, &args.options).await?;
            Ok(serde_json::to_value(entries).expect("entries serialize"))
        }
        "unlink" => {
            let args: FileArgs = parse(request.args)?;
            db.unlink(&args.id, &args.name, &args.options).await?;
            Ok(Value::Null)
        }
        "rename" => {
            let args: RenameArgs = parse(request.args)?;
            db.rename(&args.id, &args.old_name, &args.new_name, &args.options).await?;
            Ok(Value::Null)
        }
        "mkdir" => {
            let args: MkdirArgs = parse(request.args)?;
            db.mkdir(&args.id, &args.dirname, &args.options).await?;
            Ok(Value::Null)
        }
        "touch" => {
            let args: FilePatternArgs = parse(request.args)?;
            let touched = db.touch(&args.id, &args.pattern, &args.options).await?;
            Ok(json!(touched))
        }
        "rm" => {
            let args: FilePatternArgs = parse(request.args)?;
            let removed = db.rm(&args.id, &args.pattern, &args.options).await?;
            Ok(json!(removed))
        }
        "chownFile" => {
            let args: FilePatternArgs = parse(request.args)?;
            let modified = db.chown_file(&args.id, &args.pattern, &args.options).await?;
            Ok(json!(modified))
        }
        "chmodFile" => {
            let args: FilePatternArgs = parse(request.args)?;
            let modified = db.chmod_file(&args.id, &args.pattern, &args.options).await?;
            Ok(json!(modified))
        }
        "enableFileCache" => {
            let args: CacheArgs = parse(request.args)?;
            db.enable_file_cache(args.enabled, &args.options).await?;
            Ok(Value::Null)
        }
        "insert" => {
            let args: InsertArgs = parse(request.args)?;
            let key = format!("{}/{}", args.id, args.name);
            let sink = sinks
                .entry(key.clone())
                .or_insert_with(|| db.insert(&args.id, &args.name, &args.options));
            if let Some(chunk) = args.data64 {
                let bytes = BASE64_STANDARD
                    .decode(chunk.as_bytes())
                    .map_err(|_| StoreError::InvalidParameter)?;
                sink.write(&bytes);
            }
            if args.eof {
                let sink = sinks.remove(&key).expect("sink just inserted");
                let subject = db
                    .objects
                    .resolve_subject(
                        args.options.user.as_deref().unwrap_or(crate::storage::ADMIN_USER),
                    )
                    .await;
                sink.finish(&subject).await?;
            }
            Ok(Value::Null)
        }
        "subscribe" => {
            let args: SubscribeArgs = parse(request.args)?;
            db.check_subscribe(args.realm, &args.options).await?;
            db.dispatcher.subscribe(conn, args.realm, &args.pattern, Value::Null);
            Ok(Value::Null)
        }
        "unsubscribe" => {
            let args: SubscribeArgs = parse(request.args)?;
            db.check_subscribe(args.realm, &args.options).await?;
            db.dispatcher.unsubscribe(conn, args.realm, &args.pattern);
            Ok(Value::Null)
        }
        "destroy" => {
            db.destroy().await;
            Ok(Value::Null)
        }
        "error" => {
            let args: ErrorArgs = serde_json::from_value(request.args)
                .unwrap_or(ErrorArgs { message: String::new() });
            tracing::error!(conn, message = %args.message, "client reported error");
            Ok(Value::Null)
        }
        other => {
            tracing::warn!(conn, op = %other, "unknown operation");
            Err(StoreError::InvalidParameter)
        }
    }
}

fn decode_payload(data: Option<String>, data64: Option<String>) -> Result<Bytes, StoreError> {
    if let Some(data64) = data64 {
        let bytes = BASE64_STANDARD
            .decode(data64.as_bytes())
            .map_err(|_| StoreError::InvalidParameter)?;
        return Ok(Bytes::from(bytes));
    }
    Ok(Bytes::from(data.unwrap_or_default().into_bytes()))
}

fn encode_payload(data: &[u8], mime_type: &str) -> Value {
    match std::str::from_utf8(data) {
        Ok(text) => json!({"data": text, "mimeType": mime_type}),
        Err(_) => json!({"data64": BASE64_STANDARD.encode(data), "mimeType": mime_type}),
    }
}

fn build_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        cert_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path)?,
    ))?
    .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
