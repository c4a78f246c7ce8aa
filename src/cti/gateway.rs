//! CTI gateway client
//!
//! Production implementation of the call-control boundary. The gateway
//! speaks newline-delimited JSON over TCP: requests carry a correlation id
//! and a verb, responses echo the id with an `ok` or `error` body, and
//! unsolicited `event` frames report provider activity. One reader task
//! resolves pending requests and forwards events; command verbs are issued
//! through handle objects that carry the resource id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    CallControlProvider, ConnectionState, CtiAddress, CtiCall, CtiConnection, CtiError, CtiEvent,
    CtiTerminal,
};

/// Default CTI gateway port.
pub const DEFAULT_GATEWAY_PORT: u16 = 2748;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Connect to the gateway named by a provider string
/// (`host[:port];login=<user>;passwd=<password>`), authenticate, and return
/// the provider handle plus the event stream.
pub async fn connect(
    provider_string: &str,
    cancel: CancellationToken,
) -> Result<(Arc<GatewayProvider>, mpsc::Receiver<CtiEvent>), CtiError> {
    let creds = ProviderString::parse(provider_string)?;

    let stream = TcpStream::connect((creds.host.as_str(), creds.port)).await?;
    let (read_half, write_half) = stream.into_split();

    let client = GatewayClient {
        shared: Arc::new(ClientShared {
            writer: Mutex::new(write_half),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }),
    };

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(read_loop(
        client.clone(),
        BufReader::new(read_half),
        event_tx,
        cancel,
    ));

    client
        .request(
            "open",
            json!({ "login": creds.login, "passwd": creds.passwd }),
        )
        .await?;
    info!(host = %creds.host, port = creds.port, login = %creds.login, "CTI gateway session opened");

    Ok((Arc::new(GatewayProvider { client }), event_rx))
}

/// Parsed provider connection string.
struct ProviderString {
    host: String,
    port: u16,
    login: String,
    passwd: String,
}

impl ProviderString {
    fn parse(raw: &str) -> Result<Self, CtiError> {
        let mut parts = raw.split(';');
        let addr = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CtiError::Protocol("provider string missing address".to_string()))?;

        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    CtiError::Protocol(format!("invalid port in provider string: {port}"))
                })?;
                (host.to_string(), port)
            }
            None => (addr.to_string(), DEFAULT_GATEWAY_PORT),
        };

        let mut login = None;
        let mut passwd = None;
        for part in parts {
            match part.split_once('=') {
                Some(("login", v)) => login = Some(v.to_string()),
                Some(("passwd", v)) => passwd = Some(v.to_string()),
                _ => {
                    return Err(CtiError::Protocol(format!(
                        "unrecognized provider string element: {part}"
                    )))
                }
            }
        }

        Ok(Self {
            host,
            port,
            login: login
                .ok_or_else(|| CtiError::Protocol("provider string missing login".to_string()))?,
            passwd: passwd
                .ok_or_else(|| CtiError::Protocol("provider string missing passwd".to_string()))?,
        })
    }
}

#[derive(Clone)]
struct GatewayClient {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, CtiError>>>>,
    next_id: AtomicU64,
}

impl GatewayClient {
    async fn request(&self, verb: &str, params: Value) -> Result<Value, CtiError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = json!({ "id": id, "verb": verb, "params": params }).to_string();
        debug!(id, verb, "gateway request");
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.write_all(frame.as_bytes()).await {
                self.shared.pending.lock().await.remove(&id);
                return Err(e.into());
            }
            if let Err(e) = writer.write_all(b"\n").await {
                self.shared.pending.lock().await.remove(&id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CtiError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(CtiError::Timeout(format!(
                    "no response to {verb} within {}s",
                    REQUEST_TIMEOUT.as_secs()
                )))
            }
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(
        &self,
        verb: &str,
        params: Value,
    ) -> Result<T, CtiError> {
        let value = self.request(verb, params).await?;
        serde_json::from_value(value).map_err(|e| CtiError::Protocol(e.to_string()))
    }
}

async fn read_loop(
    client: GatewayClient,
    reader: BufReader<OwnedReadHalf>,
    events: mpsc::Sender<CtiEvent>,
    cancel: CancellationToken,
) {
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("gateway reader cancelled");
                break;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Frame>(&line) {
                    Ok(frame) => dispatch_frame(&client, frame, &events).await,
                    Err(e) => warn!(error = %e, "unparseable gateway frame"),
                }
            }
            Ok(None) => {
                info!("gateway closed the connection");
                break;
            }
            Err(e) => {
                error!(error = %e, "gateway read failed");
                break;
            }
        }
    }

    let mut pending = client.shared.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CtiError::NotConnected));
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    ok: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    event: Option<EventFrame>,
    #[serde(default)]
    ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

impl ErrorBody {
    fn into_error(self) -> CtiError {
        match self.code.as_deref() {
            Some("resource_unavailable") => CtiError::ResourceUnavailable(self.message),
            Some("invalid_party") => CtiError::InvalidParty(self.message),
            Some("invalid_state") => CtiError::InvalidState(self.message),
            _ => CtiError::CommandFailed(self.message),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum EventFrame {
    ProviderInService,
    ProviderOutOfService,
    TerminalInService {
        terminal: String,
    },
    AddressInService {
        address: String,
    },
    ConnectionOffered {
        call: String,
        connection: String,
        address: String,
    },
    ConnectionConnected {
        call: String,
        address: String,
    },
    ConnectionDisconnected {
        call: String,
        address: String,
    },
    CallEnded {
        call: String,
    },
}

async fn dispatch_frame(client: &GatewayClient, frame: Frame, events: &mpsc::Sender<CtiEvent>) {
    // Response frames carry the request id; everything else is an event.
    if let Some(id) = frame.id {
        let tx = client.shared.pending.lock().await.remove(&id);
        let Some(tx) = tx else {
            warn!(id, "response for unknown request");
            return;
        };
        let result = match frame.error {
            Some(body) => Err(body.into_error()),
            None => Ok(frame.ok.unwrap_or(Value::Null)),
        };
        let _ = tx.send(result);
        return;
    }

    let Some(event) = frame.event else {
        warn!("gateway frame with neither id nor event");
        return;
    };
    if let Some(ts) = frame.ts {
        debug!(%ts, "gateway event timestamp");
    }

    let event = match event {
        EventFrame::ProviderInService => CtiEvent::ProviderInService,
        EventFrame::ProviderOutOfService => CtiEvent::ProviderOutOfService,
        EventFrame::TerminalInService { terminal } => CtiEvent::TerminalInService { terminal },
        EventFrame::AddressInService { address } => CtiEvent::AddressInService { address },
        EventFrame::ConnectionOffered {
            call,
            connection,
            address,
        } => CtiEvent::ConnectionOffered {
            call: Arc::new(GatewayCall::new(client.clone(), call.clone())),
            connection: Arc::new(GatewayConnection {
                client: client.clone(),
                id: connection,
                call_id: call,
                address,
                state: ConnectionState::Offered,
            }),
        },
        EventFrame::ConnectionConnected { call, address } => CtiEvent::ConnectionConnected {
            call_id: call,
            address,
        },
        EventFrame::ConnectionDisconnected { call, address } => CtiEvent::ConnectionDisconnected {
            call_id: call,
            address,
        },
        EventFrame::CallEnded { call } => CtiEvent::CallEnded { call_id: call },
    };

    if events.send(event).await.is_err() {
        warn!("event receiver dropped, discarding gateway event");
    }
}

#[derive(Debug, Deserialize)]
struct TerminalInfo {
    name: String,
    #[serde(default)]
    route_point: bool,
}

#[derive(Debug, Deserialize)]
struct AddressInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ConnectionInfo {
    id: String,
    call: String,
    address: String,
    state: ConnectionState,
}

#[derive(Debug, Deserialize)]
struct CallInfo {
    call: String,
}

fn connection_handles(
    client: &GatewayClient,
    infos: Vec<ConnectionInfo>,
) -> Vec<Arc<dyn CtiConnection>> {
    infos
        .into_iter()
        .map(|info| {
            Arc::new(GatewayConnection {
                client: client.clone(),
                id: info.id,
                call_id: info.call,
                address: info.address,
                state: info.state,
            }) as Arc<dyn CtiConnection>
        })
        .collect()
}

/// Provider handle bound to one gateway session.
pub struct GatewayProvider {
    client: GatewayClient,
}

#[async_trait::async_trait]
impl CallControlProvider for GatewayProvider {
    async fn terminals(&self) -> Result<Vec<Arc<dyn CtiTerminal>>, CtiError> {
        let infos: Vec<TerminalInfo> = self.client.fetch("terminals", json!({})).await?;
        Ok(infos
            .into_iter()
            .map(|info| {
                Arc::new(GatewayTerminal {
                    client: self.client.clone(),
                    name: info.name,
                    route_point: info.route_point,
                }) as Arc<dyn CtiTerminal>
            })
            .collect())
    }

    async fn addresses(&self) -> Result<Vec<Arc<dyn CtiAddress>>, CtiError> {
        let infos: Vec<AddressInfo> = self.client.fetch("addresses", json!({})).await?;
        Ok(infos
            .into_iter()
            .map(|info| {
                Arc::new(GatewayAddress {
                    client: self.client.clone(),
                    name: info.name,
                }) as Arc<dyn CtiAddress>
            })
            .collect())
    }

    async fn terminal(&self, name: &str) -> Result<Arc<dyn CtiTerminal>, CtiError> {
        let info: TerminalInfo = self
            .client
            .fetch("terminal", json!({ "name": name }))
            .await?;
        Ok(Arc::new(GatewayTerminal {
            client: self.client.clone(),
            name: info.name,
            route_point: info.route_point,
        }))
    }

    async fn address(&self, dn: &str) -> Result<Arc<dyn CtiAddress>, CtiError> {
        let info: AddressInfo = self.client.fetch("address", json!({ "name": dn })).await?;
        Ok(Arc::new(GatewayAddress {
            client: self.client.clone(),
            name: info.name,
        }))
    }

    async fn create_call(&self) -> Result<Arc<dyn CtiCall>, CtiError> {
        let info: CallInfo = self.client.fetch("create_call", json!({})).await?;
        Ok(Arc::new(GatewayCall::new(self.client.clone(), info.call)))
    }
}

struct GatewayTerminal {
    client: GatewayClient,
    name: String,
    route_point: bool,
}

#[async_trait::async_trait]
impl CtiTerminal for GatewayTerminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_route_point(&self) -> bool {
        self.route_point
    }

    async fn register_media_less(&self) -> Result<(), CtiError> {
        self.client
            .request(
                "register_terminal",
                json!({ "terminal": self.name, "media": "none" }),
            )
            .await?;
        Ok(())
    }

    async fn observe_calls(&self) -> Result<(), CtiError> {
        self.client
            .request("observe_terminal", json!({ "terminal": self.name }))
            .await?;
        Ok(())
    }
}

struct GatewayAddress {
    client: GatewayClient,
    name: String,
}

#[async_trait::async_trait]
impl CtiAddress for GatewayAddress {
    fn name(&self) -> &str {
        &self.name
    }

    async fn observe_calls(&self) -> Result<(), CtiError> {
        self.client
            .request("observe_address", json!({ "address": self.name }))
            .await?;
        Ok(())
    }

    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError> {
        let infos: Vec<ConnectionInfo> = self
            .client
            .fetch("address_connections", json!({ "address": self.name }))
            .await?;
        Ok(connection_handles(&self.client, infos))
    }
}

struct GatewayCall {
    client: GatewayClient,
    id: String,
    created_at: DateTime<Utc>,
}

impl GatewayCall {
    fn new(client: GatewayClient, id: String) -> Self {
        Self {
            client,
            id,
            created_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
impl CtiCall for GatewayCall {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connections(&self) -> Result<Vec<Arc<dyn CtiConnection>>, CtiError> {
        let infos: Vec<ConnectionInfo> = self
            .client
            .fetch("call_connections", json!({ "call": self.id }))
            .await?;
        Ok(connection_handles(&self.client, infos))
    }

    async fn set_conference_enabled(&self, enabled: bool) -> Result<(), CtiError> {
        self.client
            .request(
                "set_conference_enabled",
                json!({ "call": self.id, "enabled": enabled }),
            )
            .await?;
        Ok(())
    }

    async fn connect(&self, terminal: &str, address: &str, dialed: &str) -> Result<(), CtiError> {
        debug!(
            call = %self.id,
            elapsed_ms = (Utc::now() - self.created_at).num_milliseconds(),
            terminal,
            address,
            dialed,
            "connect"
        );
        self.client
            .request(
                "connect",
                json!({
                    "call": self.id,
                    "terminal": terminal,
                    "address": address,
                    "dialed": dialed,
                }),
            )
            .await?;
        Ok(())
    }

    async fn conference(&self, other: &dyn CtiCall) -> Result<(), CtiError> {
        self.client
            .request(
                "conference",
                json!({ "call": self.id, "other": other.id() }),
            )
            .await?;
        Ok(())
    }
}

struct GatewayConnection {
    client: GatewayClient,
    id: String,
    call_id: String,
    address: String,
    state: ConnectionState,
}

#[async_trait::async_trait]
impl CtiConnection for GatewayConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn address_name(&self) -> &str {
        &self.address
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn disconnect(&self) -> Result<(), CtiError> {
        self.client
            .request("disconnect", json!({ "connection": self.id }))
            .await?;
        Ok(())
    }

    async fn call(&self) -> Result<Arc<dyn CtiCall>, CtiError> {
        Ok(Arc::new(GatewayCall::new(
            self.client.clone(),
            self.call_id.clone(),
        )))
    }
}
