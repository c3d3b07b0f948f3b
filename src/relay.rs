//! Relay connections and the publishing pool.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{future::join_all, SinkExt, StreamExt};
use nostr_sdk::Event;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async_tls, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};

/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Events buffered per relay while it is unreachable.
const QUEUE_DEPTH: usize = 16;
/// How long [`RelayPool::end`] lets relays flush their queues.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Websocket to a relay, TLS-wrapped for `wss://`.
pub(crate) type RelayStream =
    WebSocketStream<MaybeTlsStream<Box<dyn AsyncReadWrite + Unpin + Send>>>;

/// One relay as seen by the pool.
pub trait RelayConnection: Send + Sync {
    fn url(&self) -> &str;

    /// Start background activity, if any. Called once by [`RelayPool::run`].
    fn start(&self) -> Option<JoinHandle<()>> {
        None
    }

    /// Hand `event` over for delivery without waiting on the relay.
    fn send(&self, event: &Event) -> Result<()>;

    /// Refuse further events; already queued ones may still go out.
    fn close(&self) {}
}

/// Websocket relay fed through a bounded queue.
pub struct WsRelay {
    url: String,
    tor_socks: Option<String>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl WsRelay {
    pub fn new(url: impl Into<String>, tor_socks: Option<String>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        Self {
            url: url.into(),
            tor_socks,
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl RelayConnection for WsRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn start(&self) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        let url = self.url.clone();
        let tor_socks = self.tor_socks.clone();
        Some(tokio::spawn(relay_loop(url, tor_socks, rx)))
    }

    fn send(&self, event: &Event) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(Error::relay(&self.url, "connection closed"));
        };
        let frame = serde_json::json!(["EVENT", event]).to_string();
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::relay(&self.url, "send queue full"),
            mpsc::error::TrySendError::Closed(_) => Error::relay(&self.url, "connection closed"),
        })
    }

    /// Dropping the sender lets the relay task flush what is queued, send a
    /// close frame and exit.
    fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Keep a connection to `url` open, reconnecting until the queue is closed
/// and empty.
async fn relay_loop(url: String, tor_socks: Option<String>, mut rx: mpsc::Receiver<String>) {
    loop {
        if rx.is_closed() && rx.is_empty() {
            return;
        }
        match connect_ws(&url, tor_socks.as_deref()).await {
            Ok(ws) => {
                info!("connected to relay {url}");
                match relay_session(&url, ws, &mut rx).await {
                    Ok(()) => return,
                    Err(e) => warn!("{e}"),
                }
            }
            Err(e) => warn!("relay {url} unreachable: {e}"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

/// Forward queued frames and log relay replies. Returns `Ok` once the queue
/// is closed, an error when the relay goes away.
async fn relay_session(url: &str, ws: RelayStream, rx: &mut mpsc::Receiver<String>) -> Result<()> {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    sink.send(Message::Text(frame))
                        .await
                        .map_err(|e| Error::relay(url, e))?;
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(txt))) => log_reply(url, &txt),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::relay(url, "closed by relay"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::relay(url, e)),
            },
        }
    }
}

fn log_reply(url: &str, txt: &str) {
    let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(txt) else {
        trace!("relay {url} sent unparsable frame");
        return;
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("OK") => {
            let id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or_default();
            if accepted {
                debug!("relay {url} accepted {id}");
            } else {
                warn!("relay {url} rejected {id}: {reason}");
            }
        }
        Some("NOTICE") => {
            let notice = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
            info!("relay {url} notice: {notice}");
        }
        _ => trace!("relay {url}: {txt}"),
    }
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy. `wss://`
/// URLs get a TLS session on top of the TCP or SOCKS stream.
pub(crate) async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<RelayStream> {
    let url = Url::parse(relay).map_err(|e| Error::relay(relay, e))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::relay(relay, "missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::relay(relay, "missing port"))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::relay(relay, e))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    } else {
        Box::new(
            TcpStream::connect((host, port))
                .await
                .map_err(|e| Error::relay(relay, e))?,
        )
    };
    let (ws, _) = client_async_tls(req, stream)
        .await
        .map_err(|e| Error::relay(relay, e))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Fixed set of relays every status event is broadcast to.
pub struct RelayPool {
    connections: Vec<Arc<dyn RelayConnection>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayPool {
    /// Pool of websocket relays, optionally reached through a SOCKS5 proxy.
    pub fn new(urls: &[String], tor_socks: Option<String>) -> Self {
        let connections = urls
            .iter()
            .map(|url| Arc::new(WsRelay::new(url.clone(), tor_socks.clone())) as Arc<dyn RelayConnection>)
            .collect();
        Self::from_connections(connections)
    }

    pub fn from_connections(connections: Vec<Arc<dyn RelayConnection>>) -> Self {
        Self {
            connections,
            tasks: Vec::new(),
        }
    }

    /// Start connection activity for every relay.
    pub fn run(&mut self) {
        for conn in &self.connections {
            debug!("starting relay {}", conn.url());
            if let Some(handle) = conn.start() {
                self.tasks.push(handle);
            }
        }
    }

    /// Offer `event` to every relay. Failures are logged per relay and never
    /// stop delivery to the rest; returns how many relays accepted it.
    pub fn publish(&self, event: &Event) -> usize {
        let mut queued = 0;
        for conn in &self.connections {
            match conn.send(event) {
                Ok(()) => queued += 1,
                Err(e) => warn!("publish {} to {} failed: {e}", event.id, conn.url()),
            }
        }
        debug!(
            "event {} queued for {queued}/{} relays",
            event.id,
            self.connections.len()
        );
        queued
    }

    /// Stop every relay connection. Queued events get up to
    /// [`DRAIN_TIMEOUT`] to go out before the relay tasks are aborted.
    pub async fn end(&mut self) {
        for conn in &self.connections {
            conn.close();
        }
        if timeout(DRAIN_TIMEOUT, join_all(self.tasks.iter_mut())).await.is_err() {
            debug!("relays still busy after {DRAIN_TIMEOUT:?}, dropping what is left");
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("relay pool stopped");
    }
}
