//! Primary session connection to the management server.
//!
//! A [`Session`] owns one persistent WebSocket, authenticates it, and
//! multiplexes every caller over it: correlated request/response through
//! the [`CorrelationTable`], unsolicited pushes through the [`EventBus`],
//! and relay tunnels bootstrapped on demand. The connection becomes usable
//! once the server's two bootstrap frames (`serverinfo`, then `userinfo`)
//! have arrived.
//!
//! There is no reconnect policy: when the socket closes or errors, every
//! pending request and every owned tunnel is forced into a failure state
//! and the session is done.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::{BusEvent, CorrelationTable, EventBus, SubscriptionToken, Topic};
use crate::error::Error;
use crate::filter::EventFilter;
use crate::files::Files;
use crate::shell::{Shell, SmartShell};
use crate::tunnel::{Tunnel, TunnelProtocol};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying base64 credentials on the upgrade request.
const AUTH_HEADER: &str = "x-login-auth";

/// How a named login proves itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Secret {
    /// Account password, optionally with a second-factor token.
    Password {
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        second_factor: Option<String>,
    },
    /// An already-issued login key, appended to the connection URL as the
    /// signed `auth` query parameter.
    LoginKey(String),
    /// An externally issued token standing in for the password.
    Token(String),
}

/// A named login plus its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub secret: Secret,
}

impl Credentials {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Password {
                password: password.into(),
                second_factor: None,
            },
        }
    }

    pub fn password_with_token(
        user: impl Into<String>,
        password: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Password {
                password: password.into(),
                second_factor: Some(token.into()),
            },
        }
    }

    pub fn login_key(user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::LoginKey(key.into()),
        }
    }

    pub fn token(user: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: Secret::Token(token.into()),
        }
    }

    /// Value for the [`AUTH_HEADER`] upgrade header: comma-separated base64
    /// fields `user,password[,token]`, with an empty password slot for
    /// token-only logins. Login keys travel in the URL instead.
    fn auth_header(&self) -> Option<String> {
        match &self.secret {
            Secret::Password {
                password,
                second_factor,
            } => {
                let mut value = format!(
                    "{},{}",
                    BASE64.encode(&self.user),
                    BASE64.encode(password)
                );
                if let Some(token) = second_factor {
                    value.push(',');
                    value.push_str(&BASE64.encode(token));
                }
                Some(value)
            }
            Secret::Token(token) => Some(format!(
                "{},,{}",
                BASE64.encode(&self.user),
                BASE64.encode(token)
            )),
            Secret::LoginKey(_) => None,
        }
    }

    /// The signed query-parameter credential, if this login uses one.
    fn url_auth(&self) -> Option<&str> {
        match &self.secret {
            Secret::LoginKey(key) => Some(key),
            _ => None,
        }
    }
}

/// Connection policy, shared by the primary socket and every relay socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Skip TLS certificate verification. Applies to the primary connection
    /// and to every tunnel it opens.
    pub ignore_tls_errors: bool,
}

/// Build the TLS connector implementing the session's verification policy.
pub(crate) fn build_connector(options: &SessionOptions) -> Result<Option<Connector>, Error> {
    if !options.ignore_tls_errors {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| Error::Transport(format!("TLS setup failed: {e}")))?;
    Ok(Some(Connector::NativeTls(tls)))
}

/// One authenticated connection to the management server.
///
/// Clones share the same socket; dropping the last clone does not close
/// the connection — call [`Session::close`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("url", &self.inner.url)
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    url: String,
    options: SessionOptions,
    out: mpsc::UnboundedSender<Message>,
    state: Mutex<DispatchState>,
    alive: AtomicBool,
    shut: AtomicBool,
    cancel: CancellationToken,
    server_info: Mutex<Option<Value>>,
    user_info: Mutex<Option<Value>>,
    domain: Mutex<Option<String>>,
    /// Every tunnel opened through this session, for close fan-out.
    tunnels: Mutex<Vec<Tunnel>>,
    files_cache: AsyncMutex<HashMap<String, Files>>,
    shell_cache: AsyncMutex<HashMap<String, Shell>>,
    smart_cache: AsyncMutex<HashMap<(String, String), SmartShell>>,
}

struct DispatchState {
    correlations: CorrelationTable,
    bus: EventBus,
    ready: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Session {
    /// Connect, authenticate, and wait for the server's bootstrap frames.
    ///
    /// The endpoint scheme must be `ws` or `wss`. Password and token logins
    /// travel in an authorization header on the upgrade request; a login
    /// key is appended to the URL as the `auth` query parameter.
    pub async fn connect(
        url: &str,
        credentials: &Credentials,
        options: SessionOptions,
    ) -> Result<Session, Error> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::Invalid(
                "endpoint scheme must be ws:// or wss://".into(),
            ));
        }
        if credentials.user.is_empty() {
            return Err(Error::Invalid("login name must not be empty".into()));
        }

        let mut connect_url = url.to_string();
        if let Some(key) = credentials.url_auth() {
            connect_url.push(if connect_url.contains('?') { '&' } else { '?' });
            connect_url.push_str("auth=");
            connect_url.push_str(key);
        }

        let mut request = connect_url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Invalid(format!("invalid endpoint URL: {e}")))?;
        if let Some(header) = credentials.auth_header() {
            let value = HeaderValue::from_str(&header)
                .map_err(|e| Error::Invalid(format!("credentials not header-safe: {e}")))?;
            request.headers_mut().insert(AUTH_HEADER, value);
        }

        let connector = build_connector(&options)?;
        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| Error::Transport(e.to_string()))?;
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let inner = Arc::new(SessionInner {
            url: url.to_string(),
            options,
            out: out_tx,
            state: Mutex::new(DispatchState {
                correlations: CorrelationTable::new(),
                bus: EventBus::new(),
                ready: Some(ready_tx),
            }),
            alive: AtomicBool::new(true),
            shut: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            server_info: Mutex::new(None),
            user_info: Mutex::new(None),
            domain: Mutex::new(None),
            tunnels: Mutex::new(Vec::new()),
            files_cache: AsyncMutex::new(HashMap::new()),
            shell_cache: AsyncMutex::new(HashMap::new()),
            smart_cache: AsyncMutex::new(HashMap::new()),
        });

        tokio::spawn(write_loop(out_rx, sink));
        tokio::spawn(read_loop(Arc::clone(&inner), stream));
        debug!(url, "transport open, awaiting bootstrap");

        match ready_rx.await {
            Ok(Ok(())) => {
                info!(url, "session ready");
                Ok(Session { inner })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::closed()),
        }
    }

    /// Send a correlated request and wait for the reply carrying the same
    /// generated id. With a `timeout`, the wait races a timer; timing out
    /// abandons the waiter locally but does not cancel the server-side
    /// operation.
    pub async fn send_correlated(
        &self,
        mut payload: Value,
        name_hint: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, Error> {
        if !payload.is_object() {
            return Err(Error::Invalid("payload must be a JSON object".into()));
        }
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut st = self.inner.state.lock().unwrap();
            if !self.is_alive() {
                return Err(Error::closed());
            }
            st.correlations.register(name_hint, tx)
        };
        payload["tag"] = Value::String(id.clone());
        payload["responseid"] = Value::String(id.clone());
        if let Err(e) = self.send_frame(&payload) {
            self.inner.state.lock().unwrap().correlations.discard(&id);
            return Err(e);
        }
        match timeout {
            None => rx.await.map_err(|_| Error::closed())?,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(settled) => settled.map_err(|_| Error::closed())?,
                Err(_) => {
                    self.inner.state.lock().unwrap().correlations.discard(&id);
                    Err(Error::timeout())
                }
            },
        }
    }

    /// Degraded request variant keyed only by the payload's `action`.
    ///
    /// If two calls for the same action overlap, the server's first
    /// matching reply is delivered to whichever waiter registered first —
    /// which may not be the call that produced it. Callers are expected to
    /// avoid overlapping same-action requests.
    pub async fn send_unnamespaced(&self, payload: Value) -> Result<Value, Error> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Invalid("payload must carry an action".into()))?
            .to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.inner.state.lock().unwrap();
            if !self.is_alive() {
                return Err(Error::closed());
            }
            st.correlations.register_unnamespaced(&action, tx);
        }
        self.send_frame(&payload)?;
        rx.await.map_err(|_| Error::closed())?
    }

    /// Fire-and-forget send.
    pub fn post(&self, payload: Value) -> Result<(), Error> {
        self.send_frame(&payload)
    }

    /// Subscribe to unsolicited frames, optionally filtered. Every
    /// subscription also receives a [`Topic::Close`] event when the
    /// connection ends.
    pub fn subscribe(
        &self,
        filter: Option<EventFilter>,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<BusEvent>) {
        let mut st = self.inner.state.lock().unwrap();
        let (token, rx) = st.bus.subscribe(filter);
        if self.inner.shut.load(Ordering::SeqCst) {
            st.bus.close_all(&Error::closed());
        }
        (token, rx)
    }

    /// Cancel a subscription. Unknown tokens are ignored.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        self.inner.state.lock().unwrap().bus.unsubscribe(token);
    }

    /// Open a fresh tunnel to `node_id`, bypassing the reuse cache.
    pub async fn open_tunnel(
        &self,
        node_id: &str,
        protocol: TunnelProtocol,
    ) -> Result<Tunnel, Error> {
        Tunnel::open(self, node_id, protocol).await
    }

    /// File operations against `node_id`, reusing a cached client while its
    /// tunnel is still alive.
    pub async fn files(&self, node_id: &str) -> Result<Files, Error> {
        let mut cache = self.inner.files_cache.lock().await;
        if let Some(existing) = cache.get(node_id) {
            if existing.alive() {
                return Ok(existing.clone());
            }
        }
        let tunnel = Tunnel::open(self, node_id, TunnelProtocol::Files).await?;
        let files = Files::new(tunnel)?;
        cache.insert(node_id.to_string(), files.clone());
        Ok(files)
    }

    /// Raw terminal shell on `node_id`, reusing a cached shell while its
    /// tunnel is still alive.
    pub async fn shell(&self, node_id: &str) -> Result<Shell, Error> {
        let mut cache = self.inner.shell_cache.lock().await;
        if let Some(existing) = cache.get(node_id) {
            if existing.alive() {
                return Ok(existing.clone());
            }
        }
        let tunnel = Tunnel::open(self, node_id, TunnelProtocol::Terminal).await?;
        let shell = Shell::new(tunnel)?;
        cache.insert(node_id.to_string(), shell.clone());
        Ok(shell)
    }

    /// Prompt-driven shell on `node_id`, cached by (node, ready pattern).
    pub async fn smart_shell(
        &self,
        node_id: &str,
        ready_pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<SmartShell, Error> {
        let key = (node_id.to_string(), ready_pattern.to_string());
        let mut cache = self.inner.smart_cache.lock().await;
        if let Some(existing) = cache.get(&key) {
            if existing.alive() {
                return Ok(existing.clone());
            }
        }
        let tunnel = Tunnel::open(self, node_id, TunnelProtocol::Terminal).await?;
        let shell = Shell::new(tunnel)?;
        let smart = SmartShell::settle(shell, ready_pattern, timeout).await?;
        cache.insert(key, smart.clone());
        Ok(smart)
    }

    /// Close the connection. Every pending request fails, every
    /// subscription is notified, every owned tunnel is closed.
    pub fn close(&self) {
        let _ = self.inner.out.send(Message::Close(None));
        self.inner.shutdown(Error::closed());
    }

    /// True between transport open and close/failure.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// The server's bootstrap `serverinfo` frame, once received.
    pub fn server_info(&self) -> Option<Value> {
        self.inner.server_info.lock().unwrap().clone()
    }

    /// The server's bootstrap `userinfo` frame, once received.
    pub fn user_info(&self) -> Option<Value> {
        self.inner.user_info.lock().unwrap().clone()
    }

    /// Domain reported by the server at bootstrap.
    pub fn domain(&self) -> Option<String> {
        self.inner.domain.lock().unwrap().clone()
    }

    pub(crate) fn url(&self) -> &str {
        &self.inner.url
    }

    pub(crate) fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub(crate) fn register_tunnel(&self, tunnel: Tunnel) {
        self.inner.tunnels.lock().unwrap().push(tunnel);
    }

    fn send_frame(&self, payload: &Value) -> Result<(), Error> {
        if !self.is_alive() {
            return Err(Error::closed());
        }
        self.inner
            .out
            .send(Message::text(payload.to_string()))
            .map_err(|_| Error::closed())
    }
}

impl SessionInner {
    /// Route one inbound frame: bootstrap, correlated delivery, push
    /// broadcast, or the keyed compatibility broadcast — in that order.
    fn dispatch_frame(&self, frame: Value) {
        let action = frame
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match action.as_str() {
            "serverinfo" => {
                let domain = frame
                    .pointer("/serverinfo/domain")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                *self.domain.lock().unwrap() = domain;
                *self.server_info.lock().unwrap() = Some(frame);
                debug!("server info received");
            }
            "userinfo" => {
                *self.user_info.lock().unwrap() = Some(frame);
                let mut st = self.state.lock().unwrap();
                if let Some(ready) = st.ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            _ => {
                let correlation_id = frame
                    .get("tag")
                    .and_then(Value::as_str)
                    .or_else(|| frame.get("responseid").and_then(Value::as_str))
                    .map(str::to_owned);
                let mut st = self.state.lock().unwrap();
                let mut delivered = false;
                if let Some(id) = correlation_id {
                    delivered = st.correlations.settle(&id, frame.clone());
                }
                if matches!(action.as_str(), "event" | "msg" | "interuser") {
                    // Pushes reach the bus even when a correlated waiter
                    // already took the frame.
                    st.bus.broadcast(Topic::Push, &frame);
                } else if !delivered
                    && !st.correlations.settle_unnamespaced(&action, frame.clone())
                {
                    st.bus.broadcast(Topic::Action(action), &frame);
                }
            }
        }
    }

    /// Idempotent failure fan-out: reject readiness, fail every waiter,
    /// notify every subscription, close every owned tunnel.
    fn shutdown(&self, reason: Error) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        {
            let mut st = self.state.lock().unwrap();
            if let Some(ready) = st.ready.take() {
                let _ = ready.send(Err(reason.clone()));
            }
            st.correlations.fail_all(&reason);
            st.bus.close_all(&reason);
        }
        let tunnels: Vec<Tunnel> = self.tunnels.lock().unwrap().drain(..).collect();
        for tunnel in &tunnels {
            tunnel.close();
        }
        info!(reason = %reason, tunnels = tunnels.len(), "session closed");
    }
}

/// Forward queued outbound frames to the socket until it fails or a close
/// frame goes out.
pub(crate) async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<SessionInner>, mut stream: futures_util::stream::SplitStream<WsStream>) {
    let reason = loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break Error::closed(),
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(text.as_str()) {
                    Ok(frame) => inner.dispatch_frame(frame),
                    Err(e) => warn!(error = %e, "discarding non-JSON control frame"),
                },
                Some(Ok(Message::Close(_))) | None => break Error::closed(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Error::Transport(e.to_string()),
            },
        }
    };
    inner.shutdown(reason);
}
