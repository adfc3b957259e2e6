//! Relay tunnels — secondary, node-scoped connections.
//!
//! A tunnel carries either interactive terminal bytes or the file
//! sub-protocol between this client and one managed node, bridged by the
//! server's relay endpoint. The handshake runs in two phases: a short-lived
//! auth cookie pair is fetched over the primary connection, then the server
//! is asked to prepare a relay endpoint for (node, protocol, tunnel id)
//! before the secondary socket is opened — the primary credential never
//! travels on the relay URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::session::{build_connector, write_loop, Session, WsStream};

/// Path component of the relay endpoint, substituted for the control path
/// when deriving the secondary URL.
pub(crate) const RELAY_PATH: &str = "meshrelay.ashx";

/// Exact marker the relay sends first when the session is being recorded.
const RECORDING_MARKER: &[u8] = b"cr";

/// Which sub-protocol a tunnel carries. Other selector values are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelProtocol {
    /// Interactive terminal byte stream.
    Terminal,
    /// File-transfer sub-protocol.
    Files,
}

impl TunnelProtocol {
    /// Numeric selector carried in relay URLs and echoed as the first
    /// outbound relay frame.
    pub fn selector(self) -> u8 {
        match self {
            TunnelProtocol::Terminal => 1,
            TunnelProtocol::Files => 5,
        }
    }
}

/// A secondary connection scoped to one managed node.
///
/// Alive only between handshake completion and socket closure; one `Tunnel`
/// drives exactly one secondary socket. Clones share the same connection.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("node_id", &self.inner.node_id)
            .field("tunnel_id", &self.inner.tunnel_id)
            .finish_non_exhaustive()
    }
}

struct TunnelInner {
    node_id: String,
    protocol: TunnelProtocol,
    tunnel_id: String,
    url: String,
    recording: bool,
    alive: AtomicBool,
    out: mpsc::UnboundedSender<Message>,
    frames: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl Tunnel {
    /// Perform the relay handshake and open the secondary socket.
    ///
    /// Fails with the server's payload if the relay-prepare request is not
    /// acknowledged with an explicit `"OK"`; in that case no secondary
    /// socket is opened.
    pub(crate) async fn open(
        session: &Session,
        node_id: &str,
        protocol: TunnelProtocol,
    ) -> Result<Tunnel, Error> {
        if node_id.is_empty() {
            return Err(Error::Invalid("node id must not be empty".into()));
        }

        // Phase one: short-lived cookie pair. `rcookie` authorizes the
        // relay-prepare request, `cookie` authenticates the secondary
        // socket itself.
        let cookies = session
            .send_unnamespaced(json!({ "action": "authcookie" }))
            .await?;
        let rcookie = cookies["rcookie"]
            .as_str()
            .ok_or_else(|| Error::Server(cookies.clone()))?
            .to_string();
        let auth = cookies["cookie"]
            .as_str()
            .ok_or_else(|| Error::Server(cookies.clone()))?
            .to_string();

        let tunnel_id = Uuid::new_v4().simple().to_string();
        let selector = protocol.selector();

        // Phase two: ask the server to stand up a relay endpoint for this
        // (node, protocol, tunnel id). Anything but "OK" is a refusal.
        let fragment = format!(
            "*/{}?p={}&nodeid={}&id={}&rauth={}",
            RELAY_PATH, selector, node_id, tunnel_id, rcookie
        );
        let ack = session
            .send_correlated(
                json!({
                    "action": "msg",
                    "type": "tunnel",
                    "nodeid": node_id,
                    "value": fragment,
                }),
                "tunnel",
                None,
            )
            .await?;
        if ack["result"].as_str() != Some("OK") {
            return Err(Error::Server(ack));
        }

        let url = relay_url(
            session.url(),
            &format!(
                "browser=1&p={}&nodeid={}&id={}&auth={}",
                selector, node_id, tunnel_id, auth
            ),
        );

        debug!(node_id, tunnel_id = %tunnel_id, "connecting relay socket");
        let connector = build_connector(session.options())?;
        let (ws, _response) = tokio_tungstenite::connect_async_tls_with_config(
            url.as_str(),
            None,
            false,
            connector,
        )
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        // The very first inbound relay frame signals whether the session is
        // being recorded; the client answers with the protocol selector.
        let marker = loop {
            match stream.next().await {
                None | Some(Ok(Message::Close(_))) => return Err(Error::closed()),
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                Some(Ok(Message::Text(t))) => break t.as_bytes().to_vec(),
                Some(Ok(Message::Binary(b))) => break b.to_vec(),
                Some(Ok(_)) => continue,
            }
        };
        let recording = marker == RECORDING_MARKER;
        sink.send(Message::text(selector.to_string()))
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner = Arc::new(TunnelInner {
            node_id: node_id.to_string(),
            protocol,
            tunnel_id,
            url,
            recording,
            alive: AtomicBool::new(true),
            out: out_tx,
            frames: Mutex::new(Some(frame_rx)),
            cancel: cancel.clone(),
        });

        tokio::spawn(write_loop(out_rx, sink));
        tokio::spawn(read_loop(Arc::clone(&inner), stream, frame_tx, cancel));

        info!(
            node_id = %inner.node_id,
            tunnel_id = %inner.tunnel_id,
            selector,
            recording,
            "tunnel ready"
        );
        let tunnel = Tunnel { inner };
        session.register_tunnel(tunnel.clone());
        Ok(tunnel)
    }

    /// Id of the managed node this tunnel is scoped to.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Sub-protocol this tunnel carries.
    pub fn protocol(&self) -> TunnelProtocol {
        self.inner.protocol
    }

    /// Random hex identifier generated for the relay handshake.
    pub fn tunnel_id(&self) -> &str {
        &self.inner.tunnel_id
    }

    /// The relay endpoint URL this tunnel connected to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Whether the relay announced that the session is recorded.
    pub fn recording(&self) -> bool {
        self.inner.recording
    }

    /// True between handshake completion and socket closure.
    pub fn alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Close the secondary socket. Frames already handed to the consumer
    /// remain readable; subsequent writes fail.
    pub fn close(&self) {
        if self.inner.alive.swap(false, Ordering::SeqCst) {
            let _ = self.inner.out.send(Message::Close(None));
            self.inner.cancel.cancel();
        }
    }

    /// Take the inbound frame stream. Yields each received frame's bytes in
    /// arrival order and ends when the socket closes. Can be taken once.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.inner.frames.lock().unwrap().take()
    }

    /// Send a raw text frame.
    pub fn send_text(&self, text: &str) -> Result<(), Error> {
        self.send(Message::text(text.to_string()))
    }

    /// Send a raw binary frame.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        self.send(Message::binary(data))
    }

    /// Serialize a control frame and send it as text.
    pub fn send_json(&self, payload: &Value) -> Result<(), Error> {
        self.send_text(&payload.to_string())
    }

    fn send(&self, message: Message) -> Result<(), Error> {
        if !self.alive() {
            return Err(Error::closed());
        }
        self.inner.out.send(message).map_err(|_| Error::closed())
    }

    /// Build a tunnel over in-process channels instead of a socket: the
    /// returned receiver observes everything the tunnel sends, the sender
    /// injects inbound frames. Dropping the sender ends the frame stream.
    #[cfg(test)]
    pub(crate) fn loopback() -> (
        Tunnel,
        mpsc::UnboundedReceiver<Message>,
        mpsc::UnboundedSender<Vec<u8>>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let tunnel = Tunnel {
            inner: Arc::new(TunnelInner {
                node_id: "node//test".to_string(),
                protocol: TunnelProtocol::Files,
                tunnel_id: "cafe".to_string(),
                url: "ws://loopback/meshrelay.ashx".to_string(),
                recording: false,
                alive: AtomicBool::new(true),
                out: out_tx,
                frames: Mutex::new(Some(frame_rx)),
                cancel: CancellationToken::new(),
            }),
        };
        (tunnel, out_rx, frame_tx)
    }
}

async fn read_loop(
    inner: Arc<TunnelInner>,
    mut stream: futures_util::stream::SplitStream<WsStream>,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Text(t))) => {
                    if frames.send(t.as_bytes().to_vec()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(b))) => {
                    if frames.send(b.to_vec()).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(node_id = %inner.node_id, error = %e, "relay socket error");
                    break;
                }
            },
        }
    }
    inner.alive.store(false, Ordering::SeqCst);
}

/// Swap the control path of the primary URL for the relay path, keeping
/// scheme, host, and port.
pub(crate) fn relay_url(control_url: &str, query: &str) -> String {
    let scheme_end = control_url.find("://").map_or(0, |i| i + 3);
    let path_start = control_url[scheme_end..]
        .find('/')
        .map_or(control_url.len(), |i| scheme_end + i);
    format!("{}/{}?{}", &control_url[..path_start], RELAY_PATH, query)
}

/// Frames matching the liveness-probe control shape exactly are internal
/// and never reach protocol consumers.
pub(crate) fn is_liveness_probe(frame: &[u8]) -> bool {
    if frame.first() != Some(&b'{') {
        return false;
    }
    match serde_json::from_slice::<Value>(frame) {
        Ok(v) => v.get("ctrlChannel").and_then(Value::as_str) == Some("102938"),
        Err(_) => false,
    }
}
