//! File-transfer sub-protocol, carried over a files tunnel.
//!
//! The relay stream multiplexes untagged frames, so every operation funnels
//! through one FIFO queue: a request is dispatched only while the transport
//! is alive, and the next queued request waits until the current one
//! resolves. Control frames are JSON (first wire byte `{`); data frames are
//! raw binary and always lead with a `0x00` byte so the two can never be
//! confused on the wire.
//!
//! Flow control differs by direction: uploads are windowed (several chunks
//! unacknowledged at once, bounded by an in-flight counter), downloads are
//! stop-and-wait (one frame outstanding, each non-final frame acknowledged
//! before the next is sent).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::tunnel::{is_liveness_probe, Tunnel};

/// Bytes of source data per upload chunk.
const UPLOAD_CHUNK_SIZE: usize = 65536;

/// Maximum unacknowledged upload chunks in flight.
const UPLOAD_WINDOW: usize = 8;

/// Low bit of the fourth header byte marks the final download frame.
const DOWNLOAD_FINAL_FLAG: u8 = 0x01;

/// Result of a download. `complete` is false when the peer cancelled the
/// transfer; `bytes` then reports how much reached the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub bytes: u64,
    pub complete: bool,
}

/// File operations against one managed node.
///
/// Clones share the same tunnel and request queue.
#[derive(Clone)]
pub struct Files {
    inner: Arc<FilesInner>,
}

struct FilesInner {
    tunnel: Tunnel,
    /// Fair mutex over the inbound frame stream — lock acquisition order is
    /// the FIFO request queue.
    io: Mutex<FilesIo>,
    next_reqid: AtomicU32,
}

struct FilesIo {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Files {
    pub(crate) fn new(tunnel: Tunnel) -> Result<Files, Error> {
        let rx = tunnel
            .take_frames()
            .ok_or_else(|| Error::Invalid("tunnel frame stream already taken".into()))?;
        Ok(Files {
            inner: Arc::new(FilesInner {
                tunnel,
                io: Mutex::new(FilesIo { rx }),
                next_reqid: AtomicU32::new(1),
            }),
        })
    }

    /// True while the underlying tunnel is open.
    pub fn alive(&self) -> bool {
        self.inner.tunnel.alive()
    }

    /// The tunnel this client runs over.
    pub fn tunnel(&self) -> &Tunnel {
        &self.inner.tunnel
    }

    /// Close the underlying tunnel. Queued requests fail with a
    /// closed-connection outcome.
    pub fn close(&self) {
        self.inner.tunnel.close();
    }

    /// List a remote directory.
    pub async fn list(&self, path: &str) -> Result<Value, Error> {
        let reqid = self.reqid();
        self.request(json!({ "action": "ls", "reqid": reqid, "path": path }))
            .await
    }

    /// Create a remote directory.
    pub async fn mkdir(&self, path: &str) -> Result<Value, Error> {
        let reqid = self.reqid();
        self.request(json!({ "action": "mkdir", "reqid": reqid, "path": path }))
            .await
    }

    /// Remove entries named in `names` under `path`.
    pub async fn remove(&self, path: &str, names: &[&str], recursive: bool) -> Result<Value, Error> {
        let reqid = self.reqid();
        self.request(json!({
            "action": "rm",
            "reqid": reqid,
            "path": path,
            "delfiles": names,
            "rec": recursive,
        }))
        .await
    }

    /// Rename one entry under `path`.
    pub async fn rename(&self, path: &str, old_name: &str, new_name: &str) -> Result<Value, Error> {
        let reqid = self.reqid();
        self.request(json!({
            "action": "rename",
            "reqid": reqid,
            "path": path,
            "oldname": old_name,
            "newname": new_name,
        }))
        .await
    }

    /// Upload `source` to `path`/`name` on the node. Returns the number of
    /// source bytes sent.
    ///
    /// Chunks are streamed with up to [`UPLOAD_WINDOW`] unacknowledged at a
    /// time; the operation completes once the source is exhausted and the
    /// in-flight count returns to zero. A peer error frame fails the whole
    /// upload.
    pub async fn upload<R>(&self, mut source: R, path: &str, name: &str) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut io = self.inner.io.lock().await;
        self.ensure_alive()?;
        let reqid = self.reqid();
        self.inner.tunnel.send_json(&json!({
            "action": "upload",
            "reqid": reqid,
            "path": path,
            "name": name,
        }))?;

        // The peer must accept the transfer before any data flows.
        loop {
            let reply = next_json(&mut io.rx).await?;
            match reply["action"].as_str() {
                Some("uploadstart") => break,
                Some("uploaderror") => return Err(Error::Server(reply)),
                _ => {}
            }
        }

        let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];
        let mut in_flight = 0usize;
        let mut sent = 0u64;
        let mut exhausted = false;

        loop {
            while !exhausted && in_flight < UPLOAD_WINDOW {
                let n = read_chunk(&mut source, &mut chunk)
                    .await
                    .map_err(|e| Error::Transport(format!("source read failed: {e}")))?;
                if n == 0 {
                    exhausted = true;
                    break;
                }
                self.inner.tunnel.send_binary(encode_upload_chunk(&chunk[..n]))?;
                in_flight += 1;
                sent += n as u64;
            }
            if exhausted && in_flight == 0 {
                break;
            }
            let reply = next_json(&mut io.rx).await?;
            match reply["action"].as_str() {
                Some("uploadack") => in_flight = in_flight.saturating_sub(1),
                Some("uploaderror") => return Err(Error::Server(reply)),
                _ => {}
            }
        }

        self.inner
            .tunnel
            .send_json(&json!({ "action": "uploaddone", "reqid": reqid }))?;
        info!(path, name, bytes = sent, "upload complete");
        Ok(sent)
    }

    /// Download the remote file at `path` into `sink`.
    ///
    /// Stop-and-wait: every non-final data frame is acknowledged before the
    /// peer sends the next one; the final frame (low bit of the fourth
    /// header byte) ends the stream without an acknowledgment. A peer
    /// cancel ends the transfer early with `complete == false`.
    pub async fn download<W>(&self, path: &str, mut sink: W) -> Result<DownloadOutcome, Error>
    where
        W: AsyncWrite + Unpin,
    {
        let mut io = self.inner.io.lock().await;
        self.ensure_alive()?;
        let id = self.reqid();
        self.inner.tunnel.send_json(&json!({
            "action": "download",
            "sub": "start",
            "id": id,
            "path": path,
        }))?;

        let mut written = 0u64;
        loop {
            let frame = io.rx.recv().await.ok_or_else(Error::closed)?;
            if is_liveness_probe(&frame) {
                continue;
            }
            if frame.first() == Some(&b'{') {
                let Ok(control) = serde_json::from_slice::<Value>(&frame) else {
                    warn!("discarding malformed control frame during download");
                    continue;
                };
                if control["action"].as_str() != Some("download") {
                    continue;
                }
                match control["sub"].as_str() {
                    Some("startack") => {
                        debug!(path, "download stream starting");
                    }
                    Some("cancel") => {
                        sink.flush()
                            .await
                            .map_err(|e| Error::Transport(format!("sink flush failed: {e}")))?;
                        info!(path, bytes = written, "download cancelled by peer");
                        return Ok(DownloadOutcome {
                            bytes: written,
                            complete: false,
                        });
                    }
                    _ => {}
                }
                continue;
            }

            // Data frame: 4-byte header, then payload.
            if frame.len() < 4 {
                warn!(len = frame.len(), "discarding short data frame");
                continue;
            }
            let last = frame[3] & DOWNLOAD_FINAL_FLAG != 0;
            let payload = &frame[4..];
            sink.write_all(payload)
                .await
                .map_err(|e| Error::Transport(format!("sink write failed: {e}")))?;
            written += payload.len() as u64;
            if last {
                sink.flush()
                    .await
                    .map_err(|e| Error::Transport(format!("sink flush failed: {e}")))?;
                info!(path, bytes = written, "download complete");
                return Ok(DownloadOutcome {
                    bytes: written,
                    complete: true,
                });
            }
            self.inner.tunnel.send_json(&json!({
                "action": "download",
                "sub": "ack",
                "id": id,
            }))?;
        }
    }

    /// Dispatch one JSON request and wait for the next control reply.
    async fn request(&self, payload: Value) -> Result<Value, Error> {
        let mut io = self.inner.io.lock().await;
        self.ensure_alive()?;
        self.inner.tunnel.send_json(&payload)?;
        next_json(&mut io.rx).await
    }

    fn ensure_alive(&self) -> Result<(), Error> {
        if self.inner.tunnel.alive() {
            Ok(())
        } else {
            Err(Error::closed())
        }
    }

    fn reqid(&self) -> u32 {
        self.inner.next_reqid.fetch_add(1, Ordering::Relaxed)
    }
}

/// Wait for the next JSON control frame, skipping liveness probes and any
/// stray binary frames.
async fn next_json(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Result<Value, Error> {
    loop {
        let frame = rx.recv().await.ok_or_else(Error::closed)?;
        if is_liveness_probe(&frame) {
            continue;
        }
        if frame.first() == Some(&b'{') {
            match serde_json::from_slice(&frame) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(error = %e, "discarding malformed control frame");
                }
            }
        } else {
            warn!("discarding unexpected data frame while awaiting control reply");
        }
    }
}

/// Fill `buf` from `source`, short only at end of stream.
async fn read_chunk<R: AsyncRead + Unpin>(
    source: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Frame an upload chunk for the wire.
///
/// Control frames start with `{`, so data frames carry a reserved leading
/// `0x00` byte; the receiver strips it. The prefix applies to every chunk —
/// including those already starting with `0x00` or `{`, which is exactly
/// why a literal prefix byte is needed rather than sending the chunk raw.
fn encode_upload_chunk(chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(chunk.len() + 1);
    frame.push(0);
    frame.extend_from_slice(chunk);
    frame
}
