//! Interactive shell scripting over a terminal tunnel.
//!
//! [`Shell`] exposes raw write/read/expect against an accumulation buffer
//! fed by the tunnel's inbound frames. Blocking reads wait on a
//! [`Notify`] woken on every append rather than polling on an interval.
//! [`SmartShell`] layers a prompt-recognition pattern on top, turning the
//! byte stream into synchronous command/response pairs.
//!
//! The buffer only stays bounded because consumption is caller-driven —
//! script against it with `read`/`expect`, or it grows with every frame.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::bytes::Regex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::error::Error;
use crate::tunnel::{is_liveness_probe, Tunnel};

/// Most bytes attached to a failed `expect` when the caller asked to keep
/// data on timeout.
const EXPECT_KEEP_LIMIT: usize = 1024;

/// Append-only byte accumulator with wake-on-append semantics.
pub(crate) struct StreamBuffer {
    state: Mutex<BufState>,
    notify: Notify,
}

struct BufState {
    data: Vec<u8>,
    closed: bool,
}

impl StreamBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BufState {
                data: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Append received bytes and wake every waiter.
    pub(crate) fn append(&self, bytes: &[u8]) {
        let mut st = self.state.lock().unwrap();
        st.data.extend_from_slice(bytes);
        drop(st);
        self.notify.notify_waiters();
    }

    /// Mark the stream ended. Buffered bytes stay readable.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    /// Drain everything currently buffered, without waiting.
    pub(crate) fn drain_all(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().data)
    }

    /// Wait until at least `want` bytes are buffered, then drain exactly
    /// that many. On timeout or closure the buffer is left untouched unless
    /// `keep_on_failure`, in which case up to `want` bytes are sliced out
    /// and attached to the error.
    pub(crate) async fn read_at_least(
        &self,
        want: usize,
        timeout: Option<Duration>,
        keep_on_failure: bool,
    ) -> Result<Vec<u8>, Error> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if st.data.len() >= want {
                    return Ok(drain(&mut st.data, want));
                }
                if st.closed {
                    let partial = keep_on_failure.then(|| {
                        let n = st.data.len().min(want);
                        drain(&mut st.data, n)
                    });
                    return Err(Error::Closed { partial });
                }
            }
            match deadline {
                None => notified.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        let mut st = self.state.lock().unwrap();
                        let partial = keep_on_failure.then(|| {
                            let n = st.data.len().min(want);
                            drain(&mut st.data, n)
                        });
                        return Err(Error::Timeout { partial });
                    }
                }
            }
        }
    }

    /// Wait for the first match of `pattern` anywhere in the buffer, then
    /// drain through the end of the match inclusive and return the drained
    /// bytes. On timeout or closure with `keep_on_failure`, best-effort
    /// drains up to [`EXPECT_KEEP_LIMIT`] bytes into the error.
    pub(crate) async fn expect(
        &self,
        pattern: &Regex,
        timeout: Option<Duration>,
        keep_on_failure: bool,
    ) -> Result<Vec<u8>, Error> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if let Some(found) = pattern.find(&st.data) {
                    let end = found.end();
                    return Ok(drain(&mut st.data, end));
                }
                if st.closed {
                    let partial = keep_on_failure.then(|| {
                        let n = st.data.len().min(EXPECT_KEEP_LIMIT);
                        drain(&mut st.data, n)
                    });
                    return Err(Error::Closed { partial });
                }
            }
            match deadline {
                None => notified.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        let mut st = self.state.lock().unwrap();
                        let partial = keep_on_failure.then(|| {
                            let n = st.data.len().min(EXPECT_KEEP_LIMIT);
                            drain(&mut st.data, n)
                        });
                        return Err(Error::Timeout { partial });
                    }
                }
            }
        }
    }
}

/// Slice `n` bytes off the front.
fn drain(data: &mut Vec<u8>, n: usize) -> Vec<u8> {
    let rest = data.split_off(n);
    std::mem::replace(data, rest)
}

/// Raw byte-stream access to a terminal tunnel.
///
/// Clones share the same tunnel and accumulation buffer.
#[derive(Clone)]
pub struct Shell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    tunnel: Tunnel,
    buffer: Arc<StreamBuffer>,
}

impl Shell {
    pub(crate) fn new(tunnel: Tunnel) -> Result<Shell, Error> {
        let rx = tunnel
            .take_frames()
            .ok_or_else(|| Error::Invalid("tunnel frame stream already taken".into()))?;
        let buffer = Arc::new(StreamBuffer::new());
        tokio::spawn(pump(Arc::clone(&buffer), rx));
        Ok(Shell {
            inner: Arc::new(ShellInner { tunnel, buffer }),
        })
    }

    /// Fire-and-forget send of raw bytes to the remote terminal.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        self.inner.tunnel.send_binary(data.to_vec())
    }

    /// Read from the accumulation buffer.
    ///
    /// With `len == None`, resolves immediately with whatever is buffered
    /// (possibly nothing) — a non-blocking drain. With `len == Some(n)`,
    /// waits until at least `n` bytes have accumulated, the connection
    /// closes, or `timeout` elapses; `keep_on_timeout` controls whether the
    /// failure carries (and consumes) the partial data or leaves the buffer
    /// untouched for a later read.
    pub async fn read(
        &self,
        len: Option<usize>,
        timeout: Option<Duration>,
        keep_on_timeout: bool,
    ) -> Result<Vec<u8>, Error> {
        match len {
            None => Ok(self.inner.buffer.drain_all()),
            Some(want) => {
                self.inner
                    .buffer
                    .read_at_least(want, timeout, keep_on_timeout)
                    .await
            }
        }
    }

    /// Wait for `pattern` to match anywhere in the buffer, consuming through
    /// the end of the match. The returned bytes include the matched text —
    /// callers locate the match boundary themselves.
    pub async fn expect(
        &self,
        pattern: &Regex,
        timeout: Option<Duration>,
        keep_on_timeout: bool,
    ) -> Result<Vec<u8>, Error> {
        self.inner
            .buffer
            .expect(pattern, timeout, keep_on_timeout)
            .await
    }

    /// True while the underlying tunnel is open.
    pub fn alive(&self) -> bool {
        self.inner.tunnel.alive()
    }

    /// The tunnel this shell runs over.
    pub fn tunnel(&self) -> &Tunnel {
        &self.inner.tunnel
    }

    /// Close the underlying tunnel. Buffered bytes remain readable.
    pub fn close(&self) {
        self.inner.tunnel.close();
    }
}

/// Feed tunnel frames into the buffer, dropping liveness probes.
async fn pump(buffer: Arc<StreamBuffer>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if is_liveness_probe(&frame) {
            continue;
        }
        buffer.append(&frame);
    }
    debug!("terminal stream ended");
    buffer.close();
}

/// A [`Shell`] plus a prompt-recognition pattern, exposing a synchronous
/// command/response interface.
#[derive(Clone)]
pub struct SmartShell {
    inner: Arc<SmartShellInner>,
}

impl std::fmt::Debug for SmartShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartShell")
            .field("pattern", &self.inner.pattern)
            .finish_non_exhaustive()
    }
}

struct SmartShellInner {
    shell: Shell,
    ready: Regex,
    pattern: String,
}

impl SmartShell {
    /// Wrap a shell and wait for it to become ready.
    ///
    /// The remote terminal emits its initial prompt twice on a fresh
    /// session; both are waited out here so the first command's output is
    /// clean. Observed against the live server — do not collapse to a
    /// single wait without re-verifying.
    pub(crate) async fn settle(
        shell: Shell,
        ready_pattern: &str,
        timeout: Option<Duration>,
    ) -> Result<SmartShell, Error> {
        let ready = Regex::new(ready_pattern)
            .map_err(|e| Error::Invalid(format!("bad ready pattern: {e}")))?;
        shell.expect(&ready, timeout, false).await?;
        shell.expect(&ready, timeout, false).await?;
        Ok(SmartShell {
            inner: Arc::new(SmartShellInner {
                shell,
                ready,
                pattern: ready_pattern.to_string(),
            }),
        })
    }

    /// Run one command and return its output with the trailing prompt
    /// stripped. A missing trailing newline is appended before sending.
    pub async fn send_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, Error> {
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.inner.shell.write(line.as_bytes())?;
        let output = self.inner.shell.expect(&self.inner.ready, timeout, false).await?;
        let cut = self
            .inner
            .ready
            .find(&output)
            .map_or(output.len(), |m| m.start());
        Ok(output[..cut].to_vec())
    }

    /// The ready pattern this shell was built with.
    pub fn ready_pattern(&self) -> &str {
        &self.inner.pattern
    }

    /// The underlying raw shell.
    pub fn shell(&self) -> &Shell {
        &self.inner.shell
    }

    /// True while the underlying tunnel is open.
    pub fn alive(&self) -> bool {
        self.inner.shell.alive()
    }

    /// Close the underlying tunnel.
    pub fn close(&self) {
        self.inner.shell.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::Message;

    #[tokio::test]
    async fn empty_unsized_read_resolves_immediately() {
        let (tunnel, _out, _inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(10), shell.read(None, None, false))
            .await
            .expect("read(None) must not block");
        assert_eq!(result.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn sized_read_waits_for_enough_bytes() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();

        let reader = {
            let shell = shell.clone();
            tokio::spawn(async move { shell.read(Some(6), None, false).await })
        };
        inject.send(b"abc".to_vec()).unwrap();
        inject.send(b"defgh".to_vec()).unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), b"abcdef");
        // The remainder stays buffered.
        assert_eq!(shell.read(None, None, false).await.unwrap(), b"gh");
    }

    #[tokio::test]
    async fn timed_out_read_leaves_buffer_unless_told_to_keep() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject.send(b"abc".to_vec()).unwrap();
        // Give the pump a beat to move the frame into the buffer.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = shell
            .read(Some(5), Some(Duration::from_millis(30)), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { partial: None }));
        assert_eq!(shell.read(None, None, false).await.unwrap(), b"abc");

        inject.send(b"abc".to_vec()).unwrap();
        let err = shell
            .read(Some(5), Some(Duration::from_millis(30)), true)
            .await
            .unwrap_err();
        match err {
            Error::Timeout { partial: Some(p) } => assert_eq!(p, b"abc"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(shell.read(None, None, false).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn expect_consumes_through_end_of_match() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject.send(b"foo READY\nbar".to_vec()).unwrap();

        let pattern = Regex::new("READY\n").unwrap();
        let consumed = shell.expect(&pattern, None, false).await.unwrap();
        assert_eq!(consumed, b"foo READY\n");
        assert_eq!(shell.read(None, None, false).await.unwrap(), b"bar");
    }

    #[tokio::test]
    async fn expect_timeout_keeps_up_to_limit() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject.send(vec![b'x'; 2000]).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pattern = Regex::new("never-matches").unwrap();
        let err = shell
            .expect(&pattern, Some(Duration::from_millis(30)), true)
            .await
            .unwrap_err();
        match err {
            Error::Timeout { partial: Some(p) } => assert_eq!(p.len(), 1024),
            other => panic!("unexpected error: {other:?}"),
        }
        // The rest is still buffered.
        assert_eq!(shell.read(None, None, false).await.unwrap().len(), 976);
    }

    #[tokio::test]
    async fn liveness_probes_never_reach_the_buffer() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject
            .send(br#"{"ctrlChannel":"102938","type":"ping"}"#.to_vec())
            .unwrap();
        inject.send(b"real data".to_vec()).unwrap();

        let data = shell.read(Some(9), None, false).await.unwrap();
        assert_eq!(data, b"real data");
    }

    #[tokio::test]
    async fn closed_stream_fails_blocked_reads() {
        let (tunnel, _out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject.send(b"ab".to_vec()).unwrap();
        drop(inject);

        let err = shell.read(Some(5), None, false).await.unwrap_err();
        assert!(matches!(err, Error::Closed { partial: None }));
        // Already-buffered bytes remain available.
        assert_eq!(shell.read(None, None, false).await.unwrap(), b"ab");
    }

    #[tokio::test]
    async fn write_sends_binary_frames() {
        let (tunnel, mut out, _inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        shell.write(b"whoami\n").unwrap();
        match out.recv().await.unwrap() {
            Message::Binary(b) => assert_eq!(b.to_vec(), b"whoami\n"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn smart_shell_settles_after_two_prompts() {
        let (tunnel, mut out, inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        inject.send(b"# # ".to_vec()).unwrap();

        let smart = SmartShell::settle(shell, "# ", Some(Duration::from_secs(1)))
            .await
            .unwrap();

        let peer = tokio::spawn(async move {
            match out.recv().await.unwrap() {
                // The newline is appended for the caller.
                Message::Binary(b) => assert_eq!(b.to_vec(), b"uptime\n"),
                other => panic!("unexpected frame: {other:?}"),
            }
            inject.send(b"up 3 days\n# ".to_vec()).unwrap();
        });

        let output = smart
            .send_command("uptime", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(output, b"up 3 days\n");
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn smart_shell_rejects_bad_pattern() {
        let (tunnel, _out, _inject) = Tunnel::loopback();
        let shell = Shell::new(tunnel).unwrap();
        let err = SmartShell::settle(shell, "(unclosed", None).await.unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }
}
