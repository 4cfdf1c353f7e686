/// Bounded output collection
///
/// Both streams are drained on their own threads from the moment the child is
/// spawned. Bytes past the per-stream ceiling are read and discarded so the
/// child never blocks on a full pipe; the capture only records that it happened.
/// stdout can also be scanned for score lines as it streams, so a score printed
/// after the ceiling is still seen.
use crate::verdict::extractor::{ScoreRecord, ScoreScanner};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Output limits configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    /// Per-stream stdout limit (bytes)
    pub max_stdout_bytes: usize,
    /// Per-stream stderr limit (bytes)
    pub max_stderr_bytes: usize,
    /// How long to wait for the streams to close once the child is gone (milliseconds)
    pub collection_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            max_stdout_bytes: 1024 * 1024,
            max_stderr_bytes: 256 * 1024,
            collection_timeout_ms: 5000,
        }
    }
}

/// Captured head of one stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    /// More was written than retained, or the stream never closed
    pub truncated: bool,
    /// Last score line over everything the stream carried, retained or not
    pub score: Option<ScoreRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct CollectedOutput {
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
}

/// Output collector with bounded collection
pub struct OutputCollector {
    limits: OutputLimits,
    score_line_limit: Option<usize>,
}

impl OutputCollector {
    pub fn new(limits: OutputLimits) -> Self {
        OutputCollector {
            limits,
            score_line_limit: None,
        }
    }

    /// Scan stdout for score lines up to `max_line_bytes` long
    pub fn scanning_stdout(mut self, max_line_bytes: usize) -> Self {
        self.score_line_limit = Some(max_line_bytes);
        self
    }

    /// Start draining. Must be called right after spawn, before waiting on the child.
    pub fn start<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> PendingOutput
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let scanner = self.score_line_limit.map(ScoreScanner::new);
        PendingOutput {
            stdout: stdout
                .map(|s| spawn_reader("stdout", s, self.limits.max_stdout_bytes, scanner)),
            stderr: stderr
                .map(|s| spawn_reader("stderr", s, self.limits.max_stderr_bytes, None)),
            timeout: Duration::from_millis(self.limits.collection_timeout_ms),
        }
    }
}

/// Capture state shared between a reader thread and `finish`
struct Drain {
    capture: StreamCapture,
    limit: usize,
    scanner: Option<ScoreScanner>,
}

impl Drain {
    fn new(limit: usize, scanner: Option<ScoreScanner>) -> Self {
        Self {
            capture: StreamCapture {
                bytes: Vec::with_capacity(limit.min(64 * 1024)),
                ..StreamCapture::default()
            },
            limit,
            scanner,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if let Some(scanner) = self.scanner.as_mut() {
            scanner.feed(chunk);
        }
        let room = self.limit.saturating_sub(self.capture.bytes.len());
        if chunk.len() > room {
            self.capture.truncated = true;
        }
        self.capture
            .bytes
            .extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(&mut self) -> StreamCapture {
        let mut capture = std::mem::take(&mut self.capture);
        if let Some(scanner) = self.scanner.take() {
            capture.score = scanner.finish();
        }
        capture
    }
}

/// One reader in flight
struct Reader {
    state: Arc<Mutex<Drain>>,
    done: Receiver<()>,
}

/// Readers in flight
pub struct PendingOutput {
    stdout: Option<Reader>,
    stderr: Option<Reader>,
    timeout: Duration,
}

impl PendingOutput {
    /// Wait for both streams to close. A stream still open at the deadline
    /// (a descendant kept the pipe) keeps what was read so far and is
    /// reported as truncated.
    pub fn finish(self) -> CollectedOutput {
        let deadline = Instant::now() + self.timeout;
        CollectedOutput {
            stdout: receive(self.stdout, deadline, "stdout"),
            stderr: receive(self.stderr, deadline, "stderr"),
        }
    }
}

fn receive(reader: Option<Reader>, deadline: Instant, name: &str) -> StreamCapture {
    let Some(reader) = reader else {
        return StreamCapture::default();
    };
    let closed = match reader.done.recv_deadline(deadline) {
        Ok(()) => true,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("{} did not close before the collection deadline", name);
            false
        }
        Err(RecvTimeoutError::Disconnected) => {
            log::warn!("{} collector exited without a result", name);
            false
        }
    };

    let mut state = reader.state.lock().unwrap_or_else(PoisonError::into_inner);
    let mut capture = state.finish();
    if !closed {
        capture.truncated = true;
    }
    capture
}

fn spawn_reader<R>(
    name: &'static str,
    stream: R,
    limit: usize,
    scanner: Option<ScoreScanner>,
) -> Reader
where
    R: Read + Send + 'static,
{
    let state = Arc::new(Mutex::new(Drain::new(limit, scanner)));
    let (tx, rx) = bounded(1);
    let shared = Arc::clone(&state);
    let spawned = thread::Builder::new()
        .name(format!("evalbox-{}", name))
        .spawn(move || {
            drain_into(stream, &shared);
            let _ = tx.send(());
        });
    if let Err(e) = spawned {
        log::error!("Failed to spawn {} collector: {}", name, e);
    }
    Reader { state, done: rx }
}

/// Read until EOF, handing every chunk to the shared drain
fn drain_into<R: Read>(mut stream: R, state: &Mutex<Drain>) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("Output stream read error: {}", e);
                break;
            }
        }
    }
}

/// Keep the first `limit` bytes, read and drop the rest until EOF
pub fn drain_bounded<R: Read>(stream: R, limit: usize) -> StreamCapture {
    let state = Mutex::new(Drain::new(limit, None));
    drain_into(stream, &state);
    let mut drain = state.into_inner().unwrap_or_else(PoisonError::into_inner);
    drain.finish()
}
