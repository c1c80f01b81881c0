//! Turning raw process output into text.
//!
//! Backends read output in fixed-size blocks, so a multi-byte character or
//! a server address can straddle two reads. Both are stitched back together
//! here before anything downstream sees them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::{detect_server_url, ServerReady};

/// Bytes of recent output kept for address detection.
const TAIL_BYTES: usize = 256;

/// Incremental UTF-8 decoder that holds back incomplete sequences.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes as much of `bytes` (after any held-back bytes) as possible.
    /// Invalid sequences become U+FFFD; a truncated one at the end is kept
    /// for the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            let (valid, invalid) = match std::str::from_utf8(&self.pending) {
                Ok(_) => (self.pending.len(), None),
                Err(e) => (e.valid_up_to(), Some(e.error_len())),
            };
            out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));

            match invalid {
                None => {
                    self.pending.clear();
                    break;
                }
                Some(Some(len)) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid + len);
                }
                Some(None) => {
                    self.pending.drain(..valid);
                    break;
                }
            }
        }
        out
    }

    /// Flushes whatever is still held back. Called once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(rest)
    }
}

/// Announces the first local server address printed by one process,
/// whichever of its streams prints it.
#[derive(Debug)]
pub struct ReadyAnnouncer {
    process: u64,
    ready_tx: broadcast::Sender<ServerReady>,
    announced: AtomicBool,
}

impl ReadyAnnouncer {
    /// Creates the announcer for process `process`.
    pub fn new(process: u64, ready_tx: broadcast::Sender<ServerReady>) -> Arc<Self> {
        Arc::new(Self {
            process,
            ready_tx,
            announced: AtomicBool::new(false),
        })
    }

    fn is_done(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    fn announce(&self, port: u16) {
        if self.announced.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Process {} serving on port {}", self.process, port);
        let _ = self.ready_tx.send(ServerReady::local(self.process, port));
    }
}

/// One output stream (stdout or stderr) of a sandboxed process.
#[derive(Debug)]
pub struct OutputStream {
    decoder: Utf8Decoder,
    tail: String,
    announcer: Arc<ReadyAnnouncer>,
}

impl OutputStream {
    /// Creates a stream reporting addresses through `announcer`.
    pub fn new(announcer: Arc<ReadyAnnouncer>) -> Self {
        Self {
            decoder: Utf8Decoder::default(),
            tail: String::new(),
            announcer,
        }
    }

    /// Decodes one raw read and scans it for a server address.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        let text = self.decoder.decode(bytes);
        self.scan(&text, false);
        text
    }

    /// Flushes the decoder at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.decoder.finish();
        self.scan(rest.as_deref().unwrap_or_default(), true);
        rest
    }

    fn scan(&mut self, text: &str, at_end: bool) {
        if self.announcer.is_done() {
            return;
        }
        self.tail.push_str(text);

        // A trailing digit may be a port that continues in the next read.
        if at_end || !self.tail.ends_with(|c: char| c.is_ascii_digit()) {
            if let Some(port) = detect_server_url(&self.tail) {
                self.announcer.announce(port);
                self.tail.clear();
                return;
            }
        }

        if self.tail.len() > TAIL_BYTES {
            let mut cut = self.tail.len() - TAIL_BYTES;
            while !self.tail.is_char_boundary(cut) {
                cut += 1;
            }
            self.tail.drain(..cut);
        }
    }
}
