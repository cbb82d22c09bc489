//! Bounded output capture with broadcast + history.
//!
//! Each execution owns one [`OutputStore`]. The process pumps are the
//! only writers; readers are the live broadcast path and late
//! subscribers replaying from the buffer start. Once the buffer's byte
//! cap is hit the oldest chunks are evicted and a single truncation
//! marker stands in for them.

use std::{
    collections::VecDeque,
    sync::RwLock,
};

use bytes::Bytes;
use futures::{StreamExt, future};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use mirror_core::ExecStatus;

/// Marker chunk inserted in place of evicted output.
pub const TRUNCATION_MARKER: &str = "…output truncated…";

/// Output rendering format. Closed set, resolved at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Bytes as received from the process.
    Raw,
    /// ANSI-stripped text wrapped in fenced code blocks.
    Markdown,
    /// ANSI-stripped, HTML-escaped text; stderr wrapped in a span.
    Html,
}

/// One captured unit of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Bytes read from the child's stdout.
    Stdout(Bytes),
    /// Bytes read from the child's stderr.
    Stderr(Bytes),
    /// Stands in for evicted chunks. At most one per execution.
    Truncated,
    /// The execution reached a terminal state. Always the last chunk.
    Finished(ExecStatus),
}

impl OutputChunk {
    /// Payload size counted against the buffer cap.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Stdout(b) | Self::Stderr(b) => b.len(),
            Self::Truncated | Self::Finished(_) => 0,
        }
    }

    fn is_data(&self) -> bool {
        matches!(self, Self::Stdout(_) | Self::Stderr(_))
    }
}

struct Inner {
    history: VecDeque<OutputChunk>,
    total_bytes: usize,
    truncated: bool,
    finished: Option<ExecStatus>,
}

/// Per-execution output buffer with live fan-out.
pub struct OutputStore {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<OutputChunk>,
    max_bytes: usize,
}

impl OutputStore {
    /// Create a store capped at `max_bytes` of payload.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
                truncated: false,
                finished: None,
            }),
            sender,
            max_bytes: max_bytes.max(1),
        }
    }

    /// Append a chunk of stdout.
    pub fn append_stdout(&self, data: impl Into<Bytes>) {
        self.push(OutputChunk::Stdout(data.into()));
    }

    /// Append a chunk of stderr.
    pub fn append_stderr(&self, data: impl Into<Bytes>) {
        self.push(OutputChunk::Stderr(data.into()));
    }

    /// Mark the execution terminal. Further appends are discarded.
    pub fn finish(&self, status: ExecStatus) {
        self.push(OutputChunk::Finished(status));
    }

    fn push(&self, chunk: OutputChunk) {
        let mut inner = self.inner.write().unwrap();
        if inner.finished.is_some() {
            return;
        }
        if let OutputChunk::Finished(status) = chunk {
            inner.finished = Some(status);
        }

        let mut chunk = chunk;
        while inner.total_bytes.saturating_add(chunk.payload_len()) > self.max_bytes {
            let Some(front) = inner.history.pop_front() else {
                break;
            };
            inner.total_bytes = inner.total_bytes.saturating_sub(front.payload_len());
            if front.is_data() {
                inner.truncated = true;
            }
        }
        // A single chunk larger than the whole cap keeps only its tail,
        // so buffered bytes never exceed the cap.
        if chunk.payload_len() > self.max_bytes {
            chunk = match chunk {
                OutputChunk::Stdout(data) => {
                    OutputChunk::Stdout(data.slice(data.len() - self.max_bytes..))
                }
                OutputChunk::Stderr(data) => {
                    OutputChunk::Stderr(data.slice(data.len() - self.max_bytes..))
                }
                other => other,
            };
            inner.truncated = true;
        }
        let bytes = chunk.payload_len();
        inner.history.push_back(chunk.clone());
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);

        // Sent while holding the lock so a concurrent subscriber sees each
        // chunk in exactly one of history or the live feed, never both.
        let _ = self.sender.send(chunk); // no live listeners is fine
    }

    /// Terminal status, once reached.
    #[must_use]
    pub fn finished_status(&self) -> Option<ExecStatus> {
        self.inner.read().unwrap().finished
    }

    /// Payload bytes currently buffered. Never exceeds the cap.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.inner.read().unwrap().total_bytes
    }

    /// Snapshot of the buffer, oldest first, with the truncation marker
    /// prepended exactly once if anything was evicted.
    #[must_use]
    pub fn history(&self) -> Vec<OutputChunk> {
        let inner = self.inner.read().unwrap();
        let mut chunks = Vec::with_capacity(inner.history.len() + 1);
        if inner.truncated {
            chunks.push(OutputChunk::Truncated);
        }
        chunks.extend(inner.history.iter().cloned());
        chunks
    }

    /// Stream of chunks: buffered history first, then live updates,
    /// ending with the `Finished` chunk. Restartable from the buffer
    /// start for late subscribers; FIFO for every subscriber.
    #[must_use]
    pub fn chunk_stream(&self) -> futures::stream::BoxStream<'static, OutputChunk> {
        // Snapshot and subscribe under one read lock; see `push`.
        let (history, rx, already_finished) = {
            let inner = self.inner.read().unwrap();
            let mut chunks = Vec::with_capacity(inner.history.len() + 1);
            if inner.truncated {
                chunks.push(OutputChunk::Truncated);
            }
            chunks.extend(inner.history.iter().cloned());
            (chunks, self.sender.subscribe(), inner.finished.is_some())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        let combined: futures::stream::BoxStream<'static, OutputChunk> = if already_finished {
            Box::pin(hist)
        } else {
            Box::pin(hist.chain(live))
        };

        // Yield through the Finished chunk, then end.
        let mut done = false;
        Box::pin(combined.take_while(move |chunk| {
            let keep = !done;
            if matches!(chunk, OutputChunk::Finished(_)) {
                done = true;
            }
            future::ready(keep)
        }))
    }

    /// Stream of formatted output. Finite once the execution is
    /// terminal; data chunks only.
    #[must_use]
    pub fn stream(&self, format: OutputFormat) -> futures::stream::BoxStream<'static, Bytes> {
        self.chunk_stream()
            .filter_map(move |chunk| future::ready(format_chunk(&chunk, format)))
            .boxed()
    }
}

/// Render one chunk in the requested format. Control chunks render only
/// the truncation marker; `Finished` renders nothing.
#[must_use]
pub fn format_chunk(chunk: &OutputChunk, format: OutputFormat) -> Option<Bytes> {
    match (chunk, format) {
        (OutputChunk::Finished(_), _) => None,
        (OutputChunk::Truncated, OutputFormat::Raw) => {
            Some(Bytes::from_static(TRUNCATION_MARKER.as_bytes()))
        }
        (OutputChunk::Truncated, OutputFormat::Markdown) => {
            Some(Bytes::from(format!("*{TRUNCATION_MARKER}*\n")))
        }
        (OutputChunk::Truncated, OutputFormat::Html) => {
            Some(Bytes::from(format!("<em>{TRUNCATION_MARKER}</em>")))
        }
        (OutputChunk::Stdout(data) | OutputChunk::Stderr(data), OutputFormat::Raw) => {
            Some(data.clone())
        }
        (OutputChunk::Stdout(data) | OutputChunk::Stderr(data), OutputFormat::Markdown) => {
            let text = console::strip_ansi_codes(&String::from_utf8_lossy(data)).into_owned();
            Some(Bytes::from(format!("```text\n{text}\n```\n")))
        }
        (OutputChunk::Stdout(data), OutputFormat::Html) => {
            let text = console::strip_ansi_codes(&String::from_utf8_lossy(data)).into_owned();
            Some(Bytes::from(format!("<pre>{}</pre>", escape_html(&text))))
        }
        (OutputChunk::Stderr(data), OutputFormat::Html) => {
            let text = console::strip_ansi_codes(&String::from_utf8_lossy(data)).into_owned();
            Some(Bytes::from(format!(
                "<pre><span class=\"stderr\">{}</span></pre>",
                escape_html(&text)
            )))
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_stays_within_cap_with_one_marker() {
        let store = OutputStore::new(10);
        store.append_stdout(Bytes::from_static(b"aaaa")); // 4
        store.append_stdout(Bytes::from_static(b"bbbb")); // 8
        store.append_stdout(Bytes::from_static(b"cccc")); // evicts "aaaa"
        store.append_stdout(Bytes::from_static(b"dddd")); // evicts "bbbb"

        assert!(store.buffered_bytes() <= 10);

        let history = store.history();
        let markers = history
            .iter()
            .filter(|c| matches!(c, OutputChunk::Truncated))
            .count();
        assert_eq!(markers, 1);
        assert_eq!(history[0], OutputChunk::Truncated);
        assert_eq!(history[1], OutputChunk::Stdout(Bytes::from_static(b"cccc")));
    }

    #[test]
    fn oversized_chunk_is_cut_down_to_the_cap() {
        let store = OutputStore::new(10);
        store.append_stdout(Bytes::from_static(b"0123456789abcdefghijklmno")); // 25 bytes

        assert!(store.buffered_bytes() <= 10);

        let history = store.history();
        let markers = history
            .iter()
            .filter(|c| matches!(c, OutputChunk::Truncated))
            .count();
        assert_eq!(markers, 1);
        // Only the tail of the oversized chunk survives.
        assert_eq!(history[1], OutputChunk::Stdout(Bytes::from_static(b"fghijklmno")));
    }

    #[test]
    fn oversized_chunk_also_evicts_older_output() {
        let store = OutputStore::new(10);
        store.append_stdout(Bytes::from_static(b"early"));
        store.append_stderr(Bytes::from_static(b"0123456789abcdefghijklmno"));

        assert!(store.buffered_bytes() <= 10);
        let history = store.history();
        assert_eq!(history[0], OutputChunk::Truncated);
        assert_eq!(history[1], OutputChunk::Stderr(Bytes::from_static(b"fghijklmno")));
    }

    #[test]
    fn no_marker_when_nothing_evicted() {
        let store = OutputStore::new(1024);
        store.append_stdout(Bytes::from_static(b"hello"));
        assert!(
            !store
                .history()
                .iter()
                .any(|c| matches!(c, OutputChunk::Truncated))
        );
    }

    #[test]
    fn appends_after_finish_are_discarded() {
        let store = OutputStore::new(1024);
        store.append_stdout(Bytes::from_static(b"before"));
        store.finish(ExecStatus::Succeeded);
        store.append_stdout(Bytes::from_static(b"after"));

        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(store.finished_status(), Some(ExecStatus::Succeeded));
    }

    #[tokio::test]
    async fn stream_is_fifo_and_finite() {
        let store = OutputStore::new(1024);
        store.append_stdout(Bytes::from_static(b"one "));
        store.append_stderr(Bytes::from_static(b"two "));
        store.append_stdout(Bytes::from_static(b"three"));
        store.finish(ExecStatus::Succeeded);

        let chunks: Vec<Bytes> = store.stream(OutputFormat::Raw).collect().await;
        let text: Vec<u8> = chunks.concat();
        assert_eq!(text, b"one two three");
    }

    #[tokio::test]
    async fn late_subscriber_replays_from_buffer_start() {
        let store = OutputStore::new(1024);
        store.append_stdout(Bytes::from_static(b"early"));

        // Subscribe after the first chunk was already pushed.
        let mut stream = store.chunk_stream();
        assert_eq!(
            stream.next().await,
            Some(OutputChunk::Stdout(Bytes::from_static(b"early")))
        );

        store.append_stdout(Bytes::from_static(b"late"));
        store.finish(ExecStatus::Succeeded);

        assert_eq!(
            stream.next().await,
            Some(OutputChunk::Stdout(Bytes::from_static(b"late")))
        );
        assert_eq!(
            stream.next().await,
            Some(OutputChunk::Finished(ExecStatus::Succeeded))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn concurrent_subscribers_observe_identical_order() {
        let store = OutputStore::new(1024);
        let mut a = store.chunk_stream();
        let mut b = store.chunk_stream();

        for i in 0..10u8 {
            store.append_stdout(Bytes::from(vec![i]));
        }
        store.finish(ExecStatus::Succeeded);

        let collected_a: Vec<OutputChunk> = (&mut a).collect().await;
        let collected_b: Vec<OutputChunk> = (&mut b).collect().await;
        assert_eq!(collected_a, collected_b);
    }

    #[test]
    fn markdown_strips_ansi_and_fences() {
        let chunk = OutputChunk::Stdout(Bytes::from_static(b"\x1b[31mred\x1b[0m"));
        let out = format_chunk(&chunk, OutputFormat::Markdown).unwrap();
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert_eq!(text, "```text\nred\n```\n");
    }

    #[test]
    fn html_escapes_and_marks_stderr() {
        let chunk = OutputChunk::Stderr(Bytes::from_static(b"<error>"));
        let out = format_chunk(&chunk, OutputFormat::Html).unwrap();
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.contains("&lt;error&gt;"));
        assert!(text.contains("class=\"stderr\""));
    }
}
