//! Worker thread pool dispatching decoded stream-mode messages to the
//! echo/reverse/time handlers.
//!
//! Secure-mode PING/PONG and echo-fallback dispatch happens inline in the
//! datagram front end and never touches this pool; only the stream
//! transport's connection-oriented demo traffic is queued here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use sc_queue::WorkQueue;
use sc_utils::{ThreadPriority, thread_boot};
use sc_wire::stream::StreamMessageType;
use tracing::{error, info, warn};

pub const WORKER_POOL_SIZE: usize = 4;
pub const WORKER_SLEEP_MS: u64 = 10;

/// Identifies the connection a message was read from: a field kept out of
/// band rather than smuggled into the wire bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub usize);

/// One dequeued unit of work: which connection it came from, and the
/// decoded stream-mode message.
pub struct WorkItem {
    pub origin: ConnId,
    pub message_type: StreamMessageType,
    pub body: Vec<u8>,
}

/// Where a worker deposits its response so the main thread — sole owner
/// of connection state — can perform the actual write.
pub trait ResponseSink: Send + Sync {
    fn respond(&self, origin: ConnId, message_type: StreamMessageType, body: Vec<u8>);
}

/// A [`ResponseSink`] that hands responses off through a bounded queue,
/// drained by the stream front end's poll loop.
pub struct QueuedResponseSink {
    queue: Arc<WorkQueue<(ConnId, StreamMessageType, Vec<u8>)>>,
}

impl QueuedResponseSink {
    #[must_use]
    pub fn new(queue: Arc<WorkQueue<(ConnId, StreamMessageType, Vec<u8>)>>) -> Self {
        Self { queue }
    }
}

impl ResponseSink for QueuedResponseSink {
    fn respond(&self, origin: ConnId, message_type: StreamMessageType, body: Vec<u8>) {
        // Abort rather than retry or block the worker; a full response
        // queue is treated the same as a failed send.
        if self.queue.try_add((origin, message_type, body)).is_err() {
            warn!(?origin, "response queue full, dropping response");
        }
    }
}

/// Reverses a message body byte-wise and appends a NUL terminator. The body
/// is treated as a NUL-terminated string, not raw bytes: anything at or
/// after the first NUL is dropped rather than reversed, so the terminator
/// lands at the end of the response instead of its start (`"abcde\0"` in,
/// `"edcba\0"` out — a full byte-wise reverse of all 6 input bytes would
/// instead produce `"\0edcba"`).
#[must_use]
pub fn reverse_body(body: &[u8]) -> Vec<u8> {
    let str_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    let mut out = Vec::with_capacity(str_len + 1);
    out.extend(body[..str_len].iter().rev());
    out.push(0);
    out
}

/// Formats the current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
#[must_use]
pub fn format_time_response() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Encodes the TIME response body, appending a NUL terminator after the
/// 20-character timestamp, matching the same length-plus-terminator
/// convention REVERSE uses.
#[must_use]
pub fn time_response_bytes() -> Vec<u8> {
    let mut out = format_time_response().into_bytes();
    out.push(0);
    out
}

fn dispatch(item: WorkItem, sink: &dyn ResponseSink) {
    match item.message_type {
        StreamMessageType::Echo => {
            info!(origin = ?item.origin, "dispatching ECHO");
            sink.respond(item.origin, StreamMessageType::Echo, item.body);
        }
        StreamMessageType::Reverse => {
            info!(origin = ?item.origin, "dispatching REVERSE");
            let reversed = reverse_body(&item.body);
            sink.respond(item.origin, StreamMessageType::Reverse, reversed);
        }
        StreamMessageType::Time => {
            info!(origin = ?item.origin, "dispatching TIME");
            sink.respond(item.origin, StreamMessageType::Time, time_response_bytes());
        }
    }
}

/// A fixed-size pool of OS threads draining a shared [`WorkQueue`] and
/// dispatching to the ECHO/REVERSE/TIME handlers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `n` worker threads, each looping `try_pop` → dispatch →
    /// sleep `WORKER_SLEEP_MS` on an empty queue, until `shutdown` is set.
    pub fn start(
        n: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        sink: Arc<dyn ResponseSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let handles = (0..n)
            .map(|id| {
                let queue = Arc::clone(&queue);
                let sink = Arc::clone(&sink);
                let shutdown = Arc::clone(&shutdown);
                std::thread::Builder::new()
                    .name(format!("sc-worker-{id}"))
                    .spawn(move || {
                        thread_boot(None, ThreadPriority::OsDefault);
                        info!(id, "worker started");
                        worker_loop(id, &queue, sink.as_ref(), &shutdown);
                        info!(id, "worker shutting down");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(n, "created worker pool");
        Self { handles }
    }

    /// Joins every worker thread. Callers are expected to have set the
    /// shutdown flag first; any items left in the queue after join are the
    /// caller's responsibility to drain.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(id: usize, queue: &WorkQueue<WorkItem>, sink: &dyn ResponseSink, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match queue.try_pop() {
            Ok(item) => dispatch(item, sink),
            Err(sc_queue::QueueError::Empty) => std::thread::sleep(Duration::from_millis(WORKER_SLEEP_MS)),
            Err(e) => error!(id, error = %e, "worker queue pop error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        responses: Mutex<Vec<(ConnId, StreamMessageType, Vec<u8>)>>,
    }

    impl ResponseSink for RecordingSink {
        fn respond(&self, origin: ConnId, message_type: StreamMessageType, body: Vec<u8>) {
            self.responses.lock().unwrap().push((origin, message_type, body));
        }
    }

    #[test]
    fn reverse_body_appends_a_terminator() {
        assert_eq!(reverse_body(b"hello"), b"olleh\0".to_vec());
        assert_eq!(reverse_body(b""), b"\0".to_vec());
    }

    #[test]
    fn reverse_body_stops_at_first_nul_matching_the_worked_example() {
        assert_eq!(reverse_body(b"abcde\0"), b"edcba\0".to_vec());
    }

    #[test]
    fn echo_dispatch_returns_same_payload() {
        let sink = RecordingSink { responses: Mutex::new(Vec::new()) };
        dispatch(WorkItem { origin: ConnId(1), message_type: StreamMessageType::Echo, body: b"hi".to_vec() }, &sink);
        let responses = sink.responses.into_inner().unwrap();
        assert_eq!(responses, vec![(ConnId(1), StreamMessageType::Echo, b"hi".to_vec())]);
    }

    #[test]
    fn reverse_dispatch_reverses_payload() {
        let sink = RecordingSink { responses: Mutex::new(Vec::new()) };
        dispatch(WorkItem { origin: ConnId(2), message_type: StreamMessageType::Reverse, body: b"abc".to_vec() }, &sink);
        let responses = sink.responses.into_inner().unwrap();
        assert_eq!(responses, vec![(ConnId(2), StreamMessageType::Reverse, b"cba\0".to_vec())]);
    }

    #[test]
    fn time_dispatch_produces_iso8601_format_with_terminator() {
        let sink = RecordingSink { responses: Mutex::new(Vec::new()) };
        dispatch(WorkItem { origin: ConnId(3), message_type: StreamMessageType::Time, body: Vec::new() }, &sink);
        let responses = sink.responses.into_inner().unwrap();
        assert_eq!(responses.len(), 1);
        let body = &responses[0].2;
        assert_eq!(body.len(), "2024-01-01T00:00:00Z".len() + 1);
        assert_eq!(body.last(), Some(&0u8));
        let timestamp = std::str::from_utf8(&body[..body.len() - 1]).unwrap();
        assert!(timestamp.ends_with('Z'));
    }

    #[test]
    fn worker_pool_drains_queued_items_end_to_end() {
        let queue = Arc::new(WorkQueue::<WorkItem>::new(8).unwrap());
        let responses = Arc::new(WorkQueue::new(8).unwrap());
        let sink: Arc<dyn ResponseSink> = Arc::new(QueuedResponseSink::new(Arc::clone(&responses)));
        let shutdown = Arc::new(AtomicBool::new(false));

        let pool = WorkerPool::start(2, Arc::clone(&queue), sink, Arc::clone(&shutdown));

        queue.add(WorkItem { origin: ConnId(7), message_type: StreamMessageType::Echo, body: b"ping".to_vec() }).unwrap();

        let (origin, message_type, body) = responses.pop_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(origin, ConnId(7));
        assert_eq!(message_type, StreamMessageType::Echo);
        assert_eq!(body, b"ping".to_vec());

        shutdown.store(true, Ordering::Relaxed);
        pool.join();
    }
}
