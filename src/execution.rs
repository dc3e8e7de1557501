//! The record of one invocation attempt of a job,
//! plus the pooled output buffers it borrows while running.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Cap on the text snapshot retained in history after a live buffer is
/// released.
const SNAPSHOT_CAP_BYTES: usize = 64 * 1024;

/// The terminal outcome of an Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Outcome {
    Running,
    Success,
    Failed,
    Skipped,
}

/// One invocation attempt. Constructed at fire time, mutated in place by
/// the pipeline as it progresses, and finally pushed into the job's
/// history ring.
#[derive(Debug, Serialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_name: String,
    pub start_time: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub outcome: Outcome,
    pub attempt: u32,
    pub exit_code: Option<i64>,
    #[serde(serialize_with = "serialize_error_opt")]
    pub error: Option<RuntimeError>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
}

fn serialize_error_opt<S>(e: &Option<RuntimeError>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::Serialize as _;
    e.as_ref().map(|e| e.to_string()).serialize(s)
}

impl Execution {
    pub fn new(job_name: impl Into<String>) -> Self {
        Execution {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            start_time: Utc::now(),
            duration: None,
            outcome: Outcome::Running,
            attempt: 1,
            exit_code: None,
            error: None,
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, Outcome::Running)
    }

    pub fn failed(&self) -> bool {
        self.outcome == Outcome::Failed
    }

    pub fn skipped(&self) -> bool {
        self.outcome == Outcome::Skipped
    }

    pub fn mark_success(&mut self) {
        self.outcome = Outcome::Success;
        self.finish();
    }

    pub fn mark_skipped(&mut self) {
        self.outcome = Outcome::Skipped;
        self.finish();
    }

    pub fn mark_failed(&mut self, error: RuntimeError) {
        self.exit_code = error.exit_code();
        self.error = Some(error);
        self.outcome = Outcome::Failed;
        self.finish();
    }

    fn finish(&mut self) {
        if self.duration.is_none() {
            self.duration = Some(
                (Utc::now() - self.start_time)
                    .to_std()
                    .unwrap_or_default(),
            );
        }
    }

    pub fn stdout_mut(&mut self) -> &mut OutputBuffer {
        &mut self.stdout
    }

    pub fn stderr_mut(&mut self) -> &mut OutputBuffer {
        &mut self.stderr
    }

    /// Borrows both streams at once, for variants that demultiplex a
    /// single wire into stdout/stderr concurrently.
    pub fn stdout_stderr_mut(&mut self) -> (&mut OutputBuffer, &mut OutputBuffer) {
        (&mut self.stdout, &mut self.stderr)
    }

    pub fn stdout_snapshot(&self) -> &str {
        self.stdout.snapshot()
    }

    pub fn stderr_snapshot(&self) -> &str {
        self.stderr.snapshot()
    }

    /// Releases the live byte buffers back to the pool, retaining only the
    /// bounded text snapshot.
    pub fn release_buffers(&mut self) {
        self.stdout.release();
        self.stderr.release();
    }
}

/// A single captured stream. Holds a pooled `BytesMut` while the Execution
/// is live and a bounded text snapshot after release.
#[derive(Debug)]
pub struct OutputBuffer {
    live: Option<BytesMut>,
    snapshot: String,
    total_written: u64,
}

impl Serialize for OutputBuffer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.snapshot())
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            live: Some(buffer_pool().acquire()),
            snapshot: String::new(),
            total_written: 0,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.total_written += data.len() as u64;
        if let Some(buf) = self.live.as_mut() {
            buf.extend_from_slice(data);
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn snapshot(&self) -> &str {
        if let Some(buf) = &self.live {
            // Safety net: lossy conversion, never panics on non-UTF8 output.
            std::str::from_utf8(buf).unwrap_or("<non-utf8 output>")
        } else {
            &self.snapshot
        }
    }

    /// Truncates to a bounded snapshot and returns the backing buffer to
    /// the pool.
    pub fn release(&mut self) {
        if let Some(mut buf) = self.live.take() {
            let text = String::from_utf8_lossy(&buf).into_owned();
            self.snapshot = if text.len() > SNAPSHOT_CAP_BYTES {
                let mut truncated: String = text.chars().take(SNAPSHOT_CAP_BYTES).collect();
                truncated.push_str("...<truncated>");
                truncated
            } else {
                text
            };
            buf.clear();
            buffer_pool().release(buf);
        }
    }
}

/// A small pool of reusable byte buffers keyed by nothing more than a
/// single target capacity. Buffers are
/// never shared between two live Executions concurrently — each `acquire`
/// hands out an owned `BytesMut` that the caller holds exclusively until
/// `release`.
pub struct BufferPool {
    capacity_hint: usize,
    free: Mutex<VecDeque<BytesMut>>,
}

const DEFAULT_CAPACITY_HINT: usize = 8 * 1024;
const MAX_POOLED: usize = 64;

impl BufferPool {
    fn new(capacity_hint: usize) -> Self {
        BufferPool {
            capacity_hint,
            free: Mutex::new(VecDeque::new()),
        }
    }

    pub fn acquire(&self) -> BytesMut {
        let mut free = self.free.lock().unwrap();
        free.pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity_hint))
    }

    pub fn release(&self, buf: BytesMut) {
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push_back(buf);
        }
    }
}

static POOL: std::sync::OnceLock<BufferPool> = std::sync::OnceLock::new();

fn buffer_pool() -> &'static BufferPool {
    POOL.get_or_init(|| BufferPool::new(DEFAULT_CAPACITY_HINT))
}

/// Bounded, append-only, per-job history.
#[derive(Debug, Default)]
pub struct HistoryRing {
    limit: usize,
    entries: VecDeque<Execution>,
}

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

impl HistoryRing {
    pub fn new(limit: usize) -> Self {
        HistoryRing {
            limit: limit.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, mut exec: Execution) {
        exec.release_buffers();
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(exec);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Execution> {
        self.entries.iter()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Consumes the ring, yielding its entries oldest-first.
    pub fn into_entries(self) -> impl Iterator<Item = Execution> {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_ring_evicts_oldest_past_limit() {
        let mut ring = HistoryRing::new(3);
        for i in 0..5 {
            let mut e = Execution::new(format!("job-{i}"));
            e.mark_success();
            ring.push(e);
        }
        assert_eq!(ring.len(), 3);
        let names: Vec<_> = ring.iter().map(|e| e.job_name.clone()).collect();
        assert_eq!(names, vec!["job-2", "job-3", "job-4"]);
    }

    #[test]
    fn output_buffer_snapshot_survives_release() {
        let mut buf = OutputBuffer::new();
        buf.write(b"hello world");
        assert_eq!(buf.snapshot(), "hello world");
        buf.release();
        assert_eq!(buf.snapshot(), "hello world");
    }

    #[test]
    fn mark_failed_records_exit_code() {
        let mut e = Execution::new("x");
        e.mark_failed(RuntimeError::NonZeroExit(7));
        assert!(e.failed());
        assert_eq!(e.exit_code, Some(7));
        assert!(e.is_terminal());
    }
}
