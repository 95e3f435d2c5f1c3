// outpost: Ring log buffers and the per-daemon logger facade

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

/// Number of recent log lines retained per buffer
pub const NUM_LATEST_LOG_ENTRIES: usize = 128;

/// Fixed-capacity FIFO of recent log lines. Push discards the oldest line
/// when full; reading yields the contents in chronological order without
/// removing them.
pub struct RingBuffer {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

/// The two process-wide log buffers: every line, and warnings only.
/// Owned by the supervisor and handed to each daemon at construction so
/// tests can instantiate fresh instances.
#[derive(Clone)]
pub struct LogBuffers {
    pub latest: Arc<RingBuffer>,
    pub warnings: Arc<RingBuffer>,
}

impl LogBuffers {
    pub fn new() -> Self {
        Self {
            latest: Arc::new(RingBuffer::new(NUM_LATEST_LOG_ENTRIES)),
            warnings: Arc::new(RingBuffer::new(NUM_LATEST_LOG_ENTRIES)),
        }
    }
}

impl Default for LogBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats log lines as `component[id].function(actor): message`, emits them
/// through tracing and mirrors them into the ring buffers.
#[derive(Clone)]
pub struct DaemonLogger {
    component: &'static str,
    component_id: String,
    buffers: LogBuffers,
}

impl DaemonLogger {
    pub fn new(component: &'static str, component_id: impl Into<String>, buffers: LogBuffers) -> Self {
        Self {
            component,
            component_id: component_id.into(),
            buffers,
        }
    }

    fn format(&self, function: &str, actor: &str, message: &str) -> String {
        let mut line = String::new();
        line.push_str(self.component);
        if !self.component_id.is_empty() {
            line.push_str(&format!("[{}]", self.component_id));
        }
        if !function.is_empty() {
            line.push('.');
            line.push_str(function);
        }
        if !actor.is_empty() {
            line.push_str(&format!("({})", actor));
        }
        line.push_str(": ");
        line.push_str(message);
        line
    }

    fn stamp(line: &str) -> String {
        format!("{} {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"), line)
    }

    /// Log at info level; the line is kept in the latest-logs buffer.
    pub fn info(&self, function: &str, actor: &str, message: &str) {
        let line = self.format(function, actor, message);
        info!(target: "outpost", "{}", line);
        self.buffers.latest.push(Self::stamp(&line));
    }

    /// Log at warning level; the line is kept in both buffers.
    pub fn warning(&self, function: &str, actor: &str, message: &str) {
        let line = self.format(function, actor, message);
        warn!(target: "outpost", "{}", line);
        let stamped = Self::stamp(&line);
        self.buffers.latest.push(stamped.clone());
        self.buffers.warnings.push(stamped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_keeps_last_n_in_order() {
        let ring = RingBuffer::new(3);
        for i in 0..10 {
            ring.push(format!("line {}", i));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_ring_buffer_snapshot_is_non_destructive() {
        let ring = RingBuffer::new(4);
        ring.push("a".to_string());
        ring.push("b".to_string());
        assert_eq!(ring.snapshot(), ring.snapshot());
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn test_logger_mirrors_warnings_into_both_buffers() {
        let buffers = LogBuffers::new();
        let logger = DaemonLogger::new("TESTD", "127.0.0.1:0", buffers.clone());
        logger.info("start", "", "listening");
        logger.warning("accept", "10.0.0.1", "rate limit exceeded");
        assert_eq!(buffers.latest.len(), 2);
        assert_eq!(buffers.warnings.len(), 1);
        assert!(buffers.warnings.snapshot()[0].contains("TESTD[127.0.0.1:0].accept(10.0.0.1)"));
    }
}
