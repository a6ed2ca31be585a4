//! Non-blocking capture of child process output.
//!
//! Each piped stream gets a reader thread that drains lines into a bounded
//! ring buffer and mirrors them to a per-service log file. The supervised
//! process can never block on a full pipe, and the most recent lines stay
//! available for diagnostics after the process dies.
use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
};

use tracing::{debug, warn};

use crate::constants::OUTPUT_TAIL_LINES;

/// Bounded ring of the most recent output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(OUTPUT_TAIL_LINES)
    }
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a line, discarding the oldest once at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Tail through the shared handle. A capture thread that panicked
    /// poisons the mutex; the buffered lines are still recovered.
    pub fn tail_of(buffer: &Arc<Mutex<OutputBuffer>>, n: usize) -> Vec<String> {
        match buffer.lock() {
            Ok(guard) => guard.tail(n),
            Err(poisoned) => poisoned.into_inner().tail(n),
        }
    }
}

/// Starts a reader thread draining `stream` line by line. Lines land in the
/// returned ring buffer and, when `log_path` is given, in that file. The
/// thread exits on EOF, which follows the owning process group's death.
pub fn spawn_capture<R>(
    service: &str,
    stream_label: &'static str,
    stream: R,
    log_path: Option<PathBuf>,
) -> Arc<Mutex<OutputBuffer>>
where
    R: Read + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(OutputBuffer::default()));
    let sink = Arc::clone(&buffer);
    let service = service.to_string();

    thread::spawn(move || {
        let mut log_file = log_path.and_then(|path| match File::create(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!(
                    "Failed to open log file {} for {service} {stream_label}: {err}",
                    path.display()
                );
                None
            }
        });

        let reader = BufReader::new(stream);
        for line in reader.lines().map_while(Result::ok) {
            debug!("[{service} {stream_label}] {line}");
            if let Some(writer) = log_file.as_mut() {
                if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err() {
                    log_file = None;
                }
            }
            match sink.lock() {
                Ok(mut guard) => guard.push(line),
                Err(mut poisoned) => poisoned.get_mut().push(line),
            }
        }
    });

    buffer
}
