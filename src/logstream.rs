//! Log fan-out: a bounded in-memory ring for `GET /api/logs`, a broadcast
//! channel feeding the SSE stream, and a [`MakeWriter`] tee that routes the
//! formatted tracing output into both plus the on-disk log file.
//!
//! Slow SSE subscribers fall behind on the broadcast channel and miss
//! messages instead of blocking the producer.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

const RING_CAPACITY: usize = 1000;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LogStream {
    ring: Arc<Mutex<VecDeque<String>>>,
    tx: broadcast::Sender<String>,
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY))),
            tx,
        }
    }

    pub fn push(&self, line: String) {
        if let Ok(mut ring) = self.ring.lock() {
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line.clone());
        }
        // Errors only mean nobody is subscribed right now.
        let _ = self.tx.send(line);
    }

    /// The most recent `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        match self.ring.lock() {
            Ok(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Tees formatted log lines into the stream and an append-only log file.
#[derive(Clone)]
pub struct LogTee {
    stream: LogStream,
    file: Option<Arc<Mutex<File>>>,
}

impl LogTee {
    pub fn new(stream: LogStream, log_file: &Path) -> io::Result<Self> {
        let file = File::options().create(true).append(true).open(log_file)?;
        Ok(Self {
            stream,
            file: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// A tee without a backing file, for environments where the log file
    /// cannot be opened.
    pub fn memory_only(stream: LogStream) -> Self {
        Self { stream, file: None }
    }
}

impl Write for LogTee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            let _ = file.write_all(buf);
        }
        for line in String::from_utf8_lossy(buf).lines() {
            let line = line.trim_end();
            if !line.is_empty() {
                self.stream.push(line.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &self.file
            && let Ok(mut file) = file.lock()
        {
            file.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogTee {
    type Writer = LogTee;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
