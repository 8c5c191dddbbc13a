//! Formatting of emitted lines and hand-off of finished buffers.

use std::fmt::{self, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of decimals of emitted values.
const PRECISION: usize = 6;

/// The line format of emitted values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `path value`
    #[default]
    Ministry,
    /// `path value timestamp`
    Graphite,
    /// `path:value|g`
    Statsd,
}

/// Receives finished output buffers.
pub trait OutputSink: Send + Sync {
    /// Takes ownership of a buffer of complete lines.
    fn send(&self, buffer: Bytes);
}

/// Forwards buffers over a channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: Sender<Bytes>,
}

impl ChannelSink {
    /// Creates a sink sending into `tx`.
    pub fn new(tx: Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl OutputSink for ChannelSink {
    fn send(&self, buffer: Bytes) {
        if self.tx.send(buffer).is_err() {
            tally_log::debug!("output receiver is gone, dropping buffer");
        }
    }
}

/// Collects buffers in memory.
#[derive(Clone, Debug, Default)]
pub struct VecSink {
    buffers: Arc<Mutex<Vec<Bytes>>>,
}

impl VecSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all collected buffers.
    pub fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.buffers.lock())
    }

    /// Removes all collected buffers and returns their concatenated text.
    pub fn take_text(&self) -> String {
        self.take()
            .iter()
            .map(|b| String::from_utf8_lossy(b))
            .collect()
    }
}

impl OutputSink for VecSink {
    fn send(&self, buffer: Bytes) {
        self.buffers.lock().push(buffer);
    }
}

/// Accumulates lines and hands them off once a high-water mark is reached.
pub struct LineBuffer {
    buf: BytesMut,
    high_water: usize,
    dialect: Dialect,
    timestamp: u64,
    lines: u64,
    sink: Arc<dyn OutputSink>,
}

impl LineBuffer {
    /// Creates a buffer that flushes into `sink` at `high_water` bytes.
    pub fn new(sink: Arc<dyn OutputSink>, dialect: Dialect, high_water: usize) -> Self {
        let high_water = high_water.max(64);
        Self {
            buf: BytesMut::with_capacity(high_water + 256),
            high_water,
            dialect,
            timestamp: 0,
            lines: 0,
            sink,
        }
    }

    /// Sets the timestamp in seconds appended by the graphite dialect.
    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Number of lines written since creation.
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Writes a line with six decimals.
    pub fn push(&mut self, name: fmt::Arguments<'_>, value: f64) {
        self.push_with_precision(name, value, PRECISION);
    }

    /// Writes a line with the given number of decimals.
    pub fn push_with_precision(&mut self, name: fmt::Arguments<'_>, value: f64, precision: usize) {
        // Writing into `BytesMut` cannot fail.
        let _ = match self.dialect {
            Dialect::Ministry => writeln!(self.buf, "{name} {value:.precision$}"),
            Dialect::Graphite => {
                writeln!(self.buf, "{name} {value:.precision$} {}", self.timestamp)
            }
            Dialect::Statsd => writeln!(self.buf, "{name}:{value:.precision$}|g"),
        };
        self.lines += 1;

        if self.buf.len() >= self.high_water {
            self.flush();
        }
    }

    /// Hands the pending lines to the sink.
    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let buffer = self.buf.split().freeze();
        self.buf.reserve(self.high_water + 256);
        self.sink.send(buffer);
    }
}

impl fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuffer")
            .field("pending", &self.buf.len())
            .field("high_water", &self.high_water)
            .field("dialect", &self.dialect)
            .finish()
    }
}
