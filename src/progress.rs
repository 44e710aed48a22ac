//! Rate-limited progress display for client tooling
//!
//! Tracks rows and bytes fed through an aggregation and renders a one-line
//! status at most a few times per second. Lives entirely outside the
//! execution core: operators bump the counters, the client loop asks
//! whether a redraw is due.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum delay between two rendered updates.
const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct ProgressIndication {
    read_rows: AtomicU64,
    read_bytes: AtomicU64,
    total_rows_to_read: AtomicU64,
    started: Instant,
    last_render: Mutex<Option<Instant>>,
    render_interval: Duration,
}

impl ProgressIndication {
    pub fn new() -> Self {
        Self::with_render_interval(DEFAULT_RENDER_INTERVAL)
    }

    pub fn with_render_interval(render_interval: Duration) -> Self {
        Self {
            read_rows: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            total_rows_to_read: AtomicU64::new(0),
            started: Instant::now(),
            last_render: Mutex::new(None),
            render_interval,
        }
    }

    /// Set the expected total, when known, so a percentage can be shown.
    pub fn set_total_rows(&self, total: u64) {
        self.total_rows_to_read.store(total, Ordering::Relaxed);
    }

    /// Record progress. Returns true when enough time has passed since the
    /// last rendered update that the caller should redraw.
    pub fn update(&self, rows: u64, bytes: u64) -> bool {
        self.read_rows.fetch_add(rows, Ordering::Relaxed);
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);

        let mut last = self.last_render.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.render_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    pub fn read_rows(&self) -> u64 {
        self.read_rows.load(Ordering::Relaxed)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// One-line status: rows, throughput and optional completion ratio.
    pub fn render(&self) -> String {
        let rows = self.read_rows();
        let elapsed = self.elapsed_seconds();
        let rate = if elapsed > 0.0 {
            rows as f64 / elapsed
        } else {
            0.0
        };

        let total = self.total_rows_to_read.load(Ordering::Relaxed);
        if total > 0 {
            let percent = (rows as f64 / total as f64 * 100.0).min(100.0);
            format!("{rows} / {total} rows ({percent:.1}%), {rate:.0} rows/s")
        } else {
            format!("{rows} rows, {rate:.0} rows/s")
        }
    }

    /// Log the final summary once the query is done.
    pub fn write_final_summary(&self) {
        tracing::info!(
            rows = self.read_rows(),
            bytes = self.read_bytes(),
            elapsed_seconds = self.elapsed_seconds(),
            "aggregation finished"
        );
    }

    /// Reset counters for the next query; the clock restarts too.
    pub fn reset(&mut self) {
        self.read_rows.store(0, Ordering::Relaxed);
        self.read_bytes.store(0, Ordering::Relaxed);
        self.total_rows_to_read.store(0, Ordering::Relaxed);
        self.started = Instant::now();
        *self.last_render.lock().unwrap() = None;
    }
}

impl Default for ProgressIndication {
    fn default() -> Self {
        Self::new()
    }
}
