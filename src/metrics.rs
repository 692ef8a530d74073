//! Connection statistics.
//!
//! Counters are plain atomics bumped from the network and decoding tasks. A
//! sampler task turns them into rates once per interval and hands a
//! [MetricsSnapshot] to the optional [MetricsDelegate].

use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Rect;

/// Receives a snapshot after every sample and once when the connection closes
pub trait MetricsDelegate: Send + Sync + 'static {
    fn metrics_did_update(&self, snapshot: &MetricsSnapshot);
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub total_pixels: u64,
    pub total_rects: u64,
    pub total_requests: u64,
    /// Decoded size of all pixel rectangles in the negotiated format
    pub bytes_represented: u64,
    /// Wire size of all pixel rectangles, headers excluded
    pub encoded_bytes: u64,
    /// Bytes per second over the last sample period
    pub in_rate: f64,
    pub out_rate: f64,
    /// Pixels per second over the last sample period
    pub pixel_rate: f64,
    pub peak_in_rate: f64,
    pub peak_out_rate: f64,
    pub peak_pixel_rate: f64,
    pub compression_ratio: f64,
    pub elapsed: Duration,
    pub closed: bool,
}

#[derive(Default)]
struct Rates {
    last_sample: Option<Instant>,
    last_in: u64,
    last_out: u64,
    last_pixels: u64,
    in_rate: f64,
    out_rate: f64,
    pixel_rate: f64,
    peak_in: f64,
    peak_out: f64,
    peak_pixels: f64,
}

pub struct ConnectionMetrics {
    start: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    total_pixels: AtomicU64,
    total_rects: AtomicU64,
    total_requests: AtomicU64,
    bytes_represented: AtomicU64,
    encoded_bytes: AtomicU64,
    bytes_per_pixel: AtomicU64,
    closed: AtomicBool,
    rates: Mutex<Rates>,
    delegate: Option<Arc<dyn MetricsDelegate>>,
}

impl ConnectionMetrics {
    pub fn new(delegate: Option<Arc<dyn MetricsDelegate>>) -> Arc<Self> {
        Self::new_at(Instant::now(), delegate)
    }

    pub(crate) fn new_at(start: Instant, delegate: Option<Arc<dyn MetricsDelegate>>) -> Arc<Self> {
        Arc::new(Self {
            start,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            total_pixels: AtomicU64::new(0),
            total_rects: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            bytes_represented: AtomicU64::new(0),
            encoded_bytes: AtomicU64::new(0),
            bytes_per_pixel: AtomicU64::new(4),
            closed: AtomicBool::new(false),
            rates: Mutex::new(Rates {
                last_sample: Some(start),
                ..Default::default()
            }),
            delegate,
        })
    }

    pub fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Account one decoded pixel rectangle which took `wire_bytes` on the wire
    pub fn add_rect(&self, rect: &Rect, wire_bytes: u64) {
        let pixels = rect.area();
        let bpp = self.bytes_per_pixel.load(Ordering::Relaxed);
        self.total_pixels.fetch_add(pixels, Ordering::Relaxed);
        self.total_rects.fetch_add(1, Ordering::Relaxed);
        self.bytes_represented.fetch_add(pixels * bpp, Ordering::Relaxed);
        self.encoded_bytes.fetch_add(wire_bytes, Ordering::Relaxed);
    }

    pub fn add_update_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_bytes_per_pixel(&self, bpp: usize) {
        self.bytes_per_pixel.store(bpp as u64, Ordering::Relaxed);
    }

    pub fn total_pixels(&self) -> u64 {
        self.total_pixels.load(Ordering::Relaxed)
    }

    /// Bytes represented per byte received, 1.0 before anything arrived
    pub fn compression_ratio(&self) -> f64 {
        let received = self.bytes_received.load(Ordering::Relaxed);
        if received == 0 {
            return 1.0;
        }
        self.bytes_represented.load(Ordering::Relaxed) as f64 / received as f64
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn sample(&self) {
        self.sample_at(Instant::now());
    }

    pub(crate) fn sample_at(&self, now: Instant) {
        if self.is_closed() {
            return;
        }
        let snapshot = {
            let mut rates = self.rates.lock();
            let last = rates.last_sample.unwrap_or(self.start);
            let dt = now.saturating_duration_since(last).as_secs_f64();
            if dt <= 0.0 {
                return;
            }
            let bytes_in = self.bytes_received.load(Ordering::Relaxed);
            let bytes_out = self.bytes_sent.load(Ordering::Relaxed);
            let pixels = self.total_pixels.load(Ordering::Relaxed);

            rates.in_rate = bytes_in.saturating_sub(rates.last_in) as f64 / dt;
            rates.out_rate = bytes_out.saturating_sub(rates.last_out) as f64 / dt;
            rates.pixel_rate = pixels.saturating_sub(rates.last_pixels) as f64 / dt;
            rates.peak_in = rates.peak_in.max(rates.in_rate);
            rates.peak_out = rates.peak_out.max(rates.out_rate);
            rates.peak_pixels = rates.peak_pixels.max(rates.pixel_rate);
            rates.last_in = bytes_in;
            rates.last_out = bytes_out;
            rates.last_pixels = pixels;
            rates.last_sample = Some(now);
            self.snapshot_with(&rates, now)
        };
        trace!(
            "Metrics: {:.0} B/s in, {:.0} B/s out, {:.0} px/s",
            snapshot.in_rate,
            snapshot.out_rate,
            snapshot.pixel_rate
        );
        if let Some(delegate) = &self.delegate {
            delegate.metrics_did_update(&snapshot);
        }
    }

    /// Freeze the rates and tell the delegate one last time
    pub fn connection_did_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let snapshot = self.snapshot();
        if let Some(delegate) = &self.delegate {
            delegate.metrics_did_update(&snapshot);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rates = self.rates.lock();
        self.snapshot_with(&rates, Instant::now())
    }

    fn snapshot_with(&self, rates: &Rates, now: Instant) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            total_pixels: self.total_pixels.load(Ordering::Relaxed),
            total_rects: self.total_rects.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bytes_represented: self.bytes_represented.load(Ordering::Relaxed),
            encoded_bytes: self.encoded_bytes.load(Ordering::Relaxed),
            in_rate: rates.in_rate,
            out_rate: rates.out_rate,
            pixel_rate: rates.pixel_rate,
            peak_in_rate: rates.peak_in,
            peak_out_rate: rates.peak_out,
            peak_pixel_rate: rates.peak_pixels,
            compression_ratio: self.compression_ratio(),
            elapsed: now.saturating_duration_since(self.start),
            closed: self.is_closed(),
        }
    }

    /// Sample every `interval` until the connection closes or `cancel` fires
    pub(crate) fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if metrics.is_closed() {
                            break;
                        }
                        metrics.sample();
                    }
                }
            }
        })
    }
}
