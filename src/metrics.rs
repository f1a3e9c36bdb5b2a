#![forbid(unsafe_code)]

// Server metrics: lock-free atomic counters plus a fixed-bucket latency
// histogram, rendered in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds, microseconds.
const BUCKET_BOUNDS_US: [u64; 8] = [
    500,       // 0.5ms
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    50_000,    // 50ms
    100_000,   // 100ms
    500_000,   // 500ms
    1_000_000, // 1s
];

const BUCKET_LABELS: [&str; 8] = [
    "0.0005", "0.001", "0.005", "0.01", "0.05", "0.1", "0.5", "1",
];

struct Histogram {
    buckets: [AtomicU64; 8],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS) {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{label}\"}} {}",
                bucket.load(Relaxed)
            );
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

struct Inner {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    events_received_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    signals_relayed_total: AtomicU64,
    chat_messages_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    auth_rejections_total: AtomicU64,
    event_handling: Histogram,
}

/// Cheaply cloneable handle over shared atomic counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                events_received_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                rooms_created_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                signals_relayed_total: AtomicU64::new(0),
                chat_messages_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                auth_rejections_total: AtomicU64::new(0),
                event_handling: Histogram::new(),
            }),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_events_received(&self) {
        self.inner.events_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_signals_relayed(&self) {
        self.inner.signals_relayed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_chat_messages(&self) {
        self.inner.chat_messages_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_auth_rejections(&self) {
        self.inner.auth_rejections_total.fetch_add(1, Relaxed);
    }

    pub fn observe_event_handling(&self, duration: Duration) {
        self.inner.event_handling.observe(duration);
    }

    /// RAII gauge for active connections; decrements on drop even if the
    /// connection handler panics.
    #[must_use]
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Render everything. Room/participant gauges are computed by the caller.
    #[must_use]
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);
        let i = &self.inner;

        counter(&mut out, "parley_connections_total", "Total WebSocket connections accepted", i.connections_total.load(Relaxed));
        counter(&mut out, "parley_events_received_total", "Total client events received", i.events_received_total.load(Relaxed));
        counter(&mut out, "parley_errors_total", "Total errors surfaced to clients", i.errors_total.load(Relaxed));
        counter(&mut out, "parley_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        counter(&mut out, "parley_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        counter(&mut out, "parley_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        counter(&mut out, "parley_signals_relayed_total", "Total WebRTC signaling messages relayed", i.signals_relayed_total.load(Relaxed));
        counter(&mut out, "parley_chat_messages_total", "Total chat messages relayed", i.chat_messages_total.load(Relaxed));
        counter(&mut out, "parley_producers_created_total", "Total SFU producers created", i.producers_created_total.load(Relaxed));
        counter(&mut out, "parley_consumers_created_total", "Total SFU consumers created", i.consumers_created_total.load(Relaxed));
        counter(&mut out, "parley_auth_rejections_total", "Total handshake authentication rejections", i.auth_rejections_total.load(Relaxed));

        gauge(&mut out, "parley_connections_active", "Currently open WebSocket connections", i.connections_active.load(Relaxed));
        gauge(&mut out, "parley_rooms_active", "Currently live rooms", rooms_active as u64);
        gauge(&mut out, "parley_participants_active", "Currently connected participants", participants_active as u64);

        i.event_handling.render(
            "parley_event_handling_seconds",
            "Client event handling latency in seconds",
            &mut out,
        );
        out
    }
}

pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
