use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{Arc, Mutex},
};

const LATENCY_BUCKETS_MS: [f64; 10] = [
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];
const PREFIX: &str = "agent_scheduler";

#[derive(Clone, Debug, Default)]
pub struct LatencyHistogram {
    pub buckets: [u64; LATENCY_BUCKETS_MS.len()],
    pub sum_ms: f64,
    pub count: u64,
}

impl LatencyHistogram {
    fn observe(&mut self, value_ms: f64) {
        for (idx, upper_bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if value_ms <= *upper_bound {
                self.buckets[idx] += 1;
            }
        }
        self.sum_ms += value_ms;
        self.count += 1;
    }
}

/// Point-in-time copy of every counter and histogram.
#[derive(Clone, Debug, Default)]
pub struct MetricsSnapshot {
    pub ticks: BTreeMap<&'static str, u64>,
    pub dispatches: BTreeMap<&'static str, u64>,
    pub callbacks: BTreeMap<&'static str, u64>,
    pub auth: BTreeMap<&'static str, u64>,
    pub leader_transitions: BTreeMap<&'static str, u64>,
    pub store_errors: BTreeMap<String, u64>,
    pub market_fetch_errors: BTreeMap<&'static str, u64>,
    pub queue_full_total: u64,
    pub tasks_enqueued_total: u64,
    pub tasks_requeued_total: u64,
    pub tasks_dropped_total: u64,
    pub invalid_tasks_total: u64,
    pub upstream_latency: LatencyHistogram,
    pub callback_latency: LatencyHistogram,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn dispatches(&self, outcome: &str) -> u64 {
        self.dispatches.get(outcome).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn callbacks(&self, outcome: &str) -> u64 {
        self.callbacks.get(outcome).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn leader_transitions(&self, direction: &str) -> u64 {
        self.leader_transitions.get(direction).copied().unwrap_or(0)
    }
}

/// Gauges are sampled at scrape time rather than tracked incrementally.
#[derive(Clone, Debug, Default)]
pub struct GaugeSample {
    pub queue_ready: usize,
    pub queue_processing: usize,
    pub queue_inflight: usize,
    pub leader_active: bool,
    pub fence_token: u64,
    pub registered_agents: usize,
    pub uptime_seconds: u64,
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl SchedulerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, role: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.ticks.entry(role).or_default() += 1;
        }
    }

    pub fn record_dispatch(&self, outcome: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.dispatches.entry(outcome).or_default() += 1;
        }
    }

    pub fn record_callback(&self, outcome: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.callbacks.entry(outcome).or_default() += 1;
        }
    }

    pub fn record_auth(&self, outcome: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.auth.entry(outcome).or_default() += 1;
        }
    }

    pub fn record_leader_transition(&self, direction: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.leader_transitions.entry(direction).or_default() += 1;
        }
    }

    pub fn record_store_error(&self, op: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.store_errors.entry(op.to_string()).or_default() += 1;
        }
    }

    pub fn record_market_fetch_error(&self, source: &'static str) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.market_fetch_errors.entry(source).or_default() += 1;
        }
    }

    pub fn record_queue_full(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.queue_full_total += 1;
        }
    }

    pub fn record_enqueued(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tasks_enqueued_total += 1;
        }
    }

    pub fn record_requeue(&self, requeued: usize, dropped: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.tasks_requeued_total += requeued as u64;
            inner.tasks_dropped_total += dropped as u64;
        }
    }

    pub fn record_invalid_task(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.invalid_tasks_total += 1;
        }
    }

    pub fn observe_upstream_latency_ms(&self, latency_ms: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.upstream_latency.observe(latency_ms);
        }
    }

    pub fn observe_callback_latency_ms(&self, latency_ms: f64) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.callback_latency.observe(latency_ms);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner
            .lock()
            .map(|inner| inner.clone())
            .unwrap_or_default()
    }

    /// Prometheus text exposition.
    #[must_use]
    pub fn render_prometheus(&self, gauges: &GaugeSample) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        render_labelled(
            &mut out,
            "ticks_total",
            "Scheduler ticks by role.",
            "role",
            snapshot.ticks.iter().map(|(k, v)| (*k, *v)),
        );
        render_labelled(
            &mut out,
            "dispatches_total",
            "Cycle dispatch attempts by outcome.",
            "outcome",
            snapshot.dispatches.iter().map(|(k, v)| (*k, *v)),
        );
        render_labelled(
            &mut out,
            "callbacks_total",
            "Callback deliveries by outcome.",
            "outcome",
            snapshot.callbacks.iter().map(|(k, v)| (*k, *v)),
        );
        render_labelled(
            &mut out,
            "auth_total",
            "Request authentication decisions by outcome.",
            "outcome",
            snapshot.auth.iter().map(|(k, v)| (*k, *v)),
        );
        render_labelled(
            &mut out,
            "leader_transitions_total",
            "Leadership changes observed by this instance.",
            "direction",
            snapshot.leader_transitions.iter().map(|(k, v)| (*k, *v)),
        );
        render_labelled(
            &mut out,
            "store_errors_total",
            "Backing store operations that failed.",
            "op",
            snapshot.store_errors.iter().map(|(k, v)| (k.as_str(), *v)),
        );
        render_labelled(
            &mut out,
            "market_fetch_errors_total",
            "Upstream market reads that failed.",
            "source",
            snapshot.market_fetch_errors.iter().map(|(k, v)| (*k, *v)),
        );
        render_plain(
            &mut out,
            "queue_full_total",
            "counter",
            "Enqueue attempts refused at capacity.",
            snapshot.queue_full_total,
        );
        render_plain(
            &mut out,
            "tasks_enqueued_total",
            "counter",
            "Execution tasks accepted by the queue.",
            snapshot.tasks_enqueued_total,
        );
        render_plain(
            &mut out,
            "tasks_requeued_total",
            "counter",
            "Expired in-flight tasks moved back to ready.",
            snapshot.tasks_requeued_total,
        );
        render_plain(
            &mut out,
            "tasks_dropped_total",
            "counter",
            "Expired in-flight tasks dropped because their payload was gone.",
            snapshot.tasks_dropped_total,
        );
        render_plain(
            &mut out,
            "invalid_tasks_total",
            "counter",
            "Claimed tasks discarded as malformed.",
            snapshot.invalid_tasks_total,
        );

        render_plain(
            &mut out,
            "queue_depth",
            "gauge",
            "Ready plus in-flight execution tasks.",
            (gauges.queue_ready + gauges.queue_inflight) as u64,
        );
        render_plain(
            &mut out,
            "queue_processing",
            "gauge",
            "Claimed tasks awaiting acknowledgement.",
            gauges.queue_processing as u64,
        );
        render_plain(
            &mut out,
            "leader_active",
            "gauge",
            "1 when this instance holds the leader lock.",
            u64::from(gauges.leader_active),
        );
        render_plain(
            &mut out,
            "leader_fence_token",
            "gauge",
            "Fence token of the current leadership term, 0 when follower.",
            gauges.fence_token,
        );
        render_plain(
            &mut out,
            "registered_agents",
            "gauge",
            "Agents known to this instance.",
            gauges.registered_agents as u64,
        );
        render_plain(
            &mut out,
            "uptime_seconds",
            "gauge",
            "Seconds since the process started.",
            gauges.uptime_seconds,
        );

        render_histogram(
            &mut out,
            "upstream_latency_ms",
            "Upstream market read latency in milliseconds.",
            &snapshot.upstream_latency,
        );
        render_histogram(
            &mut out,
            "callback_latency_ms",
            "Callback POST latency in milliseconds.",
            &snapshot.callback_latency,
        );
        out
    }
}

fn render_plain(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
    let _ = writeln!(out, "{PREFIX}_{name} {value}");
}

fn render_labelled<'a>(
    out: &mut String,
    name: &str,
    help: &str,
    label: &str,
    series: impl Iterator<Item = (&'a str, u64)>,
) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} counter");
    for (value, count) in series {
        let _ = writeln!(out, "{PREFIX}_{name}{{{label}=\"{value}\"}} {count}");
    }
}

fn render_histogram(out: &mut String, name: &str, help: &str, histogram: &LatencyHistogram) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} histogram");
    for (idx, upper_bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
        let _ = writeln!(
            out,
            "{PREFIX}_{name}_bucket{{le=\"{upper_bound}\"}} {}",
            histogram.buckets[idx]
        );
    }
    let _ = writeln!(
        out,
        "{PREFIX}_{name}_bucket{{le=\"+Inf\"}} {}",
        histogram.count
    );
    let _ = writeln!(out, "{PREFIX}_{name}_sum {:.3}", histogram.sum_ms);
    let _ = writeln!(out, "{PREFIX}_{name}_count {}", histogram.count);
}
