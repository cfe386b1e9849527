// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC latency, timeouts and queue depth.
//!
//! [`MetricsSink`] listens to lifecycle events on the caller side. Every
//! round trip feeds a Prometheus histogram and a bounded window of recent
//! samples; percentiles are taken from the window, so they describe the last
//! [`LATENCY_WINDOW`] calls rather than the whole process lifetime.
//! [`MetricsReporter`] adds the depth of the work queue and its holding queue.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use dispatch_broker::Broker;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::events::{EventSink, LifecycleEvent};

/// Number of recent round trips percentiles are computed over.
pub const LATENCY_WINDOW: usize = 1000;

/// Round-trip latency over the sample window, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcStats {
    pub latency_seconds: LatencyStats,
    pub timeouts_total: u64,
}

/// Depth of one queue, or why it could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueDepth {
    Depth { messages: usize, consumers: usize },
    Unavailable { error: String },
}

/// Everything the `metrics` operation reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub queues: BTreeMap<String, QueueDepth>,
    pub rpc: RpcStats,
}

/// Event sink that measures caller-side round trips.
pub struct MetricsSink {
    registry: Registry,
    replies: IntCounterVec,
    timeouts: IntCounter,
    latency: Histogram,
    queue_depth: IntGaugeVec,
    window: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl MetricsSink {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_window(LATENCY_WINDOW)
    }

    /// A sink keeping the last `capacity` latency samples.
    pub fn with_window(capacity: usize) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let replies = IntCounterVec::new(
            Opts::new(
                "dispatch_rpc_replies_total",
                "Replies received by callers, by outcome",
            ),
            &["outcome"],
        )?;
        let timeouts = IntCounter::new(
            "dispatch_rpc_timeouts_total",
            "Calls that got no reply within their timeout",
        )?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "dispatch_rpc_latency_seconds",
            "Time from publishing a call to receiving its reply",
        ))?;
        let queue_depth = IntGaugeVec::new(
            Opts::new(
                "dispatch_queue_messages",
                "Messages ready for delivery, sampled on report",
            ),
            &["queue"],
        )?;

        registry.register(Box::new(replies.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let capacity = capacity.max(1);
        Ok(Self {
            registry,
            replies,
            timeouts,
            latency,
            queue_depth,
            window: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn observe(&self, seconds: f64) {
        self.latency.observe(seconds);
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == self.capacity {
            window.pop_front();
        }
        window.push_back(seconds);
    }

    /// Current latency statistics and timeout total.
    pub fn snapshot(&self) -> RpcStats {
        let mut samples: Vec<f64> = {
            let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            window.iter().copied().collect()
        };
        let timeouts_total = self.timeouts.get();
        if samples.is_empty() {
            return RpcStats {
                latency_seconds: LatencyStats::default(),
                timeouts_total,
            };
        }

        let count = samples.len();
        let avg = samples.iter().sum::<f64>() / count as f64;
        samples.sort_by(f64::total_cmp);
        // Nearest rank below the exact position.
        let rank = |q: f64| samples[(q * (count - 1) as f64) as usize];

        RpcStats {
            latency_seconds: LatencyStats {
                count,
                avg: Some(avg),
                p50: Some(rank(0.50)),
                p95: Some(rank(0.95)),
            },
            timeouts_total,
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl EventSink for MetricsSink {
    fn record(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::ReplyReceived {
                success, elapsed, ..
            } => {
                let outcome = if *success { "success" } else { "error" };
                self.replies.with_label_values(&[outcome]).inc();
                self.observe(elapsed.as_secs_f64());
            }
            LifecycleEvent::CallTimedOut { .. } => self.timeouts.inc(),
            _ => {}
        }
    }
}

/// Reports RPC statistics together with the depth of watched queues.
#[derive(Clone)]
pub struct MetricsReporter {
    sink: Arc<MetricsSink>,
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
}

impl MetricsReporter {
    pub fn new(sink: Arc<MetricsSink>, broker: Arc<dyn Broker>, queues: Vec<String>) -> Self {
        Self {
            sink,
            broker,
            queues,
        }
    }

    pub fn sink(&self) -> &Arc<MetricsSink> {
        &self.sink
    }

    /// Sample queue depths. A queue that cannot be read is reported with its
    /// error; the other entries are unaffected.
    pub async fn queue_depths(&self) -> BTreeMap<String, QueueDepth> {
        let mut depths = BTreeMap::new();
        for queue in &self.queues {
            let depth = match (
                self.broker.message_count(queue).await,
                self.broker.consumer_count(queue).await,
            ) {
                (Ok(messages), Ok(consumers)) => {
                    self.sink
                        .queue_depth
                        .with_label_values(&[queue.as_str()])
                        .set(messages as i64);
                    QueueDepth::Depth {
                        messages,
                        consumers,
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(queue = %queue, error = %e, "Failed to read queue depth");
                    QueueDepth::Unavailable {
                        error: e.to_string(),
                    }
                }
            };
            depths.insert(queue.clone(), depth);
        }
        depths
    }

    pub async fn report(&self) -> MetricsReport {
        MetricsReport {
            queues: self.queue_depths().await,
            rpc: self.sink.snapshot(),
        }
    }

    /// Sample queue depths, then render every metric as Prometheus text.
    pub async fn render(&self) -> Result<String, prometheus::Error> {
        self.queue_depths().await;
        self.sink.encode_text()
    }
}
