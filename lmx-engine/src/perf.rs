//! Running per-model performance totals that feed the autotune registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::autotune::AutotuneMetrics;

/// One finished request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfSample {
    pub ok: bool,
    pub completion_tokens: u64,
    pub latency: Duration,
    pub ttft: Option<Duration>,
    pub queue_wait: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfWindow {
    pub requests: u64,
    pub errors: u64,
    pub completion_tokens: u64,
    pub total_latency_ms: f64,
    pub ttft_total_ms: f64,
    pub ttft_samples: u64,
    pub queue_wait_total_ms: f64,
}

impl PerfWindow {
    pub fn record(&mut self, sample: &PerfSample) {
        self.requests += 1;
        self.total_latency_ms += sample.latency.as_secs_f64() * 1000.0;
        self.queue_wait_total_ms += sample.queue_wait.as_secs_f64() * 1000.0;
        if !sample.ok {
            self.errors += 1;
            return;
        }
        self.completion_tokens += sample.completion_tokens;
        if let Some(ttft) = sample.ttft {
            self.ttft_total_ms += ttft.as_secs_f64() * 1000.0;
            self.ttft_samples += 1;
        }
    }

    pub fn to_metrics(&self) -> AutotuneMetrics {
        let per_request = |total: f64| {
            if self.requests == 0 {
                0.0
            } else {
                total / self.requests as f64
            }
        };
        AutotuneMetrics {
            avg_tokens_per_second: if self.total_latency_ms > 0.0 {
                self.completion_tokens as f64 / (self.total_latency_ms / 1000.0)
            } else {
                0.0
            },
            avg_ttft_ms: if self.ttft_samples == 0 {
                0.0
            } else {
                self.ttft_total_ms / self.ttft_samples as f64
            },
            error_rate: per_request(self.errors as f64),
            avg_total_ms: per_request(self.total_latency_ms),
            queue_wait_ms: per_request(self.queue_wait_total_ms),
            requests: self.requests,
        }
    }
}

/// Windows keyed by model id. Reset on every successful load.
#[derive(Debug, Default)]
pub struct PerfRegistry {
    windows: Mutex<HashMap<String, PerfWindow>>,
}

impl PerfRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, model_id: &str) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(model_id.to_string(), PerfWindow::default());
    }

    pub fn remove(&self, model_id: &str) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(model_id);
    }

    /// Samples for unknown ids (unloaded mid-request) are dropped.
    pub fn record(&self, model_id: &str, sample: PerfSample) {
        if let Some(window) = self
            .windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(model_id)
        {
            window.record(&sample);
        }
    }

    pub fn window(&self, model_id: &str) -> Option<PerfWindow> {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .cloned()
    }
}
