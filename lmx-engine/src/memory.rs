//! Host memory sampling and load admission.
//!
//! The monitor answers one question: can a model of a given size be admitted
//! without pushing host memory past the configured threshold? Samples are
//! cached briefly so request bursts don't hammer the OS.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::warn;

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Safety margin applied to every raw size estimate.
pub const MEMORY_SAFETY_MARGIN: f64 = 1.15;

/// One raw memory reading in bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySample {
    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GB
    }

    /// Used share of total; a zero total reads as full.
    pub fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Accelerator memory counters, when the platform exposes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// Where memory readings come from.
pub trait MemorySource: Send + Sync {
    fn sample(&self) -> MemorySample;

    /// Unavailable counters are `None`, never an error.
    fn gpu_sample(&self) -> Option<GpuSample> {
        None
    }
}

/// Reads host memory through `sysinfo`.
pub struct SystemMemorySource {
    system: Mutex<System>,
}

impl SystemMemorySource {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource for SystemMemorySource {
    fn sample(&self) -> MemorySample {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        let total = sys.total_memory();
        let available = sys.available_memory();
        MemorySample {
            total_bytes: total,
            used_bytes: total.saturating_sub(available),
            available_bytes: available,
        }
    }
}

/// Fixed-size source whose usage can be moved by hand. Used by tests and dry runs.
pub struct StaticMemorySource {
    total_bytes: u64,
    used_bytes: Mutex<u64>,
}

impl StaticMemorySource {
    pub fn new(total_gb: f64, used_gb: f64) -> Self {
        Self {
            total_bytes: (total_gb * GB) as u64,
            used_bytes: Mutex::new((used_gb * GB) as u64),
        }
    }

    pub fn set_used_gb(&self, used_gb: f64) {
        let mut used = self.used_bytes.lock().unwrap_or_else(|e| e.into_inner());
        *used = ((used_gb * GB) as u64).min(self.total_bytes);
    }

    pub fn add_used_gb(&self, delta_gb: f64) {
        let mut used = self.used_bytes.lock().unwrap_or_else(|e| e.into_inner());
        let next = (*used as f64 + delta_gb * GB).clamp(0.0, self.total_bytes as f64);
        *used = next as u64;
    }
}

impl MemorySource for StaticMemorySource {
    fn sample(&self) -> MemorySample {
        let used = *self.used_bytes.lock().unwrap_or_else(|e| e.into_inner());
        MemorySample {
            total_bytes: self.total_bytes,
            used_bytes: used,
            available_bytes: self.total_bytes.saturating_sub(used),
        }
    }
}

/// Snapshot reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
    pub threshold_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_total_gb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_used_gb: Option<f64>,
}

/// Cached memory sampler with a hard usage threshold.
pub struct MemoryMonitor {
    source: Arc<dyn MemorySource>,
    threshold_percent: f64,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, MemorySample)>>,
}

impl MemoryMonitor {
    /// Monitor the real host.
    pub fn new(threshold_percent: f64, cache_ttl: Duration) -> Self {
        Self::with_source(
            Arc::new(SystemMemorySource::new()),
            threshold_percent,
            cache_ttl,
        )
    }

    pub fn with_source(
        source: Arc<dyn MemorySource>,
        threshold_percent: f64,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            source,
            threshold_percent,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn from_config(config: &lmx_core::MemoryConfig) -> Self {
        Self::new(
            config.max_percent,
            Duration::from_millis(config.cache_ttl_ms),
        )
    }

    pub fn threshold_percent(&self) -> f64 {
        self.threshold_percent
    }

    fn sample(&self) -> MemorySample {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((at, sample)) = *cache
            && at.elapsed() < self.cache_ttl
        {
            return sample;
        }
        let sample = self.source.sample();
        *cache = Some((Instant::now(), sample));
        sample
    }

    /// Drop the cached sample so the next read hits the source.
    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn total_gb(&self) -> f64 {
        self.sample().total_gb()
    }

    pub fn used_gb(&self) -> f64 {
        self.sample().used_bytes as f64 / GB
    }

    pub fn available_gb(&self) -> f64 {
        self.sample().available_bytes as f64 / GB
    }

    pub fn usage_percent(&self) -> f64 {
        self.sample().usage_percent()
    }

    /// Would loading `estimated_size_gb` keep usage below the threshold?
    pub fn can_load(&self, estimated_size_gb: f64) -> bool {
        self.can_load_with_reserved(Some(estimated_size_gb), 0.0)
    }

    /// Admission counting already-reserved (pre-buffered) memory of loads in flight.
    ///
    /// Without an estimate only current usage plus reservations is checked.
    pub fn can_load_with_reserved(&self, estimated_size_gb: Option<f64>, reserved_gb: f64) -> bool {
        let sample = self.sample();
        let total_gb = sample.total_gb();
        if total_gb <= 0.0 {
            return false;
        }
        let current = sample.usage_percent();
        let buffered = estimated_size_gb.map_or(0.0, |gb| gb.max(0.0) * MEMORY_SAFETY_MARGIN);
        let additional = (buffered + reserved_gb.max(0.0)) / total_gb * 100.0;
        let projected = current + additional;
        let safe = projected < self.threshold_percent;
        if !safe {
            warn!(
                current_percent = current,
                estimated_gb = estimated_size_gb,
                reserved_gb,
                projected_percent = projected,
                threshold_percent = self.threshold_percent,
                "memory_threshold_exceeded"
            );
        }
        safe
    }

    /// Is the host already at or past the threshold?
    pub fn threshold_exceeded(&self) -> bool {
        self.usage_percent() >= self.threshold_percent
    }

    pub fn get_status(&self) -> MemoryStatus {
        let sample = self.sample();
        let gpu = self.source.gpu_sample();
        MemoryStatus {
            total_gb: round2(sample.total_gb()),
            used_gb: round2(sample.used_bytes as f64 / GB),
            available_gb: round2(sample.available_bytes as f64 / GB),
            usage_percent: round2(sample.usage_percent()),
            threshold_percent: self.threshold_percent,
            gpu_total_gb: gpu.map(|g| round2(g.total_bytes as f64 / GB)),
            gpu_used_gb: gpu.map(|g| round2(g.used_bytes as f64 / GB)),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn monitor(total: f64, used: f64, threshold: f64) -> (MemoryMonitor, Arc<StaticMemorySource>) {
        let source = Arc::new(StaticMemorySource::new(total, used));
        let monitor = MemoryMonitor::with_source(source.clone(), threshold, Duration::ZERO);
        (monitor, source)
    }

    #[test]
    fn test_can_load_applies_safety_margin() {
        // 100 GB host at 50% with a 90% threshold: 40 GB of headroom.
        let (m, _) = monitor(100.0, 50.0, 90.0);
        // 34 * 1.15 = 39.1 -> 89.1% < 90
        assert!(m.can_load(34.0));
        // 35 * 1.15 = 40.25 -> 90.25% >= 90
        assert!(!m.can_load(35.0));
    }

    #[test]
    fn test_can_load_rejects_when_already_over() {
        let (m, _) = monitor(100.0, 95.0, 90.0);
        assert!(!m.can_load(0.0));
        assert!(!m.can_load(1.0));
    }

    #[test]
    fn test_reserved_memory_counts_against_threshold() {
        let (m, _) = monitor(100.0, 50.0, 90.0);
        assert!(m.can_load_with_reserved(Some(10.0), 0.0));
        assert!(!m.can_load_with_reserved(Some(10.0), 30.0));
        assert!(m.can_load_with_reserved(None, 39.0));
        assert!(!m.can_load_with_reserved(None, 41.0));
    }

    #[test]
    fn test_status_omits_missing_gpu_counters() {
        let (m, _) = monitor(64.0, 16.0, 90.0);
        let status = m.get_status();
        assert_eq!(status.total_gb, 64.0);
        assert_eq!(status.used_gb, 16.0);
        assert_eq!(status.available_gb, 48.0);
        assert_eq!(status.usage_percent, 25.0);
        assert_eq!(status.threshold_percent, 90.0);

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("gpu_total_gb").is_none());
    }

    #[test]
    fn test_cache_hides_changes_until_invalidated() {
        let source = Arc::new(StaticMemorySource::new(100.0, 10.0));
        let m = MemoryMonitor::with_source(source.clone(), 90.0, Duration::from_secs(60));
        assert_eq!(m.get_status().used_gb, 10.0);

        source.set_used_gb(80.0);
        assert_eq!(m.get_status().used_gb, 10.0);

        m.invalidate();
        assert_eq!(m.get_status().used_gb, 80.0);
    }

    /// Replays readings in order, then repeats the last one.
    struct SequenceSource(Mutex<VecDeque<MemorySample>>);

    impl MemorySource for SequenceSource {
        fn sample(&self) -> MemorySample {
            let mut readings = self.0.lock().unwrap();
            if readings.len() > 1 {
                readings.pop_front().unwrap()
            } else {
                readings[0]
            }
        }
    }

    fn reading(total_gb: f64, used_gb: f64) -> MemorySample {
        MemorySample {
            total_bytes: (total_gb * GB) as u64,
            used_bytes: (used_gb * GB) as u64,
            available_bytes: ((total_gb - used_gb) * GB) as u64,
        }
    }

    #[test]
    fn test_admission_decides_on_a_single_reading() {
        let source = Arc::new(SequenceSource(Mutex::new(VecDeque::from([
            reading(100.0, 10.0),
            reading(100.0, 95.0),
        ]))));
        let m = MemoryMonitor::with_source(source, 90.0, Duration::ZERO);

        // Both total and usage come from the 10% reading.
        assert!(m.can_load(1.0));
        // The next call sees only the 95% reading.
        assert!(!m.can_load(1.0));
    }

    #[test]
    fn test_threshold_exceeded() {
        let (m, source) = monitor(100.0, 89.0, 90.0);
        assert!(!m.threshold_exceeded());
        source.set_used_gb(90.0);
        assert!(m.threshold_exceeded());
    }

    #[test]
    fn test_system_source_reports_nonzero_total() {
        let sample = SystemMemorySource::new().sample();
        assert!(sample.total_bytes > 0);
        assert!(sample.used_bytes <= sample.total_bytes);
    }
}
