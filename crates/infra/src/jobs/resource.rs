//! Process resource sampling and the debounced throttle signal.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{JobConfiguration, ResourceMetrics};

/// One reading of process resource usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSample {
    pub memory_mb: u64,
    pub cpu_percent: Option<f32>,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSample {
    pub fn to_metrics(&self, records_per_second: Option<f64>) -> ResourceMetrics {
        ResourceMetrics {
            cpu_percent: self.cpu_percent,
            memory_mb: Some(self.memory_mb),
            records_per_second,
            sampled_at: Some(self.sampled_at),
        }
    }
}

/// Source of resource readings. `None` means "unavailable on this platform".
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> Option<ResourceSample>;
}

/// Samples the current process through `sysinfo`.
pub struct SysinfoSampler {
    system: System,
    pid: Option<Pid>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = e, "cannot resolve current pid; resource sampling disabled"))
            .ok();
        Self {
            system: System::new(),
            pid,
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self) -> Option<ResourceSample> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        let process = self.system.process(pid)?;
        Some(ResourceSample {
            memory_mb: process.memory() / 1024 / 1024,
            cpu_percent: Some(process.cpu_usage()),
            sampled_at: Utc::now(),
        })
    }
}

/// Host name for job provenance.
pub fn host_name() -> Option<String> {
    System::host_name()
}

/// Limits above which a sample counts as a breach.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub memory_mb: f64,
    pub cpu_percent: f64,
}

impl ResourceThresholds {
    pub fn from_configuration(config: &JobConfiguration) -> Self {
        Self {
            memory_mb: config.memory_threshold_mb(),
            cpu_percent: config.cpu_threshold_percent(),
        }
    }

    fn breached_by(&self, sample: &ResourceSample) -> bool {
        let memory = sample.memory_mb as f64 > self.memory_mb;
        let cpu = sample
            .cpu_percent
            .is_some_and(|cpu| f64::from(cpu) > self.cpu_percent);
        memory || cpu
    }
}

/// Sampling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingSchedule {
    /// Sample after this many completed chunks...
    pub every_chunks: u32,
    /// ...or once this much time has passed, whichever comes first.
    pub interval: Duration,
    /// Consecutive breached samples needed to signal throttle.
    pub required_breaches: u32,
}

impl Default for SamplingSchedule {
    fn default() -> Self {
        Self {
            every_chunks: 1,
            interval: Duration::from_secs(5),
            required_breaches: 2,
        }
    }
}

/// Debounced resource watchdog.
///
/// A throttle is signalled only after `required_breaches` consecutive breached
/// samples. A failed sample counts as healthy and breaks the streak, so
/// monitoring being unavailable never throttles a job.
pub struct ResourceMonitor {
    sampler: Box<dyn ResourceSampler>,
    thresholds: ResourceThresholds,
    schedule: SamplingSchedule,
    chunks_since_sample: u32,
    last_sample_at: Option<Instant>,
    consecutive_breaches: u32,
    last_sample: Option<ResourceSample>,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Box<dyn ResourceSampler>,
        thresholds: ResourceThresholds,
        schedule: SamplingSchedule,
    ) -> Self {
        Self {
            sampler,
            thresholds,
            schedule,
            chunks_since_sample: 0,
            last_sample_at: None,
            consecutive_breaches: 0,
            last_sample: None,
        }
    }

    pub fn last_sample(&self) -> Option<&ResourceSample> {
        self.last_sample.as_ref()
    }

    /// Call once per completed chunk. Returns `true` when the job should throttle.
    pub fn on_chunk_completed(&mut self) -> bool {
        self.chunks_since_sample += 1;
        let by_count = self.chunks_since_sample >= self.schedule.every_chunks.max(1);
        let by_time = self
            .last_sample_at
            .is_none_or(|at| at.elapsed() >= self.schedule.interval);
        if !(by_count || by_time) {
            return false;
        }
        self.sample_now()
    }

    /// Take a sample immediately and update the breach streak.
    pub fn sample_now(&mut self) -> bool {
        self.chunks_since_sample = 0;
        self.last_sample_at = Some(Instant::now());

        let Some(sample) = self.sampler.sample() else {
            debug!("resource sample unavailable; not throttling");
            self.consecutive_breaches = 0;
            return false;
        };

        if self.thresholds.breached_by(&sample) {
            self.consecutive_breaches += 1;
            debug!(
                memory_mb = sample.memory_mb,
                cpu_percent = ?sample.cpu_percent,
                streak = self.consecutive_breaches,
                "resource threshold breached"
            );
        } else {
            self.consecutive_breaches = 0;
        }
        self.last_sample = Some(sample);

        self.consecutive_breaches >= self.schedule.required_breaches.max(1)
    }
}
