//! Resource Manager: computes CPU/memory/thread/buffer parameters for the
//! FFmpeg Argument Builder from live system load. Produces values only; it
//! never enforces them — enforcement is the argument builder's job.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sysinfo::System;

use crate::domain::SpeedPriority;

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// System snapshot the allocation policy is computed from.
#[derive(Debug, Clone, Copy)]
struct SystemSnapshot {
    cores: usize,
    total_memory_mb: u64,
    available_memory_mb: u64,
    load_1m: f64,
}

/// Resource parameters advised for one transcode (not enforced here).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceConfig {
    pub thread_count: usize,
    pub muxing_queue_size: u32,
    pub buffer_size_kb: u32,
    pub rc_lookahead: u32,
    pub encoder_preset: &'static str,
    /// `-probesize` value in bytes, scaled with speed priority — a quality
    /// encode can afford to let ffmpeg read further into the input before
    /// committing to stream parameters.
    pub probe_size_bytes: u64,
    /// `-analyzeduration` value in microseconds, same scaling rationale.
    pub analyze_duration_us: u64,
}

struct Inner {
    system: System,
    snapshot: SystemSnapshot,
    last_refresh: Instant,
}

/// Resource Manager: `OptimalResources(is_abr, stream_count, speed_priority) -> ResourceConfig`.
pub struct ResourceManager {
    inner: RwLock<Inner>,
}

impl ResourceManager {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        let snapshot = Self::sample(&mut system);
        Self {
            inner: RwLock::new(Inner {
                system,
                snapshot,
                last_refresh: Instant::now(),
            }),
        }
    }

    fn sample(system: &mut System) -> SystemSnapshot {
        system.refresh_cpu_all();
        system.refresh_memory();
        let load = System::load_average();
        SystemSnapshot {
            cores: system.cpus().len().max(1),
            total_memory_mb: system.total_memory() / (1024 * 1024),
            available_memory_mb: system.available_memory() / (1024 * 1024),
            load_1m: load.one,
        }
    }

    fn current_snapshot(&self) -> SystemSnapshot {
        {
            let inner = self.inner.read();
            if inner.last_refresh.elapsed() < REFRESH_INTERVAL {
                return inner.snapshot;
            }
        }
        let mut inner = self.inner.write();
        if inner.last_refresh.elapsed() >= REFRESH_INTERVAL {
            inner.snapshot = Self::sample(&mut inner.system);
            inner.last_refresh = Instant::now();
        }
        inner.snapshot
    }

    /// Advise resource parameters for a transcode about to be launched.
    pub fn optimal_resources(
        &self,
        is_abr: bool,
        stream_count: usize,
        speed_priority: SpeedPriority,
    ) -> ResourceConfig {
        let snap = self.current_snapshot();
        let cores = snap.cores;

        let cpu_reservation = if snap.load_1m > 0.8 * cores as f64 {
            0.25
        } else if snap.load_1m > 0.5 * cores as f64 {
            0.40
        } else {
            0.50
        };
        let available_cores = ((cores as f64) * cpu_reservation).round().max(1.0) as usize;
        let available_cores = available_cores.min(cores);

        let stream_count = stream_count.max(1);
        let thread_count = if is_abr {
            let per_stream = (available_cores as f64 / stream_count as f64).clamp(2.0, 4.0) as usize;
            available_cores.min(stream_count * per_stream)
        } else {
            available_cores.min(8)
        };

        let memory_budget_mb =
            ((0.6 * snap.available_memory_mb as f64).min(0.4 * snap.total_memory_mb as f64)) as u64;

        let memory_tier = if snap.total_memory_mb < 4096 {
            0
        } else if snap.total_memory_mb < 16384 {
            1
        } else {
            2
        };
        let per_stream_base_mb: u64 = match memory_tier {
            0 => 512,
            1 => 768,
            _ => 1024,
        };
        let per_stream_mb = per_stream_base_mb.max(memory_budget_mb / stream_count as u64);

        let encoder_preset: &'static str = if cores < 4 {
            "ultrafast"
        } else if cores < 8 {
            match speed_priority {
                SpeedPriority::Fastest => "veryfast",
                _ => "faster",
            }
        } else {
            match speed_priority {
                SpeedPriority::Fastest => "faster",
                _ => "fast",
            }
        };

        let mut muxing_queue_size = match memory_tier {
            0 => 512,
            1 => 1024,
            _ => 2048,
        };
        if is_abr {
            muxing_queue_size *= 2;
        }

        let rc_lookahead = rc_lookahead_for(speed_priority);

        let buffer_size_kb = (per_stream_mb * 1024 / 8) as u32;

        let (probe_size_bytes, analyze_duration_us) = match speed_priority {
            SpeedPriority::Quality => (10_000_000, 10_000_000),
            SpeedPriority::Balanced => (5_000_000, 5_000_000),
            SpeedPriority::Fastest => (2_000_000, 2_000_000),
        };

        ResourceConfig {
            thread_count,
            muxing_queue_size,
            buffer_size_kb,
            rc_lookahead,
            encoder_preset,
            probe_size_bytes,
            analyze_duration_us,
        }
    }
}

/// RC lookahead (frames) by speed priority: quality priority 20-40, balanced
/// 10, speed 5. Also the source of the `-rc-lookahead`/`-rc_lookahead` flag
/// the argument builder emits per stream.
pub fn rc_lookahead_for(speed_priority: SpeedPriority) -> u32 {
    match speed_priority {
        SpeedPriority::Quality => 40,
        SpeedPriority::Balanced => 10,
        SpeedPriority::Fastest => 5,
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_scales_with_core_count_and_priority() {
        let mgr = ResourceManager::new();
        let cfg = mgr.optimal_resources(false, 1, SpeedPriority::Quality);
        assert!(cfg.rc_lookahead >= 20 && cfg.rc_lookahead <= 40);
        assert!(cfg.thread_count >= 1);
    }

    #[test]
    fn abr_doubles_muxing_queue_relative_to_single_stream() {
        let mgr = ResourceManager::new();
        let single = mgr.optimal_resources(false, 1, SpeedPriority::Balanced);
        let abr = mgr.optimal_resources(true, 3, SpeedPriority::Balanced);
        assert_eq!(abr.muxing_queue_size, single.muxing_queue_size * 2);
    }
}
