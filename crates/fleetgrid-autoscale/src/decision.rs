//! Scale decisions over the aggregate metrics window.
//!
//! Everything here is pure: callers pass the clock and counts in, so the
//! threshold and cooldown rules can be exercised without a pool.

use std::collections::VecDeque;

use tracing::debug;

use fleet_core::ScalingConfig;
use fleetgrid_state::InstanceMetrics;

/// Number of most recent samples averaged per evaluation.
pub const EVALUATION_SAMPLES: usize = 3;

/// What one evaluation wants done.
#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDecision {
    /// Create `add` instances.
    ScaleUp { add: u32, reason: String },
    /// Terminate `remove` running instances.
    ScaleDown { remove: u32, reason: String },
    NoChange,
}

/// Timestamps (unix seconds) of the last automatic action per direction.
///
/// Tracked independently: a scale-up never delays a scale-down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cooldowns {
    pub last_scale_up: Option<u64>,
    pub last_scale_down: Option<u64>,
}

impl Cooldowns {
    pub fn scale_up_ready(&self, config: &ScalingConfig, now: u64) -> bool {
        cooled(self.last_scale_up, now, config.scale_up_cooldown_seconds)
    }

    pub fn scale_down_ready(&self, config: &ScalingConfig, now: u64) -> bool {
        cooled(self.last_scale_down, now, config.scale_down_cooldown_seconds)
    }
}

fn cooled(last: Option<u64>, now: u64, cooldown: u64) -> bool {
    last.is_none_or(|at| now.saturating_sub(at) >= cooldown)
}

/// Pool size as the control loop sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetCounts {
    pub running: u32,
    /// Starting + running.
    pub active: u32,
}

/// Field-wise mean. `None` for an empty input.
pub fn mean<'a>(samples: impl IntoIterator<Item = &'a InstanceMetrics>) -> Option<InstanceMetrics> {
    let mut sum = InstanceMetrics::default();
    let mut n = 0usize;
    for s in samples {
        sum.cpu_utilization += s.cpu_utilization;
        sum.memory_utilization += s.memory_utilization;
        sum.requests_per_second += s.requests_per_second;
        sum.response_time_ms += s.response_time_ms;
        n += 1;
    }
    if n == 0 {
        return None;
    }
    let n = n as f64;
    Some(InstanceMetrics {
        cpu_utilization: sum.cpu_utilization / n,
        memory_utilization: sum.memory_utilization / n,
        requests_per_second: sum.requests_per_second / n,
        response_time_ms: sum.response_time_ms / n,
    })
}

/// Mean of the [`EVALUATION_SAMPLES`] newest samples, or `None` while the
/// window holds fewer than that.
pub fn recent_mean(window: &VecDeque<InstanceMetrics>) -> Option<InstanceMetrics> {
    if window.len() < EVALUATION_SAMPLES {
        return None;
    }
    mean(window.iter().rev().take(EVALUATION_SAMPLES))
}

/// Decide one tick.
///
/// Scale-down is only considered when scale-up did not fire.
pub fn evaluate(
    config: &ScalingConfig,
    mean: &InstanceMetrics,
    counts: FleetCounts,
    cooldowns: Cooldowns,
    now: u64,
) -> ScaleDecision {
    if let Some(reason) = overload_reason(config, mean)
        && counts.running < config.max_instances
        && cooldowns.scale_up_ready(config, now)
    {
        let wanted = counts.running.div_ceil(2);
        let headroom = config.max_instances.saturating_sub(counts.active);
        let add = wanted.min(headroom);
        if add > 0 {
            return ScaleDecision::ScaleUp { add, reason };
        }
        debug!(
            running = counts.running,
            active = counts.active,
            max = config.max_instances,
            "scale-up clamped to zero"
        );
    }

    if counts.running > config.min_instances
        && cooldowns.scale_down_ready(config, now)
        && let Some(reason) = idle_reason(config, mean)
    {
        let wanted = counts.running / 4;
        let remove = wanted.min(counts.running - config.min_instances);
        if remove > 0 {
            return ScaleDecision::ScaleDown { remove, reason };
        }
    }

    ScaleDecision::NoChange
}

/// Any gate exceeded.
fn overload_reason(config: &ScalingConfig, m: &InstanceMetrics) -> Option<String> {
    let mut reasons = Vec::new();
    if m.cpu_utilization > config.target_cpu_utilization {
        reasons.push(format!(
            "cpu {:.1}% above target {:.1}%",
            m.cpu_utilization, config.target_cpu_utilization
        ));
    }
    if m.memory_utilization > config.target_memory_utilization {
        reasons.push(format!(
            "memory {:.1}% above target {:.1}%",
            m.memory_utilization, config.target_memory_utilization
        ));
    }
    if m.response_time_ms > config.high_response_time_ms {
        reasons.push(format!(
            "response time {:.0}ms above {:.0}ms",
            m.response_time_ms, config.high_response_time_ms
        ));
    }
    (!reasons.is_empty()).then(|| reasons.join("; "))
}

/// Every gate well under target.
fn idle_reason(config: &ScalingConfig, m: &InstanceMetrics) -> Option<String> {
    let cpu_floor = config.target_cpu_utilization * 0.5;
    let memory_floor = config.target_memory_utilization * 0.5;
    let idle = m.cpu_utilization < cpu_floor
        && m.memory_utilization < memory_floor
        && m.response_time_ms < config.low_response_time_ms;
    idle.then(|| {
        format!(
            "cpu {:.1}% and memory {:.1}% below half of target, response time {:.0}ms",
            m.cpu_utilization, m.memory_utilization, m.response_time_ms
        )
    })
}
