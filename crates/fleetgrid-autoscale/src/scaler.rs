//! AutoScaler — owns the instance pool and runs the control loop.
//!
//! Each tick samples utilization across running instances, pushes the
//! fleet-wide mean into a bounded window, and hands the newest samples to
//! [`decision::evaluate`]. Instance creation and termination return
//! immediately; the lifecycle transitions happen later on timer tasks
//! held in a `JoinSet`, aborted on shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fleet_core::ScalingConfig;
use fleetgrid_state::*;

use crate::collaborators::{MetricsSource, NoopProvisioner, Provisioner};
use crate::decision::{self, Cooldowns, FleetCounts, ScaleDecision};
use crate::error::ScaleResult;
use crate::policy::{RoundRobinOldestFirst, ScalePolicy};

/// Scaling events kept for `scaling_history`.
const HISTORY_LIMIT: usize = 100;

/// Result of one control-loop tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Another tick (or a forced scale) was still running.
    Skipped,
    /// Fewer samples than an evaluation needs.
    Warming { samples: usize },
    /// Evaluated; nothing to do.
    Steady,
    Scaled(ScalingEvent),
}

/// Pool size by lifecycle status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatus {
    pub starting: u32,
    pub running: u32,
    pub stopping: u32,
    /// Sum of `cost_per_hour` over every instance still in the pool.
    pub hourly_cost: f64,
}

struct ControlState {
    config: ScalingConfig,
    window: VecDeque<InstanceMetrics>,
    cooldowns: Cooldowns,
    history: VecDeque<ScalingEvent>,
    policy: Box<dyn ScalePolicy>,
}

pub struct AutoScaler {
    pool: Arc<RwLock<Vec<PoolInstance>>>,
    control: Mutex<ControlState>,
    /// Held for the duration of a tick; ticks never overlap.
    tick_guard: Mutex<()>,
    timers: std::sync::Mutex<JoinSet<()>>,
    metrics: Arc<dyn MetricsSource>,
    provisioner: Arc<dyn Provisioner>,
    events: EventBus,
}

impl AutoScaler {
    /// Create an autoscaler with an empty pool. Call `initialize` to
    /// bring it up to `min_instances`.
    pub fn new(
        config: ScalingConfig,
        metrics: Arc<dyn MetricsSource>,
        events: EventBus,
    ) -> ScaleResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: Arc::new(RwLock::new(Vec::new())),
            control: Mutex::new(ControlState {
                window: VecDeque::with_capacity(config.metrics_window),
                config,
                cooldowns: Cooldowns::default(),
                history: VecDeque::new(),
                policy: Box::new(RoundRobinOldestFirst::new()),
            }),
            tick_guard: Mutex::new(()),
            timers: std::sync::Mutex::new(JoinSet::new()),
            metrics,
            provisioner: Arc::new(NoopProvisioner),
            events,
        })
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn ScalePolicy>) -> Self {
        self.control.get_mut().policy = policy;
        self
    }

    pub async fn config(&self) -> ScalingConfig {
        self.control.lock().await.config.clone()
    }

    /// Create instances until the pool holds `min_instances` active ones.
    /// Returns how many were created.
    pub async fn initialize(&self) -> u32 {
        let _tick = self.tick_guard.lock().await;
        let mut control = self.control.lock().await;
        let control = &mut *control;

        let counts = self.counts().await;
        let needed = control.config.min_instances.saturating_sub(counts.active);
        let created = self.create_instances(control, needed).await;
        info!(
            created,
            min = control.config.min_instances,
            "autoscaler pool initialized"
        );
        created
    }

    /// One sample-and-decide cycle at the current wall clock.
    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(epoch_secs()).await
    }

    /// One sample-and-decide cycle with cooldowns measured against `now`.
    pub async fn tick_at(&self, now: u64) -> TickOutcome {
        let Ok(_tick) = self.tick_guard.try_lock() else {
            debug!("previous tick still running, skipping");
            return TickOutcome::Skipped;
        };
        self.reap_timers();

        let sample = self.sample().await;
        let mut control = self.control.lock().await;
        let control = &mut *control;
        self.replenish(control).await;

        if let Some(sample) = sample {
            control.window.push_back(sample);
            while control.window.len() > control.config.metrics_window {
                control.window.pop_front();
            }
        }

        let Some(mean) = decision::recent_mean(&control.window) else {
            return TickOutcome::Warming {
                samples: control.window.len(),
            };
        };

        let counts = self.counts().await;
        let decision = decision::evaluate(&control.config, &mean, counts, control.cooldowns, now);
        debug!(
            running = counts.running,
            active = counts.active,
            cpu = mean.cpu_utilization,
            memory = mean.memory_utilization,
            response_ms = mean.response_time_ms,
            ?decision,
            "autoscaler evaluated"
        );

        match decision {
            ScaleDecision::NoChange => TickOutcome::Steady,
            ScaleDecision::ScaleUp { add, reason } => {
                let added = self.create_instances(control, add).await;
                if added == 0 {
                    return TickOutcome::Steady;
                }
                control.cooldowns.last_scale_up = Some(now);
                let event = self
                    .record(control, ScalingKind::ScaleUp, reason, added, 0, now)
                    .await;
                TickOutcome::Scaled(event)
            }
            ScaleDecision::ScaleDown { remove, reason } => {
                let removed = self.terminate_oldest(control, remove).await;
                if removed == 0 {
                    return TickOutcome::Steady;
                }
                control.cooldowns.last_scale_down = Some(now);
                let event = self
                    .record(control, ScalingKind::ScaleDown, reason, 0, removed, now)
                    .await;
                TickOutcome::Scaled(event)
            }
        }
    }

    /// Move the active count toward `target`, clamped to
    /// `[min_instances, max_instances]`.
    ///
    /// Skips threshold evaluation and leaves the cooldown timers alone.
    /// Only running instances can be terminated, and never below
    /// `min_instances` of them, so a pool that is still starting may end
    /// above the target.
    pub async fn force_scale(&self, target: u32) -> Option<ScalingEvent> {
        let _tick = self.tick_guard.lock().await;
        let mut control = self.control.lock().await;
        let control = &mut *control;

        let clamped = control.config.clamp(target);
        if clamped != target {
            debug!(requested = target, clamped, "forced scale target clamped");
        }

        let counts = self.counts().await;
        let now = epoch_secs();
        let reason = format!("forced scale to {clamped}");

        if clamped > counts.active {
            let added = self.create_instances(control, clamped - counts.active).await;
            if added == 0 {
                return None;
            }
            Some(self.record(control, ScalingKind::ScaleUp, reason, added, 0, now).await)
        } else if clamped < counts.active {
            let remove = (counts.active - clamped)
                .min(counts.running.saturating_sub(control.config.min_instances));
            let removed = self.terminate_oldest(control, remove).await;
            if removed == 0 {
                return None;
            }
            Some(self.record(control, ScalingKind::ScaleDown, reason, 0, removed, now).await)
        } else {
            debug!(target = clamped, "forced scale already satisfied");
            None
        }
    }

    /// Swap the scaling config at runtime.
    ///
    /// The tick period of an already running loop does not change.
    pub async fn update_config(&self, config: ScalingConfig) -> ScaleResult<()> {
        config.validate()?;
        let mut control = self.control.lock().await;
        while control.window.len() > config.metrics_window {
            control.window.pop_front();
        }
        info!(
            min = config.min_instances,
            max = config.max_instances,
            regions = config.regions.len(),
            "scaling config updated"
        );
        control.config = config;
        Ok(())
    }

    /// Recorded scaling events, oldest first.
    pub async fn scaling_history(&self) -> Vec<ScalingEvent> {
        self.control.lock().await.history.iter().cloned().collect()
    }

    pub async fn instances(&self) -> Vec<PoolInstance> {
        self.pool.read().await.clone()
    }

    pub async fn status(&self) -> PoolStatus {
        let pool = self.pool.read().await;
        let mut status = PoolStatus::default();
        for instance in pool.iter() {
            match instance.status {
                LifecycleStatus::Starting => status.starting += 1,
                LifecycleStatus::Running => status.running += 1,
                LifecycleStatus::Stopping => status.stopping += 1,
                LifecycleStatus::Stopped => continue,
            }
            status.hourly_cost += instance.instance_type.cost_per_hour;
        }
        status
    }

    /// Run the control loop until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.control.lock().await.config.tick_interval();
        info!(interval_secs = period.as_secs(), "autoscaler started");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        TickOutcome::Scaled(event) => debug!(kind = ?event.kind, "autoscaler tick scaled"),
                        outcome => debug!(?outcome, "autoscaler tick"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Abort every in-flight provisioning and teardown timer.
    pub fn shutdown(&self) {
        let mut timers = self.timers();
        if !timers.is_empty() {
            info!(pending = timers.len(), "aborting lifecycle timers");
        }
        timers.abort_all();
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn timers(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap_timers(&self) {
        let mut timers = self.timers();
        while let Some(result) = timers.try_join_next() {
            if let Err(e) = result
                && e.is_panic()
            {
                error!(error = %e, "lifecycle timer panicked");
            }
        }
    }

    async fn counts(&self) -> FleetCounts {
        let pool = self.pool.read().await;
        FleetCounts {
            running: pool
                .iter()
                .filter(|i| i.status == LifecycleStatus::Running)
                .count() as u32,
            active: pool.iter().filter(|i| i.status.is_active()).count() as u32,
        }
    }

    /// Replace instances lost to failed provisioning so the active count
    /// never stays below `min_instances`. Not a scaling action.
    async fn replenish(&self, control: &mut ControlState) {
        let active = self.counts().await.active;
        let missing = control.config.min_instances.saturating_sub(active);
        if missing == 0 {
            return;
        }
        let created = self.create_instances(control, missing).await;
        warn!(
            active,
            created,
            min = control.config.min_instances,
            "pool below minimum, replenished"
        );
    }

    fn running(pool: &[PoolInstance]) -> Vec<PoolInstance> {
        pool.iter()
            .filter(|i| i.status == LifecycleStatus::Running)
            .cloned()
            .collect()
    }

    /// Fleet-wide mean over running instances that reported.
    async fn sample(&self) -> Option<InstanceMetrics> {
        let running = Self::running(&self.pool.read().await);
        if running.is_empty() {
            return None;
        }

        let mut readings = Vec::with_capacity(running.len());
        for instance in &running {
            match self.metrics.sample(instance).await {
                Ok(Some(metrics)) => readings.push((instance.id.clone(), metrics)),
                Ok(None) => {}
                Err(e) => warn!(instance_id = %instance.id, error = %e, "metrics sample failed"),
            }
        }

        {
            let mut pool = self.pool.write().await;
            for (id, metrics) in &readings {
                if let Some(instance) = pool.iter_mut().find(|i| &i.id == id) {
                    instance.metrics = Some(*metrics);
                }
            }
        }

        decision::mean(readings.iter().map(|(_, m)| m))
    }

    async fn create_instances(&self, control: &mut ControlState, count: u32) -> u32 {
        if count == 0 {
            return 0;
        }
        let regions = control.policy.place(&control.config.regions, count as usize);
        if regions.is_empty() {
            warn!(requested = count, "no regions to place instances in, scale-up skipped");
            return 0;
        }
        let Some(instance_type) = control.config.instance_types.first().cloned() else {
            warn!(requested = count, "no instance types configured, scale-up skipped");
            return 0;
        };

        let now = epoch_secs();
        let created: Vec<PoolInstance> = regions
            .into_iter()
            .map(|region| {
                PoolInstance::new(Uuid::new_v4().to_string(), region, instance_type.clone(), now)
            })
            .collect();

        self.pool.write().await.extend(created.iter().cloned());

        let delay = control.config.provisioning_delay();
        let n = created.len() as u32;
        for instance in created {
            info!(
                instance_id = %instance.id,
                region = %instance.region,
                instance_type = %instance.instance_type.name,
                "instance starting"
            );
            self.spawn_provisioning(instance, delay);
        }
        n
    }

    async fn terminate_oldest(&self, control: &mut ControlState, count: u32) -> u32 {
        let running = Self::running(&self.pool.read().await);
        let victims = control.policy.victims(&running, count as usize);

        let mut stopping = Vec::with_capacity(victims.len());
        {
            let mut pool = self.pool.write().await;
            let now = epoch_secs();
            for id in &victims {
                let Some(instance) = pool.iter_mut().find(|i| &i.id == id) else {
                    continue;
                };
                if !instance.transition(LifecycleStatus::Stopping, now) {
                    warn!(instance_id = %id, status = ?instance.status, "cannot stop instance");
                    continue;
                }
                stopping.push(instance.clone());
            }
        }

        let delay = control.config.teardown_delay();
        let n = stopping.len() as u32;
        for instance in stopping {
            info!(instance_id = %instance.id, region = %instance.region, "instance stopping");
            self.spawn_teardown(instance, delay);
        }
        n
    }

    async fn record(
        &self,
        control: &mut ControlState,
        kind: ScalingKind,
        reason: String,
        added: u32,
        removed: u32,
        now: u64,
    ) -> ScalingEvent {
        let event = ScalingEvent {
            kind,
            reason,
            instances_added: added,
            instances_removed: removed,
            total_instances: self.counts().await.active,
            timestamp: now,
        };
        info!(
            kind = ?event.kind,
            added,
            removed,
            total = event.total_instances,
            reason = %event.reason,
            "scaling action"
        );

        control.history.push_back(event.clone());
        while control.history.len() > HISTORY_LIMIT {
            control.history.pop_front();
        }
        self.events.publish(ControlEvent::Scaling(event.clone()));
        event
    }

    fn spawn_provisioning(&self, instance: PoolInstance, delay: Duration) {
        let pool = Arc::clone(&self.pool);
        let provisioner = Arc::clone(&self.provisioner);
        let events = self.events.clone();

        self.timers().spawn(async move {
            if let Err(e) = provisioner.provision(&instance).await {
                error!(
                    instance_id = %instance.id,
                    region = %instance.region,
                    error = %e,
                    "provisioning failed, dropping instance"
                );
                pool.write().await.retain(|i| i.id != instance.id);
                return;
            }
            tokio::time::sleep(delay).await;

            let mut pool = pool.write().await;
            let Some(entry) = pool.iter_mut().find(|i| i.id == instance.id) else {
                return;
            };
            if entry.transition(LifecycleStatus::Running, epoch_secs()) {
                info!(instance_id = %entry.id, region = %entry.region, "instance running");
                events.publish(ControlEvent::InstanceStarted {
                    instance_id: entry.id.clone(),
                    region: entry.region.clone(),
                });
            } else {
                warn!(instance_id = %entry.id, status = ?entry.status, "instance left starting early");
            }
        });
    }

    fn spawn_teardown(&self, instance: PoolInstance, delay: Duration) {
        let pool = Arc::clone(&self.pool);
        let provisioner = Arc::clone(&self.provisioner);
        let events = self.events.clone();

        self.timers().spawn(async move {
            if let Err(e) = provisioner.teardown(&instance).await {
                error!(instance_id = %instance.id, error = %e, "teardown failed");
            }
            tokio::time::sleep(delay).await;

            let mut pool = pool.write().await;
            let Some(entry) = pool.iter_mut().find(|i| i.id == instance.id) else {
                return;
            };
            if !entry.transition(LifecycleStatus::Stopped, epoch_secs()) {
                warn!(instance_id = %entry.id, status = ?entry.status, "instance not stopping");
                return;
            }
            pool.retain(|i| i.id != instance.id);
            info!(instance_id = %instance.id, region = %instance.region, "instance terminated");
            events.publish(ControlEvent::InstanceTerminated {
                instance_id: instance.id.clone(),
                region: instance.region.clone(),
            });
        });
    }
}

impl Drop for AutoScaler {
    fn drop(&mut self) {
        self.timers().abort_all();
    }
}
