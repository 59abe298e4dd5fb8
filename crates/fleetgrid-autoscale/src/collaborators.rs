//! External collaborators: telemetry in, provisioning out.
//!
//! The autoscaler only decides. Reading utilization and creating or
//! destroying machines are delegated through these traits.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use fleetgrid_state::{InstanceMetrics, PoolInstance};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-instance utilization readings.
pub trait MetricsSource: Send + Sync + 'static {
    /// Latest reading for `instance`, or `None` if it has not reported yet.
    fn sample<'a>(
        &'a self,
        instance: &'a PoolInstance,
    ) -> BoxFuture<'a, anyhow::Result<Option<InstanceMetrics>>>;
}

/// Creates and destroys the machines behind pool instances.
pub trait Provisioner: Send + Sync + 'static {
    fn provision<'a>(&'a self, instance: &'a PoolInstance) -> BoxFuture<'a, anyhow::Result<()>>;

    fn teardown<'a>(&'a self, instance: &'a PoolInstance) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Provisioner that only models the lifecycle delays.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProvisioner;

impl Provisioner for NoopProvisioner {
    fn provision<'a>(&'a self, _instance: &'a PoolInstance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn teardown<'a>(&'a self, _instance: &'a PoolInstance) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Reports nothing. The window never fills, so the loop never acts.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSource for NullMetrics {
    fn sample<'a>(
        &'a self,
        _instance: &'a PoolInstance,
    ) -> BoxFuture<'a, anyhow::Result<Option<InstanceMetrics>>> {
        Box::pin(async { Ok(None) })
    }
}

/// Reports the same settable reading for every instance.
#[derive(Debug, Default)]
pub struct StaticMetrics {
    reading: Mutex<InstanceMetrics>,
}

impl StaticMetrics {
    pub fn new(reading: InstanceMetrics) -> Self {
        Self {
            reading: Mutex::new(reading),
        }
    }

    pub fn set(&self, reading: InstanceMetrics) {
        *self.reading.lock().unwrap_or_else(PoisonError::into_inner) = reading;
    }
}

impl MetricsSource for StaticMetrics {
    fn sample<'a>(
        &'a self,
        _instance: &'a PoolInstance,
    ) -> BoxFuture<'a, anyhow::Result<Option<InstanceMetrics>>> {
        let reading = *self.reading.lock().unwrap_or_else(PoisonError::into_inner);
        Box::pin(async move { Ok(Some(reading)) })
    }
}
