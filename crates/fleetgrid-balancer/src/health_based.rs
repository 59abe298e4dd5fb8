//! Health-filtering decorator.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use fleetgrid_state::InstanceRecord;

use crate::strategy::LoadBalancingStrategy;

/// Filters candidates to healthy ones before delegating to `inner`.
///
/// With zero healthy candidates it delegates over the unfiltered list
/// instead of returning `None`: a possibly-bad instance beats no answer.
pub struct HealthBased {
    inner: Arc<dyn LoadBalancingStrategy>,
}

impl HealthBased {
    pub fn new(inner: Arc<dyn LoadBalancingStrategy>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn LoadBalancingStrategy> {
        &self.inner
    }
}

impl LoadBalancingStrategy for HealthBased {
    fn name(&self) -> &'static str {
        "health-based"
    }

    fn release(&self, instance_id: &str) {
        self.inner.release(instance_id);
    }

    fn forget(&self, instance_id: &str) {
        self.inner.forget(instance_id);
    }

    fn connection_counts(&self) -> HashMap<String, u64> {
        self.inner.connection_counts()
    }

    fn select_instance(
        &self,
        service_name: &str,
        candidates: &[InstanceRecord],
    ) -> Option<InstanceRecord> {
        let healthy: Vec<InstanceRecord> =
            candidates.iter().filter(|c| c.is_healthy()).cloned().collect();

        if healthy.is_empty() {
            if !candidates.is_empty() {
                warn!(
                    service = %service_name,
                    candidates = candidates.len(),
                    inner = self.inner.name(),
                    "no healthy instances, falling back to unfiltered candidates"
                );
            }
            return self.inner.select_instance(service_name, candidates);
        }

        self.inner.select_instance(service_name, &healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::RoundRobin;
    use crate::strategy::tests::candidate;
    use fleetgrid_state::HealthStatus;

    #[test]
    fn skips_unhealthy_candidates() {
        let hb = HealthBased::new(Arc::new(RoundRobin::new()));
        let list = vec![
            candidate("a", HealthStatus::Unhealthy),
            candidate("b", HealthStatus::Healthy),
            candidate("c", HealthStatus::Unknown),
            candidate("d", HealthStatus::Healthy),
        ];

        let picks: Vec<String> = (0..4)
            .map(|_| hb.select_instance("orders", &list).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["b", "d", "b", "d"]);
    }

    #[test]
    fn falls_back_to_inner_over_unfiltered_list() {
        let hb = HealthBased::new(Arc::new(RoundRobin::new()));
        let plain = RoundRobin::new();
        let list = vec![
            candidate("a", HealthStatus::Unhealthy),
            candidate("b", HealthStatus::Unknown),
            candidate("c", HealthStatus::Unhealthy),
        ];

        for _ in 0..5 {
            let decorated = hb.select_instance("orders", &list).map(|r| r.id);
            let direct = plain.select_instance("orders", &list).map(|r| r.id);
            assert!(decorated.is_some());
            assert_eq!(decorated, direct);
        }
    }

    #[test]
    fn empty_candidates_yield_none() {
        let hb = HealthBased::new(Arc::new(RoundRobin::new()));
        assert!(hb.select_instance("orders", &[]).is_none());
        assert_eq!(hb.inner().name(), "round-robin");
    }
}
