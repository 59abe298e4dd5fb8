//! Control-plane events for monitoring collaborators.
//!
//! Components publish on an [`EventBus`] (a `tokio::sync::broadcast`
//! channel). Publishing with no subscribers is not an error; slow
//! subscribers lag and drop old events rather than blocking publishers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{HealthStatus, InstanceId};

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingKind {
    ScaleUp,
    ScaleDown,
}

/// One recorded scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub kind: ScalingKind,
    pub reason: String,
    pub instances_added: u32,
    pub instances_removed: u32,
    /// Active (starting + running) instances after the action.
    pub total_instances: u32,
    /// Unix timestamp (seconds).
    pub timestamp: u64,
}

/// Everything the control plane announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    InstanceRegistered {
        service_name: String,
        instance_id: InstanceId,
    },
    InstanceHealthChanged {
        service_name: String,
        instance_id: InstanceId,
        from: HealthStatus,
        to: HealthStatus,
    },
    /// Unregistered or evicted; the instance is no longer routable.
    InstanceRemoved {
        service_name: String,
        instance_id: InstanceId,
    },
    Scaling(ScalingEvent),
    InstanceStarted {
        instance_id: InstanceId,
        region: String,
    },
    InstanceTerminated {
        instance_id: InstanceId,
        region: String,
    },
}

/// Cloneable publish handle for [`ControlEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: ControlEvent) {
        // Err only means nobody is listening.
        if self.tx.send(event).is_err() {
            trace!("control event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ControlEvent::InstanceStarted {
            instance_id: "i-1".to_string(),
            region: "us".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ControlEvent::InstanceStarted { ref instance_id, .. } if instance_id == "i-1"));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(ControlEvent::InstanceTerminated {
            instance_id: "i-1".to_string(),
            region: "eu".to_string(),
        });
    }

    #[test]
    fn scaling_event_serializes_tagged() {
        let event = ControlEvent::Scaling(ScalingEvent {
            kind: ScalingKind::ScaleUp,
            reason: "cpu".to_string(),
            instances_added: 2,
            instances_removed: 0,
            total_instances: 6,
            timestamp: 1000,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"scaling\""));
        assert!(json.contains("\"kind\":\"scale_up\""));
    }
}
