//! Outbound notifications
//!
//! Delivery (email, chat, push) is out of scope; the engine only reports
//! that a step opened or an instance finished.

use approval_types::{ApprovalEvent, InstanceId, InstanceStatus, UserId};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Receives events after the corresponding transition has committed
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn step_opened(&self, instance_id: &InstanceId, step_order: u32, eligible: &[UserId]);

    async fn completed(&self, instance_id: &InstanceId, status: InstanceStatus);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl ApprovalNotifier for NoopNotifier {
    async fn step_opened(&self, _instance_id: &InstanceId, _step_order: u32, _eligible: &[UserId]) {}

    async fn completed(&self, _instance_id: &InstanceId, _status: InstanceStatus) {}
}

/// Publishes events on a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ApprovalEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: ApprovalEvent) {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!("Approval event dropped, no subscribers");
        }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ApprovalNotifier for BroadcastNotifier {
    async fn step_opened(&self, instance_id: &InstanceId, step_order: u32, eligible: &[UserId]) {
        self.publish(ApprovalEvent::StepOpened {
            instance_id: instance_id.clone(),
            step_order,
            eligible: eligible.to_vec(),
        });
    }

    async fn completed(&self, instance_id: &InstanceId, status: InstanceStatus) {
        self.publish(ApprovalEvent::Completed {
            instance_id: instance_id.clone(),
            status,
        });
    }
}
