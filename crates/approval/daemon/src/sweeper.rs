//! Escalation sweeper
//!
//! Periodically escalates open steps that outlived their escalation
//! timeout. Each candidate is escalated through the engine, so a step
//! decided between listing and escalating is simply skipped.

use approval_engine::ApprovalEngine;
use approval_types::ApprovalResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

const SWEEP_REASON: &str = "open longer than escalation timeout";

/// Background escalation loop
pub struct EscalationSweeper {
    engine: Arc<ApprovalEngine>,
    interval: Duration,
}

impl EscalationSweeper {
    pub fn new(engine: Arc<ApprovalEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Escalate everything due now; returns how many steps were escalated
    pub async fn sweep_once(&self) -> ApprovalResult<usize> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> ApprovalResult<usize> {
        let due = self.engine.due_for_escalation(now).await?;
        let mut escalated = 0;
        for candidate in due {
            match self
                .engine
                .escalate(
                    &candidate.instance_id,
                    candidate.step_order,
                    Some(SWEEP_REASON.to_string()),
                )
                .await
            {
                Ok(_) => escalated += 1,
                Err(e) if e.is_invalid_state() => {
                    tracing::debug!(
                        instance_id = %candidate.instance_id,
                        step = candidate.step_order,
                        error = %e,
                        "Escalation skipped, instance moved on"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        instance_id = %candidate.instance_id,
                        step = candidate.step_order,
                        error = %e,
                        "Escalation failed"
                    );
                }
            }
        }
        if escalated > 0 {
            tracing::info!(escalated, "Escalation sweep finished");
        }
        Ok(escalated)
    }

    /// Run until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "Escalation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Escalation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Escalation sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approval_engine::{EngineConfig, NoopNotifier};
    use approval_storage::InMemoryApprovalStorage;
    use approval_types::{
        Decision, InstanceStatus, RecordRef, UserId, WorkflowDraft, WorkflowStep,
    };
    use rbac_identity::InMemoryIdentityStore;
    use rbac_types::User;

    async fn engine_with_open_step() -> (Arc<ApprovalEngine>, approval_types::InstanceId) {
        let identity = Arc::new(InMemoryIdentityStore::new());
        identity.create_user(User::new("u1", "Alice")).unwrap();
        identity.create_user(User::new("requester", "Rita")).unwrap();
        let engine = Arc::new(ApprovalEngine::new(
            Arc::new(InMemoryApprovalStorage::new()),
            identity,
            Arc::new(NoopNotifier),
            EngineConfig::default(),
        ));
        let workflow = engine
            .create_workflow(
                WorkflowDraft::new("Expense").with_step(
                    WorkflowStep::new(1, "Finance")
                        .with_user("u1")
                        .with_escalation_timeout(60),
                ),
                &UserId::new("u1"),
            )
            .await
            .unwrap();
        let started = engine
            .start_approval(
                &workflow.id,
                RecordRef::new("expenses", "EX-1"),
                &UserId::new("requester"),
            )
            .await
            .unwrap();
        (engine, started.instance_id)
    }

    #[tokio::test]
    async fn test_sweep_escalates_due_steps_once() {
        let (engine, instance_id) = engine_with_open_step().await;
        let sweeper = EscalationSweeper::new(engine.clone(), Duration::from_secs(1));

        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(sweeper.sweep_at(later).await.unwrap(), 1);
        assert_eq!(sweeper.sweep_at(later).await.unwrap(), 0);

        let view = engine.get_instance(&instance_id).await.unwrap();
        assert_eq!(view.status(), InstanceStatus::Escalated);
        assert_eq!(view.instance.escalation_count, 1);
    }

    #[tokio::test]
    async fn test_decided_steps_are_not_swept() {
        let (engine, instance_id) = engine_with_open_step().await;
        engine
            .act(&instance_id, 1, &UserId::new("u1"), Decision::Approve, None)
            .await
            .unwrap();

        let sweeper = EscalationSweeper::new(engine, Duration::from_secs(1));
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(sweeper.sweep_at(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, _) = engine_with_open_step().await;
        let sweeper = EscalationSweeper::new(engine, Duration::from_millis(10));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sweeper.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
