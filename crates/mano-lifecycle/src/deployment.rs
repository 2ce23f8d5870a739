//! Deployment lifecycle graph.
//!
//! The standard machine every deployment-shaped workflow instantiates:
//! validate, plan, deploy, activate, with failure states that accept bounded
//! retries, rollback and recovery.

use crate::machine::{Action, Listener, StateMachine, StateMachineBuilder};

pub mod state {
    pub const INITIALIZING: &str = "Initializing";
    pub const PENDING: &str = "Pending";
    pub const VALIDATING: &str = "Validating";
    pub const PLANNING: &str = "Planning";
    pub const PLANNED: &str = "Planned";
    pub const DEPLOYING: &str = "Deploying";
    pub const PARTIALLY_DEPLOYED: &str = "PartiallyDeployed";
    pub const DEPLOYED: &str = "Deployed";
    pub const ACTIVE: &str = "Active";
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    pub const PLANNING_FAILED: &str = "PlanningFailed";
    pub const DEPLOYMENT_FAILED: &str = "DeploymentFailed";
    pub const ROLLING_BACK: &str = "RollingBack";
    pub const ROLLED_BACK: &str = "RolledBack";
    pub const RECOVERING: &str = "Recovering";
    pub const TERMINATING: &str = "Terminating";
    pub const TERMINATED: &str = "Terminated";
    pub const FAILED: &str = "Failed";
    pub const ERROR: &str = "Error";
}

pub mod event {
    pub const VALIDATE: &str = "Validate";
    pub const VALIDATION_SUCCESS: &str = "ValidationSuccess";
    pub const VALIDATION_FAILURE: &str = "ValidationFailure";
    pub const PLAN: &str = "Plan";
    pub const PLANNING_SUCCESS: &str = "PlanningSuccess";
    pub const PLANNING_FAILURE: &str = "PlanningFailure";
    pub const DEPLOY: &str = "Deploy";
    pub const DEPLOYMENT_SUCCESS: &str = "DeploymentSuccess";
    pub const DEPLOYMENT_FAILURE: &str = "DeploymentFailure";
    pub const ACTIVATE: &str = "Activate";
    pub const ACTIVATION_SUCCESS: &str = "ActivationSuccess";
    pub const TERMINATE: &str = "Terminate";
    pub const ROLLBACK: &str = "Rollback";
    pub const ROLLBACK_SUCCESS: &str = "RollbackSuccess";
    pub const ROLLBACK_FAILURE: &str = "RollbackFailure";
    pub const RECOVER: &str = "Recover";
    pub const RECOVERY_SUCCESS: &str = "RecoverySuccess";
    pub const RECOVERY_FAILURE: &str = "RecoveryFailure";
    pub const RETRY: &str = "Retry";
    pub const SYSTEM_FAILURE: &str = "SystemFailure";
}

/// Builder for a deployment machine. Actions attach to transitions already in
/// the graph; the table itself is fixed at build time.
pub struct DeploymentMachineBuilder {
    inner: StateMachineBuilder,
}

impl DeploymentMachineBuilder {
    pub fn new(id: impl Into<String>, max_retries: u32) -> Self {
        use event::*;
        use state::*;

        let inner = StateMachine::builder(id, INITIALIZING)
            .max_retries(max_retries)
            // happy path
            .transition(INITIALIZING, VALIDATE, VALIDATING)
            .transition(VALIDATING, VALIDATION_SUCCESS, PENDING)
            .transition(PENDING, PLAN, PLANNING)
            .transition(PLANNING, PLANNING_SUCCESS, PLANNED)
            .transition(PLANNED, DEPLOY, DEPLOYING)
            .transition(DEPLOYING, DEPLOYMENT_SUCCESS, DEPLOYED)
            .transition(DEPLOYED, ACTIVATE, ACTIVE)
            .transition(ACTIVE, TERMINATE, TERMINATING)
            .transition(TERMINATING, ACTIVATION_SUCCESS, TERMINATED)
            // failure edges out of the in-progress states
            .transition(VALIDATING, VALIDATION_FAILURE, VALIDATION_FAILED)
            .transition(PLANNING, PLANNING_FAILURE, PLANNING_FAILED)
            .transition(DEPLOYING, DEPLOYMENT_FAILURE, DEPLOYMENT_FAILED)
            .transition(VALIDATING, SYSTEM_FAILURE, ERROR)
            .transition(PLANNING, SYSTEM_FAILURE, ERROR)
            .transition(DEPLOYING, SYSTEM_FAILURE, ERROR)
            .transition(DEPLOYED, SYSTEM_FAILURE, ERROR)
            .transition(ACTIVE, SYSTEM_FAILURE, ERROR)
            // retries, bounded by the machine budget
            .retry_edge(VALIDATION_FAILED, RETRY, VALIDATING)
            .retry_edge(PLANNING_FAILED, RETRY, PLANNING)
            .retry_edge(DEPLOYMENT_FAILED, RETRY, DEPLOYING)
            // rollback / recovery from the failed states
            .transition(VALIDATION_FAILED, ROLLBACK, ROLLING_BACK)
            .transition(PLANNING_FAILED, ROLLBACK, ROLLING_BACK)
            .transition(DEPLOYMENT_FAILED, ROLLBACK, ROLLING_BACK)
            .transition(VALIDATION_FAILED, RECOVER, RECOVERING)
            .transition(PLANNING_FAILED, RECOVER, RECOVERING)
            .transition(DEPLOYMENT_FAILED, RECOVER, RECOVERING)
            .transition(ROLLING_BACK, ROLLBACK_SUCCESS, ROLLED_BACK)
            // a rollback that dies partway leaves the slice partially deployed
            .transition(ROLLING_BACK, ROLLBACK_FAILURE, PARTIALLY_DEPLOYED)
            .transition(PARTIALLY_DEPLOYED, DEPLOY, DEPLOYING)
            .transition(PARTIALLY_DEPLOYED, ROLLBACK, ROLLING_BACK)
            .transition(PARTIALLY_DEPLOYED, TERMINATE, TERMINATING)
            .transition(ROLLED_BACK, PLAN, PLANNING)
            .transition(RECOVERING, RECOVERY_SUCCESS, PENDING)
            .transition(RECOVERING, RECOVERY_FAILURE, FAILED)
            .transition(FAILED, RECOVER, RECOVERING)
            .transition(ERROR, RECOVER, RECOVERING);

        Self { inner }
    }

    pub fn action(mut self, from: &str, event: &str, action: Action) -> Self {
        self.inner = self.inner.action(from, event, action);
        self
    }

    pub fn listener(mut self, listener: Listener) -> Self {
        self.inner = self.inner.listener(listener);
        self
    }

    pub fn build(self) -> StateMachine {
        self.inner.build()
    }
}

/// The standard deployment machine with no actions attached.
pub fn deployment_machine(id: impl Into<String>, max_retries: u32) -> StateMachine {
    DeploymentMachineBuilder::new(id, max_retries).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::LifecycleError;
    use serde_json::Value;

    async fn drive(machine: &StateMachine, events: &[&str]) {
        for ev in events {
            machine.send(ev, Value::Null).await.unwrap();
        }
    }

    #[tokio::test]
    async fn happy_path_reaches_active_then_terminated() {
        let machine = deployment_machine("intent-1", 3);
        drive(
            &machine,
            &[
                event::VALIDATE,
                event::VALIDATION_SUCCESS,
                event::PLAN,
                event::PLANNING_SUCCESS,
                event::DEPLOY,
                event::DEPLOYMENT_SUCCESS,
                event::ACTIVATE,
            ],
        )
        .await;
        assert_eq!(machine.current_state().await, state::ACTIVE);

        drive(&machine, &[event::TERMINATE, event::ACTIVATION_SUCCESS]).await;
        assert_eq!(machine.current_state().await, state::TERMINATED);
    }

    #[tokio::test]
    async fn deployment_failure_supports_bounded_retry() {
        let machine = deployment_machine("intent-2", 2);
        drive(
            &machine,
            &[
                event::VALIDATE,
                event::VALIDATION_SUCCESS,
                event::PLAN,
                event::PLANNING_SUCCESS,
                event::DEPLOY,
                event::DEPLOYMENT_FAILURE,
            ],
        )
        .await;
        assert_eq!(machine.current_state().await, state::DEPLOYMENT_FAILED);

        drive(&machine, &[event::RETRY, event::DEPLOYMENT_FAILURE]).await;
        drive(&machine, &[event::RETRY, event::DEPLOYMENT_FAILURE]).await;

        let err = machine.send(event::RETRY, Value::Null).await.unwrap_err();
        assert!(matches!(err, LifecycleError::GuardRejected { .. }));
        assert_eq!(machine.current_state().await, state::DEPLOYMENT_FAILED);
    }

    #[tokio::test]
    async fn rollback_failure_lands_in_partially_deployed() {
        let machine = deployment_machine("intent-3", 3);
        drive(
            &machine,
            &[
                event::VALIDATE,
                event::VALIDATION_SUCCESS,
                event::PLAN,
                event::PLANNING_SUCCESS,
                event::DEPLOY,
                event::DEPLOYMENT_FAILURE,
                event::ROLLBACK,
                event::ROLLBACK_FAILURE,
            ],
        )
        .await;
        assert_eq!(machine.current_state().await, state::PARTIALLY_DEPLOYED);

        // from here the operator can resume the deployment
        drive(&machine, &[event::DEPLOY, event::DEPLOYMENT_SUCCESS]).await;
        assert_eq!(machine.current_state().await, state::DEPLOYED);
    }

    #[tokio::test]
    async fn recovery_returns_to_pending() {
        let machine = deployment_machine("intent-4", 3);
        drive(
            &machine,
            &[
                event::VALIDATE,
                event::VALIDATION_FAILURE,
                event::RECOVER,
                event::RECOVERY_SUCCESS,
            ],
        )
        .await;
        assert_eq!(machine.current_state().await, state::PENDING);
    }
}
