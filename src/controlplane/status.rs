//! Status aggregation
//!
//! Component readiness is folded into the owning object's status from
//! scratch on every pass. The helpers here only mutate a status value; the
//! controllers decide when to write it.

use chrono::{DateTime, Utc};

use crate::crd::{
    set_condition, ClusterState, ComponentState, ComponentStatus, Condition, ConditionStatus, DriverState,
    RBLNClusterPolicyStatus, RBLNDriverStatus, CONDITION_COMPONENTS_READY, CONDITION_ERROR, CONDITION_READY,
    REASON_ALL_COMPONENTS_READY, REASON_RECONCILE_FAILED, REASON_SOME_COMPONENTS_NOT_READY,
};

/// Status of one component from its readiness conditions.
///
/// A component is ready when it reported at least one condition and all of
/// them are true.
pub fn component_status(name: &str, namespace: &str, conditions: Vec<Condition>) -> ComponentStatus {
    let ready = !conditions.is_empty() && conditions.iter().all(Condition::is_true);
    ComponentStatus {
        name: name.to_string(),
        namespace: namespace.to_string(),
        state: if ready {
            ComponentState::Ready
        } else {
            ComponentState::NotReady
        },
        condition: conditions,
    }
}

/// `namespace/name` of every component that is not ready
pub fn not_ready_components(components: &[ComponentStatus]) -> Vec<String> {
    components
        .iter()
        .filter(|c| c.state != ComponentState::Ready)
        .map(|c| format!("{}/{}", c.namespace, c.name))
        .collect()
}

/// Overall state and the Ready condition derived from component statuses
pub fn rollup(components: &[ComponentStatus]) -> (ClusterState, Condition) {
    let not_ready = not_ready_components(components);
    if not_ready.is_empty() {
        let count = components.len();
        (
            ClusterState::Ready,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                REASON_ALL_COMPONENTS_READY,
                format!("All components are Ready ({}/{})", count, count),
            ),
        )
    } else {
        (
            ClusterState::NotReady,
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                REASON_SOME_COMPONENTS_NOT_READY,
                format!("Components not ready: {}", not_ready.join(", ")),
            ),
        )
    }
}

/// Replace components, state and conditions with the rollup of `components`
pub fn apply_policy_rollup(
    status: &mut RBLNClusterPolicyStatus,
    components: Vec<ComponentStatus>,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let (state, ready) = rollup(&components);
    let components_ready = Condition::new(
        CONDITION_COMPONENTS_READY,
        ready.status,
        ready.reason.clone(),
        if state == ClusterState::Ready {
            "All managed components are Ready".to_string()
        } else {
            ready.message.clone()
        },
    );

    status.set_state(state);
    status.components = components;
    set_condition(&mut status.conditions, components_ready.with_observed_generation(generation), now);
    set_condition(&mut status.conditions, ready.with_observed_generation(generation), now);
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_ERROR, ConditionStatus::False, CONDITION_READY, "").with_observed_generation(generation),
        now,
    );
}

fn failure_conditions(message: &str, generation: Option<i64>) -> [Condition; 2] {
    [
        Condition::new(CONDITION_READY, ConditionStatus::False, CONDITION_ERROR, "").with_observed_generation(generation),
        Condition::new(CONDITION_ERROR, ConditionStatus::True, REASON_RECONCILE_FAILED, message)
            .with_observed_generation(generation),
    ]
}

/// Mark a policy NotReady with `Ready=False` and `Error=True`
pub fn apply_policy_failure(
    status: &mut RBLNClusterPolicyStatus,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = status.set_state(ClusterState::NotReady);
    for condition in failure_conditions(message, generation) {
        changed |= set_condition(&mut status.conditions, condition, now);
    }
    changed
}

/// Mark a driver NotReady with `Ready=False` and `Error=True`
pub fn apply_driver_failure(
    status: &mut RBLNDriverStatus,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = status.set_state(DriverState::NotReady);
    for condition in failure_conditions(message, generation) {
        changed |= set_condition(&mut status.conditions, condition, now);
    }
    changed
}

/// Mark a driver NotReady for a reason that is not an error
pub fn apply_driver_not_ready(
    status: &mut RBLNDriverStatus,
    reason: &str,
    message: &str,
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let mut changed = status.set_state(DriverState::NotReady);
    changed |= set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::False, reason, message).with_observed_generation(generation),
        now,
    );
    changed
}

/// Driver state and `Ready` from the driver component's readiness conditions
pub fn apply_driver_readiness(
    status: &mut RBLNDriverStatus,
    readiness: &[Condition],
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let ready = !readiness.is_empty() && readiness.iter().all(Condition::is_true);
    let (state, reason, message) = match readiness.iter().find(|c| !c.is_true()) {
        None if ready => (
            DriverState::Ready,
            REASON_ALL_COMPONENTS_READY.to_string(),
            "Driver DaemonSets are Ready".to_string(),
        ),
        Some(condition) => (DriverState::NotReady, condition.reason.clone(), condition.message.clone()),
        None => (
            DriverState::NotReady,
            REASON_SOME_COMPONENTS_NOT_READY.to_string(),
            "Driver readiness could not be determined".to_string(),
        ),
    };

    let mut changed = status.set_state(state);
    changed |= set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::from(ready), reason, message)
            .with_observed_generation(generation),
        now,
    );
    changed |= set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_ERROR, ConditionStatus::False, CONDITION_READY, "").with_observed_generation(generation),
        now,
    );
    changed
}
