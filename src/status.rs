//! Pure status derivation (spec.md §4.3): `(LoadTest, []Pod) -> (LoadTestStatus, MissingPods)`.
//! No I/O, no clock access beyond a caller-supplied `now`.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::{Component, LoadTest, LoadTestState, LoadTestStatus, Reason, Role, LABEL_COMPONENT, LABEL_ROLE};

/// A component the reconciler still needs to create a pod for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingComponent {
    pub role: Role,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PodClassification {
    InitContainerError,
    ContainerError,
    Succeeded,
    Running,
    Pending,
}

/// Classifies a single pod by walking its init container statuses, then its
/// main container statuses, stopping at the first non-success condition.
fn classify_pod(pod: &Pod) -> PodClassification {
    let status = match &pod.status {
        Some(s) => s,
        None => return PodClassification::Pending,
    };

    if let Some(inits) = &status.init_container_statuses {
        for c in inits {
            match classify_state(c) {
                ContainerVerdict::TerminatedNonZero => return PodClassification::InitContainerError,
                ContainerVerdict::TerminatedZero => continue,
                ContainerVerdict::Running | ContainerVerdict::WaitingOrUnknown => {
                    return PodClassification::Pending;
                }
            }
        }
    }

    let mains = match &status.container_statuses {
        Some(c) if !c.is_empty() => c,
        _ => return PodClassification::Pending,
    };

    // Element 0 of `component.run` is the primary process; its exit code
    // governs the pod's classification per §4.2/§4.3.
    match classify_state(&mains[0]) {
        ContainerVerdict::TerminatedNonZero => PodClassification::ContainerError,
        ContainerVerdict::TerminatedZero => PodClassification::Succeeded,
        ContainerVerdict::Running => PodClassification::Running,
        ContainerVerdict::WaitingOrUnknown => PodClassification::Pending,
    }
}

enum ContainerVerdict {
    TerminatedNonZero,
    TerminatedZero,
    Running,
    WaitingOrUnknown,
}

fn classify_state(status: &ContainerStatus) -> ContainerVerdict {
    match &status.state {
        Some(ContainerState {
            terminated: Some(t), ..
        }) => {
            if t.exit_code == 0 {
                ContainerVerdict::TerminatedZero
            } else {
                ContainerVerdict::TerminatedNonZero
            }
        }
        Some(ContainerState { running: Some(_), .. }) => ContainerVerdict::Running,
        _ => ContainerVerdict::WaitingOrUnknown,
    }
}

/// True if the pod's main container is not in a terminated state (pending,
/// running, or unknown) — the predicate the cleanup agent uses (§4.4, P8).
pub fn main_container_is_non_terminated(pod: &Pod) -> bool {
    match classify_pod(pod) {
        PodClassification::Succeeded | PodClassification::ContainerError => false,
        PodClassification::InitContainerError => false,
        PodClassification::Running | PodClassification::Pending => true,
    }
}

fn pod_role(pod: &Pod) -> Option<Role> {
    let labels = pod.metadata.labels.as_ref()?;
    match labels.get(LABEL_ROLE)?.as_str() {
        "driver" => Some(Role::Driver),
        "server" => Some(Role::Server),
        "client" => Some(Role::Client),
        _ => None,
    }
}

fn pod_component_name(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_COMPONENT))
        .map(String::as_str)
}

fn expected_components(loadtest: &LoadTest) -> Vec<(Role, String)> {
    let mut out = Vec::new();
    for (i, s) in loadtest.spec.servers.iter().enumerate() {
        out.push((Role::Server, component_key(s, Role::Server, i)));
    }
    for (i, c) in loadtest.spec.clients.iter().enumerate() {
        out.push((Role::Client, component_key(c, Role::Client, i)));
    }
    if let Some(driver) = &loadtest.spec.driver {
        out.push((Role::Driver, component_key(driver, Role::Driver, 0)));
    }
    out
}

fn component_key(c: &Component, role: Role, index: usize) -> String {
    c.name
        .clone()
        .unwrap_or_else(|| format!("{}-{index}", role.label_value()))
}

/// Matches expected components against owned pods on `(role, componentName)`,
/// returning those with no matching pod, in user declaration order.
pub fn missing_components(loadtest: &LoadTest, owned: &[Pod]) -> Vec<MissingComponent> {
    let present: std::collections::HashSet<(Role, String)> = owned
        .iter()
        .filter_map(|p| Some((pod_role(p)?, pod_component_name(p)?.to_string())))
        .collect();

    expected_components(loadtest)
        .into_iter()
        .filter(|(role, name)| !present.contains(&(*role, name.clone())))
        .map(|(role, name)| MissingComponent { role, name })
        .collect()
}

/// Computes the new `LoadTestStatus` for `loadtest` given the currently
/// owned pods and the current wall-clock time. Pure: same inputs always
/// produce the same output (P7).
pub fn compute_status(loadtest: &LoadTest, owned: &[Pod], now: DateTime<Utc>) -> LoadTestStatus {
    let current = loadtest.status.clone().unwrap_or_default();

    if current.state.is_terminal() {
        // P1: terminal statuses are never recomputed.
        return current;
    }

    let missing = missing_components(loadtest, owned);
    let expected_count = expected_components(loadtest).len();

    let mut driver_succeeded = false;
    let mut all_running_or_succeeded = true;
    let mut failure: Option<(Reason, String)> = None;

    for pod in owned {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        match classify_pod(pod) {
            PodClassification::InitContainerError => {
                failure.get_or_insert((
                    Reason::InitContainerError,
                    format!("pod {pod_name} failed an init container"),
                ));
            }
            PodClassification::ContainerError => {
                failure.get_or_insert((
                    Reason::ContainerError,
                    format!("pod {pod_name} main container exited non-zero"),
                ));
            }
            PodClassification::Succeeded => {
                if pod_role(pod) == Some(Role::Driver) {
                    driver_succeeded = true;
                }
            }
            PodClassification::Running => {}
            PodClassification::Pending => {
                all_running_or_succeeded = false;
            }
        }
    }

    let mut new_status = if let Some((reason, message)) = failure {
        LoadTestStatus {
            state: LoadTestState::Errored,
            reason: Some(reason),
            message: Some(message),
            start_time: current.start_time.clone(),
            stop_time: current.stop_time.clone(),
        }
    } else if driver_succeeded {
        LoadTestStatus {
            state: LoadTestState::Succeeded,
            reason: None,
            message: None,
            start_time: current.start_time.clone(),
            stop_time: current.stop_time.clone(),
        }
    } else if missing.is_empty()
        && owned.len() >= expected_count
        && expected_count > 0
        && all_running_or_succeeded
    {
        LoadTestStatus {
            state: LoadTestState::Running,
            reason: None,
            message: None,
            start_time: current.start_time.clone(),
            stop_time: current.stop_time.clone(),
        }
    } else if !missing.is_empty() {
        LoadTestStatus {
            state: LoadTestState::Initializing,
            reason: Some(Reason::PodsMissing),
            message: Some(format!("{} component(s) awaiting a pod", missing.len())),
            start_time: current.start_time.clone(),
            stop_time: current.stop_time.clone(),
        }
    } else {
        LoadTestStatus {
            state: LoadTestState::Initializing,
            reason: None,
            message: None,
            start_time: current.start_time.clone(),
            stop_time: current.stop_time.clone(),
        }
    };

    if new_status.start_time.is_none() && new_status.state != LoadTestState::Unknown {
        new_status.start_time = Some(Time(now));
    }
    if new_status.state.is_terminal() && new_status.stop_time.is_none() {
        new_status.stop_time = Some(Time(now));
    }

    apply_timeout_overlay(loadtest, &mut new_status, now);

    new_status
}

fn apply_timeout_overlay(loadtest: &LoadTest, status: &mut LoadTestStatus, now: DateTime<Utc>) {
    if status.state.is_terminal() {
        return;
    }
    let Some(start) = status.start_time.as_ref() else {
        return;
    };
    let elapsed = now.signed_duration_since(start.0);
    if elapsed.num_seconds() > loadtest.spec.timeout_seconds as i64 {
        status.state = LoadTestState::Errored;
        status.reason = Some(Reason::TimeoutErrored);
        status.message = Some(format!(
            "running time {}s exceeded timeoutSeconds {}",
            elapsed.num_seconds(),
            loadtest.spec.timeout_seconds
        ));
        status.stop_time = Some(Time(now));
    }
}
