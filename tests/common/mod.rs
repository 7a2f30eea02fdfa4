use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

use loadtest_operator::crd::{LABEL_COMPONENT, LABEL_ROLE, LABEL_TEST};

/// Builds an owned worker pod with a single main container in the given
/// state, labelled the way `podbuilder::build_pod` labels its output.
pub fn make_worker_pod(test_name: &str, role: &str, component: &str, state: &str) -> Pod {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_TEST.to_string(), test_name.to_string());
    labels.insert(LABEL_ROLE.to_string(), role.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());

    let container_state = match state {
        "running" => ContainerState {
            running: Some(ContainerStateRunning { started_at: None }),
            ..Default::default()
        },
        "succeeded" => ContainerState {
            terminated: Some(ContainerStateTerminated { exit_code: 0, ..Default::default() }),
            ..Default::default()
        },
        "failed" => ContainerState {
            terminated: Some(ContainerStateTerminated { exit_code: 1, ..Default::default() }),
            ..Default::default()
        },
        _ => ContainerState::default(),
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{test_name}-{role}-{component}")),
            namespace: Some("benchmarks".to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                state: Some(container_state),
                ready: state == "running",
                restart_count: 0,
                image: "irrelevant:latest".to_string(),
                image_id: String::new(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}
