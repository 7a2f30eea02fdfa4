//! Cleanup agent (spec.md §4.4): once a `LoadTest` has terminated, signal any
//! still-running server/client worker to quit over gRPC. Never touches the
//! driver and never deletes pods.

use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tonic::transport::Channel;

use crate::crd::{LoadTest, LoadTestState, DRIVER_PORT, LABEL_ROLE};
use crate::status::main_container_is_non_terminated;

pub mod worker {
    tonic::include_proto!("grpc.testing");
}

use worker::worker_service_client::WorkerServiceClient;
use worker::Void;

const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pure selection predicate (P8): a pod is a cleanup target iff its
/// `loadtest-role` is `server` or `client` and its main container has not
/// terminated.
pub fn is_cleanup_target(pod: &Pod) -> bool {
    let role = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_ROLE))
        .map(String::as_str);

    matches!(role, Some("server") | Some("client")) && main_container_is_non_terminated(pod)
}

/// Selects the pods the cleanup agent should act on for a terminated
/// `LoadTest`. Returns an empty set if the test has not reached a terminal
/// state — cleanup only ever runs after termination.
pub fn select_cleanup_targets<'a>(loadtest: &LoadTest, owned: &'a [Pod]) -> Vec<&'a Pod> {
    let Some(status) = &loadtest.status else {
        return Vec::new();
    };
    if !status.state.is_terminal() {
        return Vec::new();
    }
    owned.iter().filter(|p| is_cleanup_target(p)).collect()
}

/// Thin wrapper over the generated `WorkerService` client, connecting fresh
/// per call since cleanup is infrequent and best-effort.
pub struct WorkerClient {
    client: WorkerServiceClient<Channel>,
}

impl WorkerClient {
    pub async fn connect(pod_ip: &str) -> Result<Self, tonic::transport::Error> {
        let addr = format!("http://{pod_ip}:{DRIVER_PORT}");
        let client = WorkerServiceClient::connect(addr).await?;
        Ok(Self { client })
    }

    pub async fn quit_worker(&mut self) -> Result<(), tonic::Status> {
        let request = tonic::Request::new(Void {});
        self.client.quit_worker(request).await?;
        Ok(())
    }
}

/// Issues `QuitWorker` to every selected target, logging and swallowing
/// individual failures (§4.4 step 4: cleanup is best-effort and idempotent).
pub async fn run_cleanup(loadtest: &LoadTest, owned: &[Pod]) {
    for pod in select_cleanup_targets(loadtest, owned) {
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let Some(pod_ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) else {
            tracing::debug!(pod = %pod_name, "no pod IP yet, skipping this tick");
            continue;
        };

        let outcome = tokio::time::timeout(QUIT_TIMEOUT, async {
            let mut client = WorkerClient::connect(&pod_ip)
                .await
                .map_err(|e| e.to_string())?;
            client.quit_worker().await.map_err(|e| e.to_string())
        })
        .await;

        match outcome {
            Ok(Ok(())) => tracing::info!(pod = %pod_name, "sent QuitWorker"),
            Ok(Err(e)) => tracing::warn!(pod = %pod_name, error = %e, "QuitWorker failed"),
            Err(_) => tracing::warn!(pod = %pod_name, "QuitWorker timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{LoadTestSpec, LoadTestStatus};
    use k8s_openapi::api::core::v1::PodStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_state(role: &str, state: &str) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_ROLE.to_string(), role.to_string());

        let container_state = match state {
            "running" => k8s_openapi::api::core::v1::ContainerState {
                running: Some(k8s_openapi::api::core::v1::ContainerStateRunning { started_at: None }),
                ..Default::default()
            },
            "succeeded" => k8s_openapi::api::core::v1::ContainerState {
                terminated: Some(k8s_openapi::api::core::v1::ContainerStateTerminated {
                    exit_code: 0,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "failed" => k8s_openapi::api::core::v1::ContainerState {
                terminated: Some(k8s_openapi::api::core::v1::ContainerStateTerminated {
                    exit_code: 1,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "unknown" | "pending" | _ => k8s_openapi::api::core::v1::ContainerState {
                waiting: Some(k8s_openapi::api::core::v1::ContainerStateWaiting::default()),
                ..Default::default()
            },
        };

        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{role}-{state}")),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.1".to_string()),
                container_statuses: Some(vec![k8s_openapi::api::core::v1::ContainerStatus {
                    name: "main".to_string(),
                    state: Some(container_state),
                    ready: false,
                    restart_count: 0,
                    image: String::new(),
                    image_id: String::new(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            spec: None,
        }
    }

    fn terminated_loadtest() -> LoadTest {
        let mut lt = LoadTest::new(
            "bench-1",
            LoadTestSpec {
                timeout_seconds: 300,
                ttl_seconds: 600,
                ..Default::default()
            },
        );
        lt.status = Some(LoadTestStatus {
            state: LoadTestState::Succeeded,
            stop_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        });
        lt
    }

    #[test]
    fn test_cleanup_scenario_quits_only_live_workers() {
        let lt = terminated_loadtest();
        let owned = vec![
            pod_with_state("server", "pending"),
            pod_with_state("server", "succeeded"),
            pod_with_state("client", "failed"),
            pod_with_state("client", "unknown"),
            pod_with_state("client", "running"),
            pod_with_state("driver", "running"),
        ];

        let targets: Vec<&str> = select_cleanup_targets(&lt, &owned)
            .into_iter()
            .map(|p| p.metadata.name.as_deref().unwrap())
            .collect();

        assert!(targets.contains(&"server-pending"));
        assert!(targets.contains(&"client-unknown"));
        assert!(targets.contains(&"client-running"));
        assert!(!targets.contains(&"server-succeeded"));
        assert!(!targets.contains(&"client-failed"));
        assert!(!targets.contains(&"driver-running"));
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn test_non_terminal_loadtest_has_no_targets() {
        let mut lt = terminated_loadtest();
        lt.status = Some(LoadTestStatus {
            state: LoadTestState::Running,
            ..Default::default()
        });
        let owned = vec![pod_with_state("server", "pending")];
        assert!(select_cleanup_targets(&lt, &owned).is_empty());
    }

    #[test]
    fn test_is_cleanup_target_excludes_driver() {
        let pod = pod_with_state("driver", "pending");
        assert!(!is_cleanup_target(&pod));
    }

    #[test]
    fn test_is_cleanup_target_includes_live_server() {
        let pod = pod_with_state("server", "running");
        assert!(is_cleanup_target(&pod));
    }
}
