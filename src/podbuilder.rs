//! Pure pod specification synthesis (spec.md §4.2). No network I/O: every
//! function here is a deterministic translation of `(defaults, loadtest,
//! component, role)` into a Kubernetes value type.

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort, ConfigMapVolumeSource, EmptyDirVolumeSource, EnvVar as KubeEnvVar,
    LabelSelector, LabelSelectorRequirement, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{Component, LoadTest, Role, DRIVER_PORT, LABEL_COMPONENT, LABEL_ROLE, LABEL_TEST};
use crate::defaults::Defaults;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/src/workspace";
const BAZEL_CACHE_VOLUME: &str = "bazel-cache";
const BAZEL_CACHE_PATH: &str = "/root/.cache/bazel";
const WORKER_ADDRESSES_VOLUME: &str = "worker-addresses";
const WORKER_ADDRESSES_PATH: &str = "/var/data/qps_workers";
const SCENARIOS_PATH: &str = "/src/scenarios";
const XDS_BOOTSTRAP_VOLUME: &str = "grpc-xds-bootstrap";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("no pool resolvable for {role} component {name:?}: component has no explicit pool and no default pool label is configured")]
    PoolError { role: Role, name: String },
}

/// Builds the pod spec for one component of a `LoadTest`. Pure: same inputs
/// always yield the same `Pod` value (modulo the caller supplying the owner
/// reference UID, which comes from whatever `LoadTest` value is passed in).
pub fn build_pod(
    defaults: &Defaults,
    loadtest: &LoadTest,
    component: &Component,
    role: Role,
) -> Result<Pod, BuildError> {
    let test_name = loadtest.name_any();
    let namespace = loadtest
        .namespace()
        .unwrap_or_else(|| defaults.component_namespace.clone());
    let component_name = component
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-unnamed", role.label_value()));

    let node_selector = resolve_node_selector(defaults, component, role)?;

    let mut volumes = vec![
        Volume {
            name: WORKSPACE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: BAZEL_CACHE_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let mut init_containers = Vec::new();

    if let Some(clone) = &component.clone {
        init_containers.push(Container {
            name: "clone".to_string(),
            image: Some(clone.image.clone().unwrap_or_else(|| defaults.clone_image.clone())),
            env: Some(vec![
                env("CLONE_REPO", &clone.repo),
                env("CLONE_GIT_REF", &clone.git_ref),
            ]),
            volume_mounts: Some(vec![workspace_mount()]),
            ..Default::default()
        });
    }

    if let Some(build) = &component.build {
        let image = build.image.clone().unwrap_or_else(|| {
            // Defaults application is expected to have already resolved this;
            // fall back to the driver image only so pod synthesis never panics
            // on a spec that somehow reaches here unresolved.
            defaults.driver_image.clone()
        });
        init_containers.push(Container {
            name: "build".to_string(),
            image: Some(image),
            command: build.command.clone(),
            args: Some(build.args.clone()),
            working_dir: Some(WORKSPACE_PATH.to_string()),
            env: Some(build.env.iter().map(|e| env(&e.name, &e.value)).collect()),
            volume_mounts: Some(vec![workspace_mount(), bazel_cache_mount()]),
            ..Default::default()
        });
    }

    if role == Role::Driver {
        volumes.push(Volume {
            name: WORKER_ADDRESSES_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        init_containers.push(Container {
            name: "ready".to_string(),
            image: Some(defaults.ready_image.clone()),
            command: Some(vec!["ready".to_string()]),
            args: Some(vec![test_name.clone()]),
            env: Some(vec![
                env(
                    "READY_OUTPUT_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/addresses"),
                ),
                env(
                    "READY_TIMEOUT",
                    &format!("{}s", loadtest.spec.timeout_seconds),
                ),
                env(
                    "METADATA_OUTPUT_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/metadata.json"),
                ),
                env(
                    "NODE_INFO_OUTPUT_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/node_info.json"),
                ),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: WORKER_ADDRESSES_VOLUME.to_string(),
                mount_path: WORKER_ADDRESSES_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
    }

    let mut run_containers = Vec::new();
    let has_xds_server = component.run.iter().any(|c| c.name == "xds-server");
    let has_sidecar = component.run.iter().any(|c| c.name == "sidecar");
    if role == Role::Client && has_xds_server && !has_sidecar {
        volumes.push(Volume {
            name: XDS_BOOTSTRAP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
    }

    for (i, run) in component.run.iter().enumerate() {
        let mut mounts = vec![workspace_mount(), bazel_cache_mount()];
        let mut envs: Vec<KubeEnvVar> = run.env.iter().map(|e| env(&e.name, &e.value)).collect();
        let mut ports = Vec::new();

        if i == 0 {
            envs.push(env("KILL_AFTER", &defaults.kill_after.to_string()));
            envs.push(env("POD_TIMEOUT", &loadtest.spec.timeout_seconds.to_string()));
            envs.push(env("DRIVER_PORT", &DRIVER_PORT.to_string()));
            ports.push(ContainerPort {
                name: Some("driver".to_string()),
                container_port: DRIVER_PORT as i32,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });

            if role == Role::Server {
                if let Some(metrics_port) = component.metrics_port.filter(|p| *p != 0) {
                    ports.push(ContainerPort {
                        name: Some("metrics".to_string()),
                        container_port: metrics_port as i32,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    });
                }
            }

            if role == Role::Driver {
                mounts.push(VolumeMount {
                    name: WORKER_ADDRESSES_VOLUME.to_string(),
                    mount_path: WORKER_ADDRESSES_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
                mounts.push(VolumeMount {
                    name: "scenarios".to_string(),
                    mount_path: SCENARIOS_PATH.to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
                envs.push(env(
                    "SCENARIOS_FILE",
                    &format!("{SCENARIOS_PATH}/scenarios.json"),
                ));
                envs.push(env(
                    "METADATA_OUTPUT_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/metadata.json"),
                ));
                envs.push(env(
                    "NODE_INFO_OUTPUT_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/node_info.json"),
                ));
                envs.push(env(
                    "QPS_WORKERS_FILE",
                    &format!("{WORKER_ADDRESSES_PATH}/addresses"),
                ));
                if let Some(results) = &loadtest.spec.results {
                    if let Some(table) = &results.big_query_table {
                        envs.push(env("BQ_RESULT_TABLE", table));
                    }
                }
                if loadtest.annotations().get("enablePrometheus").map(String::as_str) == Some("true") {
                    envs.push(env("ENABLE_PROMETHEUS", "true"));
                }
            }

            if role == Role::Client && has_xds_server && !has_sidecar {
                mounts.push(VolumeMount {
                    name: XDS_BOOTSTRAP_VOLUME.to_string(),
                    mount_path: "/var/run/xds".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                });
            }
        } else if role == Role::Client && run.name == "xds-server" && has_xds_server && !has_sidecar {
            mounts.push(VolumeMount {
                name: XDS_BOOTSTRAP_VOLUME.to_string(),
                mount_path: "/var/run/xds".to_string(),
                read_only: Some(false),
                ..Default::default()
            });
        }

        run_containers.push(Container {
            name: run.name.clone(),
            image: run.image.clone(),
            command: run.command.clone(),
            args: Some(run.args.clone()),
            env: Some(envs),
            ports: Some(ports).filter(|p| !p.is_empty()),
            volume_mounts: Some(mounts),
            ..Default::default()
        });
    }

    if role == Role::Driver {
        volumes.push(Volume {
            name: "scenarios".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: test_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_TEST.to_string(), test_name.clone());
    labels.insert(LABEL_ROLE.to_string(), role.label_value().to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component_name.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(format!("{test_name}-{}-{component_name}", role.label_value())),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(loadtest)]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            node_selector: Some(node_selector),
            affinity: Some(pod_anti_affinity()),
            init_containers: Some(init_containers).filter(|c| !c.is_empty()),
            containers: run_containers,
            volumes: Some(volumes),
            ..Default::default()
        }),
        status: None,
    })
}

fn resolve_node_selector(
    defaults: &Defaults,
    component: &Component,
    role: Role,
) -> Result<BTreeMap<String, String>, BuildError> {
    if let Some(pool) = &component.pool {
        let mut selector = BTreeMap::new();
        selector.insert("pool".to_string(), pool.clone());
        return Ok(selector);
    }

    let label_key = match role {
        Role::Driver => defaults.default_pool_labels.driver.as_ref(),
        Role::Client => defaults.default_pool_labels.client.as_ref(),
        Role::Server => defaults.default_pool_labels.server.as_ref(),
    };

    let label_key = label_key.ok_or_else(|| BuildError::PoolError {
        role,
        name: component.name.clone().unwrap_or_default(),
    })?;

    let mut selector = BTreeMap::new();
    selector.insert(label_key.clone(), "true".to_string());
    Ok(selector)
}

fn pod_anti_affinity() -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_expressions: Some(vec![LabelSelectorRequirement {
                        key: LABEL_ROLE.to_string(),
                        operator: "Exists".to_string(),
                        values: None,
                    }]),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn owner_reference(loadtest: &LoadTest) -> OwnerReference {
    OwnerReference {
        api_version: "e2etest.grpc.io/v1".to_string(),
        kind: "LoadTest".to_string(),
        name: loadtest.name_any(),
        uid: loadtest.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn env(name: &str, value: &str) -> KubeEnvVar {
    KubeEnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn workspace_mount() -> VolumeMount {
    VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_PATH.to_string(),
        ..Default::default()
    }
}

fn bazel_cache_mount() -> VolumeMount {
    VolumeMount {
        name: BAZEL_CACHE_VOLUME.to_string(),
        mount_path: BAZEL_CACHE_PATH.to_string(),
        ..Default::default()
    }
}

/// Scenarios `ConfigMap` synthesised alongside the driver pod (spec.md §3,
/// §6); owned by the `LoadTest` so it is garbage-collected with it.
pub fn build_scenarios_configmap(loadtest: &LoadTest) -> Option<k8s_openapi::api::core::v1::ConfigMap> {
    let scenarios = loadtest.spec.scenarios_json.as_ref()?;
    let mut data = BTreeMap::new();
    data.insert(
        "scenarios.json".to_string(),
        serde_json::to_string(scenarios).ok()?,
    );
    Some(k8s_openapi::api::core::v1::ConfigMap {
        metadata: ObjectMeta {
            name: Some(loadtest.name_any()),
            namespace: loadtest.namespace(),
            owner_references: Some(vec![owner_reference(loadtest)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}
