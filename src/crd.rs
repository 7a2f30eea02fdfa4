use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= COMPONENT TYPES ============================= */

/// Which role a [`Component`] plays inside a [`LoadTestSpec`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Driver,
    Server,
    Client,
}

impl Role {
    pub fn label_value(self) -> &'static str {
        match self {
            Role::Driver => "driver",
            Role::Server => "server",
            Role::Client => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label_value())
    }
}

/// Source clone step run before `build`, iff present.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloneSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub repo: String,
    pub git_ref: String,
}

/// Build step run after `clone` (if any) and before the run containers start.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// A plain name/value environment entry (mirrors `core/v1.EnvVar` without the
/// `valueFrom` variants, which this system never needs).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// A single container inside a component's `run` list. Only the fields the
/// orchestrator cares about are modeled; everything else is copied verbatim
/// from the user-supplied container spec at pod-build time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunContainer {
    pub name: String,
    /// Resolved from the language table at defaults-application time if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
}

/// A driver, server, or client entry inside a `LoadTest` spec.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Stable name within the role; auto-assigned if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Node pool this component must be scheduled onto.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone: Option<CloneSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,

    /// Run containers; element 0 is the primary process.
    #[serde(default)]
    pub run: Vec<RunContainer>,

    /// Client-only: port the run container exposes for scraping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

/* ============================= SPEC ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_query_table: Option<String>,
}

/// LoadTest declares one driver, N servers, and M clients for a single gRPC
/// benchmark run.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "e2etest.grpc.io",
    version = "v1",
    kind = "LoadTest",
    plural = "loadtests",
    shortname = "lt",
    status = "LoadTestStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<Component>,

    #[serde(default)]
    pub servers: Vec<Component>,

    #[serde(default)]
    pub clients: Vec<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultsSpec>,

    /// Opaque scenarios blob, materialized into a ConfigMap for the driver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenarios_json: Option<serde_json::Value>,

    pub timeout_seconds: u32,

    pub ttl_seconds: u32,
}

/* ============================= STATUS ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LoadTestState {
    #[default]
    Unknown,
    Initializing,
    Running,
    Succeeded,
    Errored,
}

impl LoadTestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LoadTestState::Succeeded | LoadTestState::Errored)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Reason {
    InitContainerError,
    ContainerError,
    PodsMissing,
    TimeoutErrored,
    FailedSettingDefaults,
    ConfigurationError,
    PoolError,
    KubernetesError,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reason::InitContainerError => "InitContainerError",
            Reason::ContainerError => "ContainerError",
            Reason::PodsMissing => "PodsMissing",
            Reason::TimeoutErrored => "TimeoutErrored",
            Reason::FailedSettingDefaults => "FailedSettingDefaults",
            Reason::ConfigurationError => "ConfigurationError",
            Reason::PoolError => "PoolError",
            Reason::KubernetesError => "KubernetesError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestStatus {
    #[serde(default)]
    pub state: LoadTestState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<Time>,
}

impl LoadTestStatus {
    /// Equality over the fields the reconciler is allowed to patch; used to
    /// decide whether a status patch is necessary on a given tick.
    pub fn observably_equal(&self, other: &LoadTestStatus) -> bool {
        self.state == other.state
            && self.reason == other.reason
            && self.message == other.message
            && self.start_time.as_ref().map(|t| &t.0) == other.start_time.as_ref().map(|t| &t.0)
            && self.stop_time.as_ref().map(|t| &t.0) == other.stop_time.as_ref().map(|t| &t.0)
    }
}

/* ============================= LABELS ============================= */

pub const LABEL_TEST: &str = "loadtest";
pub const LABEL_ROLE: &str = "loadtest-role";
pub const LABEL_COMPONENT: &str = "loadtest-component";

pub const DRIVER_PORT: u16 = 10000;

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_crd_generates_valid_yaml() {
        let crd = LoadTest::crd();
        let yaml = serde_yaml::to_string(&crd).expect("CRD should serialize to YAML");
        assert!(yaml.contains("e2etest.grpc.io"));
        assert!(yaml.contains("LoadTest"));
        assert!(yaml.contains("loadtests"));
    }

    #[test]
    fn test_crd_is_namespaced() {
        let crd = LoadTest::crd();
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = LoadTestSpec {
            driver: None,
            servers: vec![Component {
                name: Some("server-0".to_string()),
                language: Some("cxx".to_string()),
                ..Default::default()
            }],
            clients: vec![],
            results: None,
            scenarios_json: Some(serde_json::json!({"scenarios": []})),
            timeout_seconds: 300,
            ttl_seconds: 600,
        };
        let json = serde_json::to_string(&spec).expect("should serialize");
        let back: LoadTestSpec = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back.servers.len(), 1);
        assert_eq!(back.timeout_seconds, 300);
    }

    #[test]
    fn test_role_label_values() {
        assert_eq!(Role::Driver.label_value(), "driver");
        assert_eq!(Role::Server.label_value(), "server");
        assert_eq!(Role::Client.label_value(), "client");
    }

    #[test]
    fn test_state_is_terminal() {
        assert!(LoadTestState::Succeeded.is_terminal());
        assert!(LoadTestState::Errored.is_terminal());
        assert!(!LoadTestState::Running.is_terminal());
        assert!(!LoadTestState::Initializing.is_terminal());
        assert!(!LoadTestState::Unknown.is_terminal());
    }

    #[test]
    fn test_status_default_is_unknown() {
        let status = LoadTestStatus::default();
        assert_eq!(status.state, LoadTestState::Unknown);
        assert!(status.reason.is_none());
    }

    #[test]
    fn test_status_observably_equal() {
        let a = LoadTestStatus {
            state: LoadTestState::Running,
            ..Default::default()
        };
        let b = a.clone();
        assert!(a.observably_equal(&b));

        let c = LoadTestStatus {
            state: LoadTestState::Succeeded,
            ..Default::default()
        };
        assert!(!a.observably_equal(&c));
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(Reason::PoolError.to_string(), "PoolError");
        assert_eq!(Reason::PodsMissing.to_string(), "PodsMissing");
    }

    #[test]
    fn test_component_defaults_all_none() {
        let c = Component::default();
        assert!(c.name.is_none());
        assert!(c.pool.is_none());
        assert!(c.clone.is_none());
        assert!(c.build.is_none());
        assert!(c.run.is_empty());
    }
}
