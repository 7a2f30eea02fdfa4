//! System-wide defaults document and the resolver that applies it to an
//! incoming `LoadTest` (spec.md §4.5).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crd::{Component, LoadTestSpec, Role};

/* ============================= DOCUMENT ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LanguageImages {
    pub language: String,
    pub build_image: String,
    pub run_image: String,
}

/// Parsed `config/defaults.yaml` (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Defaults {
    #[serde(default)]
    pub component_namespace: String,

    #[serde(default)]
    pub default_pool_labels: PoolLabels,

    pub clone_image: String,
    pub ready_image: String,
    pub driver_image: String,

    #[serde(default)]
    pub languages: Vec<LanguageImages>,

    /// Seconds granted to a process to exit after SIGTERM.
    pub kill_after: u32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DefaultsError {
    #[error("clone/ready/driver image must not be empty")]
    EmptyCoreImage,
    #[error("language entry {0} is missing its name")]
    EmptyLanguageName(usize),
    #[error("language entry {0:?} is missing a build or run image")]
    EmptyLanguageImage(String),
    #[error("killAfter must be a positive, finite number of seconds")]
    InvalidKillAfter,
    #[error("no pool resolvable for {role} component {name:?}: no explicit pool and no default pool label configured")]
    NoPool { role: Role, name: String },
    #[error("unknown language {0:?} and no explicit image set")]
    UnknownLanguage(String),
    #[error(
        "inconsistent client topology: either every client has both xds-server and sidecar, or none do"
    )]
    MixedClientTopology,
}

/* ============================= VALIDATION (process start) ============================= */

/// Validates the system-wide defaults document itself, at process start.
pub fn validate(defaults: &Defaults) -> Result<(), DefaultsError> {
    if defaults.clone_image.trim().is_empty()
        || defaults.ready_image.trim().is_empty()
        || defaults.driver_image.trim().is_empty()
    {
        return Err(DefaultsError::EmptyCoreImage);
    }

    for (i, lang) in defaults.languages.iter().enumerate() {
        if lang.language.trim().is_empty() {
            return Err(DefaultsError::EmptyLanguageName(i));
        }
        if lang.build_image.trim().is_empty() || lang.run_image.trim().is_empty() {
            return Err(DefaultsError::EmptyLanguageImage(lang.language.clone()));
        }
    }

    if defaults.kill_after == 0 {
        return Err(DefaultsError::InvalidKillAfter);
    }

    let has_pool_label = defaults.default_pool_labels.driver.is_some()
        || defaults.default_pool_labels.client.is_some()
        || defaults.default_pool_labels.server.is_some();
    if !has_pool_label {
        // Components may still carry an explicit `pool`; this is only a
        // problem once a component omits `pool` and we have nothing to fall
        // back on, which `resolve_pool` catches per-component.
        tracing::warn!("no defaultPoolLabels configured; components must set an explicit pool");
    }

    Ok(())
}

fn image_for_language<'a>(
    defaults: &'a Defaults,
    language: &str,
) -> Option<&'a LanguageImages> {
    defaults.languages.iter().find(|l| l.language == language)
}

/* ============================= PER-LOADTEST APPLICATION ============================= */

/// Applies `defaults` to `spec`, filling unset fields. Returns the (possibly
/// unchanged) spec and whether anything was actually filled in, so the
/// reconciler knows whether to persist an updated spec (§4.1 step 5).
///
/// Pure and idempotent: `apply(d, apply(d, t).0) == apply(d, t)` (P6).
pub fn apply(defaults: &Defaults, namespace: &str, spec: &LoadTestSpec) -> Result<(LoadTestSpec, bool), DefaultsError> {
    let mut out = spec.clone();
    let mut changed = false;

    let _ = namespace; // namespace defaulting happens at the LoadTest metadata level, see apply_namespace

    let mut driver = out.driver.clone().unwrap_or_else(default_driver);
    changed |= resolve_component(defaults, &mut driver, Role::Driver, 0)?;
    out.driver = Some(driver);

    for (i, server) in out.servers.iter_mut().enumerate() {
        changed |= resolve_component(defaults, server, Role::Server, i)?;
    }

    for (i, client) in out.clients.iter_mut().enumerate() {
        changed |= resolve_component(defaults, client, Role::Client, i)?;
    }

    validate_client_topology(&out.clients)?;

    if out.ttl_seconds < out.timeout_seconds {
        tracing::warn!(
            ttl_seconds = out.ttl_seconds,
            timeout_seconds = out.timeout_seconds,
            "ttlSeconds is less than timeoutSeconds; accepted, but the LoadTest may be \
             deleted before a slow run can reach a terminal state"
        );
    }

    Ok((out, changed))
}

/// Namespace defaulting is metadata-level, not spec-level: fills the
/// namespace a bare `LoadTest` should be created in if the caller left it
/// empty (used before the object ever reaches the API server, e.g. by a
/// client library; the reconciler itself always observes an already-namespaced
/// object).
pub fn apply_namespace(defaults: &Defaults, namespace: Option<&str>) -> String {
    namespace
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| defaults.component_namespace.clone())
}

fn default_driver() -> Component {
    Component {
        name: None,
        language: Some("cxx".to_string()),
        pool: None,
        clone: None,
        build: None,
        run: Vec::new(),
        metrics_port: None,
    }
}

fn resolve_component(
    defaults: &Defaults,
    component: &mut Component,
    role: Role,
    index: usize,
) -> Result<bool, DefaultsError> {
    let mut changed = false;

    if component.name.is_none() {
        component.name = Some(generate_name(role, index));
        changed = true;
    }

    resolve_pool(defaults, component, role)?;

    if let Some(clone) = component.clone.as_mut() {
        if clone.image.is_none() {
            clone.image = Some(defaults.clone_image.clone());
            changed = true;
        }
    }

    if let Some(build) = component.build.as_mut() {
        if build.image.is_none() {
            let language = component
                .language
                .as_deref()
                .ok_or_else(|| DefaultsError::UnknownLanguage(String::new()))?;
            let image = image_for_language(defaults, language)
                .ok_or_else(|| DefaultsError::UnknownLanguage(language.to_string()))?;
            build.image = Some(image.build_image.clone());
            changed = true;
        }
    }

    if component.run.is_empty() {
        // No run container declared at all: synthesize the primary process
        // container purely from the language's (or driver) default run image.
        let image = resolve_run_image(defaults, component.language.as_deref(), role)?;
        component.run.push(crate::crd::RunContainer {
            name: role.label_value().to_string(),
            image: Some(image),
            command: None,
            args: Vec::new(),
            env: Vec::new(),
        });
        changed = true;
    } else if component.run[0].image.is_none() {
        // Element 0 omitted its image: resolve from the language table.
        let image = resolve_run_image(defaults, component.language.as_deref(), role)?;
        component.run[0].image = Some(image);
        changed = true;
    }

    Ok(changed)
}

fn resolve_run_image(
    defaults: &Defaults,
    language: Option<&str>,
    role: Role,
) -> Result<String, DefaultsError> {
    let language = language.ok_or_else(|| DefaultsError::UnknownLanguage(String::new()))?;
    image_for_language(defaults, language)
        .map(|l| l.run_image.clone())
        .or_else(|| {
            if role == Role::Driver {
                Some(defaults.driver_image.clone())
            } else {
                None
            }
        })
        .ok_or_else(|| DefaultsError::UnknownLanguage(language.to_string()))
}

fn resolve_pool(
    defaults: &Defaults,
    component: &mut Component,
    role: Role,
) -> Result<(), DefaultsError> {
    if component.pool.is_some() {
        return Ok(());
    }

    let label = match role {
        Role::Driver => &defaults.default_pool_labels.driver,
        Role::Client => &defaults.default_pool_labels.client,
        Role::Server => &defaults.default_pool_labels.server,
    };

    if label.is_none() {
        return Err(DefaultsError::NoPool {
            role,
            name: component.name.clone().unwrap_or_default(),
        });
    }

    // Pool resolution from a default label is deferred to the pod builder,
    // which turns the label key into a `{key: "true"}` node selector; here
    // we only confirm resolvability so defaults application can fail fast.
    Ok(())
}

fn generate_name(role: Role, index: usize) -> String {
    let _ = index;
    format!("{}-{}", role.label_value(), short_uuid())
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Client topology validation (spec.md §4.5 last bullet): either every
/// client has both an `xds-server` and a `sidecar` auxiliary container, or
/// none do. A mix, or a client with a sidecar but no xDS container, is a
/// `ConfigurationError`.
fn validate_client_topology(clients: &[Component]) -> Result<(), DefaultsError> {
    if clients.is_empty() {
        return Ok(());
    }

    #[derive(PartialEq)]
    enum Topology {
        Bare,
        Proxyless,
        Proxied,
        Invalid,
    }

    fn classify(c: &Component) -> Topology {
        let has_xds = c.run.iter().any(|r| r.name == "xds-server");
        let has_sidecar = c.run.iter().any(|r| r.name == "sidecar");
        match (has_xds, has_sidecar) {
            (false, false) => Topology::Bare,
            (true, true) => Topology::Proxied,
            (true, false) => Topology::Proxyless,
            (false, true) => Topology::Invalid,
        }
    }

    let first = classify(&clients[0]);
    if first == Topology::Invalid {
        return Err(DefaultsError::MixedClientTopology);
    }

    for client in &clients[1..] {
        if classify(client) != first {
            return Err(DefaultsError::MixedClientTopology);
        }
    }

    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::RunContainer;

    fn sample_defaults() -> Defaults {
        Defaults {
            component_namespace: "loadtest".to_string(),
            default_pool_labels: PoolLabels {
                driver: Some("driver-pool".to_string()),
                client: Some("client-pool".to_string()),
                server: Some("server-pool".to_string()),
            },
            clone_image: "clone:latest".to_string(),
            ready_image: "ready:latest".to_string(),
            driver_image: "driver:latest".to_string(),
            languages: vec![LanguageImages {
                language: "cxx".to_string(),
                build_image: "cxx-build:latest".to_string(),
                run_image: "cxx-run:latest".to_string(),
            }],
            kill_after: 30,
        }
    }

    fn spec_with(servers: Vec<Component>, clients: Vec<Component>) -> LoadTestSpec {
        LoadTestSpec {
            driver: None,
            servers,
            clients,
            results: None,
            scenarios_json: None,
            timeout_seconds: 300,
            ttl_seconds: 600,
        }
    }

    fn cxx_component() -> Component {
        Component {
            language: Some("cxx".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_rejects_empty_core_image() {
        let mut d = sample_defaults();
        d.driver_image = String::new();
        assert_eq!(validate(&d), Err(DefaultsError::EmptyCoreImage));
    }

    #[test]
    fn test_validate_rejects_zero_kill_after() {
        let mut d = sample_defaults();
        d.kill_after = 0;
        assert_eq!(validate(&d), Err(DefaultsError::InvalidKillAfter));
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(validate(&sample_defaults()).is_ok());
    }

    #[test]
    fn test_apply_assigns_default_driver_and_names() {
        let defaults = sample_defaults();
        let spec = spec_with(vec![cxx_component()], vec![cxx_component()]);
        let (resolved, changed) = apply(&defaults, "ns", &spec).unwrap();
        assert!(changed);
        assert!(resolved.driver.is_some());
        assert!(resolved.servers[0].name.is_some());
        assert!(resolved.clients[0].name.is_some());
        assert_eq!(resolved.servers[0].run[0].image, "cxx-run:latest");
    }

    #[test]
    fn test_apply_unknown_language_fails() {
        let defaults = sample_defaults();
        let bad = Component {
            language: Some("fortran".to_string()),
            ..Default::default()
        };
        let spec = spec_with(vec![bad], vec![]);
        let err = apply(&defaults, "ns", &spec).unwrap_err();
        assert_eq!(err, DefaultsError::UnknownLanguage("fortran".to_string()));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let defaults = sample_defaults();
        let spec = spec_with(vec![cxx_component()], vec![]);
        let (once, _) = apply(&defaults, "ns", &spec).unwrap();
        let (twice, changed_again) = apply(&defaults, "ns", &once).unwrap();
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_apply_no_pool_resolvable_fails() {
        let mut defaults = sample_defaults();
        defaults.default_pool_labels.server = None;
        let spec = spec_with(vec![cxx_component()], vec![]);
        let err = apply(&defaults, "ns", &spec).unwrap_err();
        assert!(matches!(err, DefaultsError::NoPool { role: Role::Server, .. }));
    }

    #[test]
    fn test_apply_explicit_pool_is_kept() {
        let defaults = sample_defaults();
        let mut component = cxx_component();
        component.pool = Some("custom-pool".to_string());
        let spec = spec_with(vec![component], vec![]);
        let (resolved, _) = apply(&defaults, "ns", &spec).unwrap();
        assert_eq!(resolved.servers[0].pool.as_deref(), Some("custom-pool"));
    }

    #[test]
    fn test_client_topology_all_proxyless_ok() {
        let client = Component {
            run: vec![RunContainer {
                name: "xds-server".to_string(),
                image: Some("xds:latest".to_string()),
                command: None,
                args: vec![],
                env: vec![],
            }],
            language: Some("cxx".to_string()),
            ..Default::default()
        };
        assert!(validate_client_topology(&[client]).is_ok());
    }

    #[test]
    fn test_client_topology_mixed_rejected() {
        let proxyless = Component {
            run: vec![RunContainer {
                name: "xds-server".to_string(),
                image: Some("xds:latest".to_string()),
                command: None,
                args: vec![],
                env: vec![],
            }],
            ..Default::default()
        };
        let bare = Component::default();
        assert_eq!(
            validate_client_topology(&[proxyless, bare]),
            Err(DefaultsError::MixedClientTopology)
        );
    }

    #[test]
    fn test_client_topology_sidecar_without_xds_rejected() {
        let invalid = Component {
            run: vec![RunContainer {
                name: "sidecar".to_string(),
                image: Some("envoy:latest".to_string()),
                command: None,
                args: vec![],
                env: vec![],
            }],
            ..Default::default()
        };
        assert_eq!(
            validate_client_topology(&[invalid]),
            Err(DefaultsError::MixedClientTopology)
        );
    }

    #[test]
    fn test_apply_namespace_fills_when_empty() {
        let defaults = sample_defaults();
        assert_eq!(apply_namespace(&defaults, None), "loadtest");
        assert_eq!(apply_namespace(&defaults, Some("")), "loadtest");
        assert_eq!(apply_namespace(&defaults, Some("explicit")), "explicit");
    }
}
