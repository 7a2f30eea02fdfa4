use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, Histogram, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use loadtest_operator::crd::{
    LoadTest, LoadTestState, LoadTestStatus, Reason, Role, LABEL_COMPONENT, LABEL_ROLE, LABEL_TEST,
};
use loadtest_operator::defaults::{self, Defaults};
use loadtest_operator::podbuilder;
use loadtest_operator::status;

use loadtest_operator::leader;

/* ============================= CONFIG ============================= */

const HOLDER_IDENTITY: &str = "loadtest-reconciler";
const LEASE_NAME: &str = "loadtest-reconciler-leader";
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("loadtest_reconcile_total", "Total LoadTest reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "loadtest_reconcile_errors_total",
        "Total LoadTest reconciliation errors",
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static PODS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("loadtest_pods_created_total", "Total worker pods created")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static ACTIVE_LOADTESTS: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("loadtest_active", "LoadTests not yet in a terminal state")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "loadtest_reconcile_duration_seconds",
        "Duration of each reconciliation cycle in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

struct ReconcileState {
    ready: bool,
}

struct ReconcileContext {
    client: Client,
    defaults: Defaults,
}

/* ============================= ENTRY ============================= */

pub struct Options {
    pub namespace: Option<String>,
    pub defaults: Defaults,
    pub metrics_bind_address: SocketAddr,
    pub health_probe_bind_address: SocketAddr,
    pub leader_elect: bool,
}

pub async fn run(opts: Options) -> Result<()> {
    let client = Client::try_default().await.context("failed to load kubeconfig")?;

    if opts.leader_elect {
        let lease_namespace = opts.namespace.clone().unwrap_or_else(|| "default".to_string());
        let acquired = leader::acquire(&client, &lease_namespace, LEASE_NAME, HOLDER_IDENTITY).await?;
        if !acquired {
            info!("not leader, standing by");
            wait_for_leadership_or_shutdown(client, lease_namespace).await;
            return Ok(());
        }
        spawn_lease_renewal(client.clone(), lease_namespace);
    }

    LazyLock::force(&RECONCILE_TOTAL);
    LazyLock::force(&RECONCILE_ERRORS);
    LazyLock::force(&PODS_CREATED);
    LazyLock::force(&ACTIVE_LOADTESTS);
    LazyLock::force(&RECONCILE_DURATION);

    let loadtests: Api<LoadTest> = match &opts.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let pods: Api<Pod> = match &opts.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ReconcileContext {
        client: client.clone(),
        defaults: opts.defaults,
    });

    let state = Arc::new(Mutex::new(ReconcileState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let metrics_addr = opts.metrics_bind_address;
    let health_addr = opts.health_probe_bind_address;
    let http_handle = tokio::spawn(async move {
        start_http_servers(http_state, http_shutdown, metrics_addr, health_addr).await
    });

    let controller_state = state.clone();
    let controller = Controller::new(loadtests, Default::default())
        .owns(pods, Default::default())
        .run(reconcile, error_policy, ctx)
        .for_each(move |result| {
            let state = controller_state.clone();
            async move {
                {
                    let mut s = state.lock().await;
                    s.ready = true;
                }
                if let Err(e) = result {
                    warn!(error = %e, "reconcile dispatch error");
                }
            }
        });

    info!("loadtest reconciler started");

    tokio::select! {
        _ = controller => {
            info!("controller stream ended unexpectedly");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    Ok(())
}

async fn wait_for_leadership_or_shutdown(client: Client, lease_namespace: String) {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => return,
            _ = tokio::time::sleep(leader::RENEW_INTERVAL) => {
                match leader::acquire(&client, &lease_namespace, LEASE_NAME, HOLDER_IDENTITY).await {
                    Ok(true) => return,
                    _ => continue,
                }
            }
        }
    }
}

fn spawn_lease_renewal(client: Client, lease_namespace: String) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(leader::RENEW_INTERVAL).await;
            if let Err(e) = leader::renew(&client, &lease_namespace, LEASE_NAME, HOLDER_IDENTITY).await {
                warn!(error = %e, "lease renewal failed");
            }
        }
    });
}

/* ============================= RECONCILE ============================= */

async fn reconcile(
    loadtest: Arc<LoadTest>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, loadtest_operator::error::Error> {
    tokio::time::timeout(INVOCATION_TIMEOUT, reconcile_inner(loadtest, ctx))
        .await
        .unwrap_or_else(|_| Ok(Action::requeue(Duration::from_secs(30))))
}

async fn reconcile_inner(
    loadtest: Arc<LoadTest>,
    ctx: Arc<ReconcileContext>,
) -> std::result::Result<Action, loadtest_operator::error::Error> {
    RECONCILE_TOTAL.inc();
    let _timer = RECONCILE_DURATION.start_timer();

    let name = loadtest.name_any();
    let namespace = loadtest.namespace().unwrap_or_default();
    let loadtests: Api<LoadTest> = Api::namespaced(ctx.client.clone(), &namespace);

    info!(loadtest = %name, namespace = %namespace, "reconcile start");

    let current_status = loadtest.status.clone().unwrap_or_default();

    // Step 3: terminal + TTL handling.
    if current_status.state.is_terminal() {
        if let Some(start) = &current_status.start_time {
            let elapsed = Utc::now().signed_duration_since(start.0).num_seconds();
            if elapsed >= loadtest.spec.ttl_seconds as i64 {
                if let Err(e) = loadtests.delete(&name, &Default::default()).await {
                    warn!(loadtest = %name, error = %e, "failed to delete expired LoadTest");
                    return Ok(Action::requeue(Duration::from_secs(30)));
                }
                return Ok(Action::await_change());
            }
            let remaining = loadtest.spec.ttl_seconds as i64 - elapsed;
            return Ok(Action::requeue(Duration::from_secs(remaining.max(0) as u64)));
        }
        return Ok(Action::await_change());
    }

    // Step 4-5: apply defaults, persist if materially altered.
    let (defaulted_spec, changed) = match defaults::apply(&ctx.defaults, &namespace, &loadtest.spec) {
        Ok(v) => v,
        Err(e) => {
            RECONCILE_ERRORS.inc();
            let status = LoadTestStatus {
                state: LoadTestState::Errored,
                reason: Some(Reason::FailedSettingDefaults),
                message: Some(e.to_string()),
                start_time: current_status.start_time.clone(),
                stop_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now())),
            };
            patch_status(&loadtests, &name, &status).await?;
            return Ok(Action::await_change());
        }
    };

    let loadtest = if changed {
        let patch = serde_json::json!({ "spec": defaulted_spec });
        let updated = loadtests
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Arc::new(updated)
    } else {
        loadtest
    };

    // Step 6-7: list owned pods.
    let pods_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let all_pods = pods_api.list(&ListParams::default()).await?;
    let owned: Vec<Pod> = all_pods
        .into_iter()
        .filter(|p| is_owned_by(p, &name))
        .collect();

    // Step 8: compute status and missing components.
    let new_status = status::compute_status(&loadtest, &owned, Utc::now());
    let missing = status::missing_components(&loadtest, &owned);

    if !new_status.observably_equal(&current_status) {
        patch_status(&loadtests, &name, &new_status).await?;
    }

    if new_status.state.is_terminal() {
        return Ok(Action::await_change());
    }

    ACTIVE_LOADTESTS.set(1);

    // Step 10: create exactly one missing pod, server before client before driver.
    if let Some(missing_component) = pick_next(&missing) {
        if let Err(e) = create_pod_for(&ctx, &loadtest, &pods_api, missing_component).await {
            warn!(loadtest = %name, error = %e, "pod creation failed");
            let status = LoadTestStatus {
                state: LoadTestState::Errored,
                reason: Some(Reason::KubernetesError),
                message: Some(e.to_string()),
                start_time: new_status.start_time.clone(),
                stop_time: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now())),
            };
            patch_status(&loadtests, &name, &status).await?;
            return Ok(Action::await_change());
        }
        PODS_CREATED.inc();
    }

    // Step 11: requeue delay.
    let requeue = if new_status.start_time.is_some() && current_status.start_time.is_none() {
        Duration::from_secs(loadtest.spec.timeout_seconds as u64)
    } else {
        Duration::from_secs(0)
    };

    if requeue.is_zero() {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(requeue))
    }
}

fn pick_next(missing: &[status::MissingComponent]) -> Option<&status::MissingComponent> {
    missing
        .iter()
        .find(|m| m.role == Role::Server)
        .or_else(|| missing.iter().find(|m| m.role == Role::Client))
        .or_else(|| missing.iter().find(|m| m.role == Role::Driver))
}

async fn create_pod_for(
    ctx: &ReconcileContext,
    loadtest: &LoadTest,
    pods_api: &Api<Pod>,
    missing: &status::MissingComponent,
) -> std::result::Result<(), loadtest_operator::error::Error> {
    let component = match missing.role {
        Role::Server => loadtest
            .spec
            .servers
            .iter()
            .find(|c| c.name.as_deref() == Some(missing.name.as_str())),
        Role::Client => loadtest
            .spec
            .clients
            .iter()
            .find(|c| c.name.as_deref() == Some(missing.name.as_str())),
        Role::Driver => loadtest.spec.driver.as_ref(),
    };

    let Some(component) = component else {
        return Ok(());
    };

    let pod = podbuilder::build_pod(&ctx.defaults, loadtest, component, missing.role)
        .map_err(|e| loadtest_operator::error::Error::Build(e.to_string()))?;

    if missing.role == Role::Driver {
        if let Some(configmap) = podbuilder::build_scenarios_configmap(loadtest) {
            let configmaps: Api<k8s_openapi::api::core::v1::ConfigMap> =
                Api::namespaced(ctx.client.clone(), &loadtest.namespace().unwrap_or_default());
            let _ = configmaps.create(&Default::default(), &configmap).await;
        }
    }

    pods_api.create(&Default::default(), &pod).await?;
    Ok(())
}

async fn patch_status(
    loadtests: &Api<LoadTest>,
    name: &str,
    status: &LoadTestStatus,
) -> std::result::Result<(), loadtest_operator::error::Error> {
    let patch = serde_json::json!({ "status": status });
    loadtests
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn is_owned_by(pod: &Pod, test_name: &str) -> bool {
    let Some(labels) = &pod.metadata.labels else {
        return false;
    };
    labels.get(LABEL_TEST).map(String::as_str) == Some(test_name)
        && labels.contains_key(LABEL_ROLE)
        && labels.contains_key(LABEL_COMPONENT)
}

fn error_policy(
    _loadtest: Arc<LoadTest>,
    error: &loadtest_operator::error::Error,
    _ctx: Arc<ReconcileContext>,
) -> Action {
    RECONCILE_ERRORS.inc();
    warn!(error = %error, "reconcile error");
    Action::requeue(Duration::from_secs(60))
}

/* ============================= HTTP ============================= */

async fn start_http_servers(
    state: Arc<Mutex<ReconcileState>>,
    mut shutdown: broadcast::Receiver<()>,
    metrics_addr: SocketAddr,
    health_addr: SocketAddr,
) -> Result<()> {
    let metrics_app = Router::new().route("/metrics", get(metrics_handler));
    let health_app = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get({
            let state = state.clone();
            move || readyz_handler(state.clone())
        }));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr)
        .await
        .context("failed to bind metrics server")?;
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .context("failed to bind health probe server")?;

    let mut metrics_shutdown = shutdown.resubscribe();
    let metrics_fut = axum::serve(metrics_listener, metrics_app).with_graceful_shutdown(async move {
        let _ = metrics_shutdown.recv().await;
    });
    let health_fut = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
    });

    let (a, b) = tokio::join!(metrics_fut, health_fut);
    a?;
    b?;
    Ok(())
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readyz_handler(state: Arc<Mutex<ReconcileState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer).and_then(|_| {
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }) {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= TESTS ============================= */
