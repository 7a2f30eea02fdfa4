use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use loadtest_operator::cleanup as cleanup_core;
use loadtest_operator::crd::{LoadTest, LABEL_COMPONENT, LABEL_ROLE, LABEL_TEST};

use loadtest_operator::leader;

const HOLDER_IDENTITY: &str = "loadtest-cleanup";
const LEASE_NAME: &str = "loadtest-cleanup-leader";
const POLL_INTERVAL: Duration = Duration::from_secs(15);

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static CLEANUP_TICKS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("loadtest_cleanup_ticks_total", "Total cleanup agent ticks")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static QUIT_WORKER_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("loadtest_cleanup_quit_worker_sent_total", "Total QuitWorker RPCs sent")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

struct CleanupState {
    ready: bool,
}

pub struct Options {
    pub namespace: Option<String>,
    pub metrics_bind_address: SocketAddr,
    pub health_probe_bind_address: SocketAddr,
    pub leader_elect: bool,
}

/// Polls terminated `LoadTest`s and signals their still-running workers to
/// quit (spec.md §4.4). Implemented as a polling loop rather than a watch
/// `Controller`, since cleanup has no SLA tighter than `POLL_INTERVAL`.
pub async fn run(opts: Options) -> Result<()> {
    let client = Client::try_default().await.context("failed to load kubeconfig")?;

    if opts.leader_elect {
        let lease_namespace = opts.namespace.clone().unwrap_or_else(|| "default".to_string());
        if !leader::acquire(&client, &lease_namespace, LEASE_NAME, HOLDER_IDENTITY).await? {
            info!("not leader, standing by");
            return wait_and_retry(client, lease_namespace).await;
        }
        spawn_lease_renewal(client.clone(), lease_namespace);
    }

    LazyLock::force(&CLEANUP_TICKS);
    LazyLock::force(&QUIT_WORKER_SENT);

    let state = Arc::new(Mutex::new(CleanupState { ready: true }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();
    let metrics_addr = opts.metrics_bind_address;
    let health_addr = opts.health_probe_bind_address;
    let http_state = state.clone();
    let http_handle =
        tokio::spawn(async move { start_http_servers(http_state, http_shutdown, metrics_addr, health_addr).await });

    let loadtests: Api<LoadTest> = match &opts.namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("cleanup agent started");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                CLEANUP_TICKS.inc();
                if let Err(e) = tick(&client, &loadtests).await {
                    warn!(error = %e, "cleanup tick failed");
                }
            }
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    Ok(())
}

async fn tick(client: &Client, loadtests: &Api<LoadTest>) -> Result<()> {
    for loadtest in loadtests.list(&ListParams::default()).await?.items {
        let Some(status) = &loadtest.status else { continue };
        if !status.state.is_terminal() {
            continue;
        }

        let namespace = loadtest.namespace().unwrap_or_default();
        let test_name = loadtest.name_any();
        let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let owned: Vec<Pod> = pods
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|p| is_owned_by(p, &test_name))
            .collect();

        let before = cleanup_core::select_cleanup_targets(&loadtest, &owned).len();
        cleanup_core::run_cleanup(&loadtest, &owned).await;
        QUIT_WORKER_SENT.inc_by(before as u64);
    }
    Ok(())
}

fn is_owned_by(pod: &Pod, test_name: &str) -> bool {
    let Some(labels) = &pod.metadata.labels else { return false };
    labels.get(LABEL_TEST).map(String::as_str) == Some(test_name)
        && labels.contains_key(LABEL_ROLE)
        && labels.contains_key(LABEL_COMPONENT)
}

async fn wait_and_retry(client: Client, lease_namespace: String) -> Result<()> {
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(leader::RENEW_INTERVAL) => {
                if leader::acquire(&client, &lease_namespace, LEASE_NAME, HOLDER_IDENTITY).await.unwrap_or(false) {
                    return Ok(());
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

async fn start_http_servers(
    state: Arc<Mutex<CleanupState>>,
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

async fn readyz_handler(state: Arc<Mutex<CleanupState>>) -> impl IntoResponse {
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

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_is_owned_by_matches_full_label_triple() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TEST.to_string(), "bench-1".to_string());
        labels.insert(LABEL_ROLE.to_string(), "server".to_string());
        labels.insert(LABEL_COMPONENT.to_string(), "server-0".to_string());
        let pod = Pod {
            metadata: ObjectMeta { labels: Some(labels), ..Default::default() },
            spec: None,
            status: None,
        };
        assert!(is_owned_by(&pod, "bench-1"));
        assert!(!is_owned_by(&pod, "bench-2"));
    }
}
