//! Best-effort leader election via a raw `coordination.k8s.io/v1` `Lease`
//! (spec.md §5), so only one replica of a reconciler is active at a time.
//! Non-leaders poll on a fixed interval and never start their `Controller`.

use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{self, Utc};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::info;

pub const LEASE_DURATION_SECONDS: i32 = 15;
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts to acquire or take over `lease_name` in `namespace` under
/// `holder_identity`. Returns `true` if this process holds the lease
/// afterward.
pub async fn acquire(
    client: &Client,
    namespace: &str,
    lease_name: &str,
    holder_identity: &str,
) -> Result<bool> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);
    let now = MicroTime(Utc::now());

    let lease = Lease {
        metadata: kube::api::ObjectMeta {
            name: Some(lease_name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(holder_identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    };

    match leases.create(&Default::default(), &lease).await {
        Ok(_) => return Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!(lease = %lease_name, "lease exists, checking expiry");
        }
        Err(e) => return Err(e.into()),
    }

    let existing = leases.get(lease_name).await?;

    let can_take = match &existing.spec {
        Some(spec) => {
            let is_ours = spec.holder_identity.as_deref() == Some(holder_identity);
            let is_expired = spec.renew_time.as_ref().is_none_or(|t| {
                let duration_secs = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
                Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(duration_secs)
            });
            is_ours || is_expired
        }
        None => true,
    };

    if !can_take {
        return Ok(false);
    }

    info!(lease = %lease_name, "taking over lease");
    let now = MicroTime(Utc::now());
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": holder_identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": now,
            "renewTime": now,
        }
    });

    leases
        .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(true)
}

/// Renews an already-held lease. Call on `RENEW_INTERVAL`; on failure the
/// caller should re-run `acquire` to check whether leadership was lost.
pub async fn renew(client: &Client, namespace: &str, lease_name: &str, holder_identity: &str) -> Result<()> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), namespace);
    let now = MicroTime(Utc::now());
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": holder_identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "renewTime": now,
        }
    });
    leases
        .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
