use anyhow::Context;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use loadtest_operator::crd::LoadTest;

pub async fn run(namespace: Option<&str>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to connect to Kubernetes cluster; is your kubeconfig valid?")?;

    let loadtests: Api<LoadTest> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let list = loadtests
        .list(&ListParams::default())
        .await
        .context("failed to list LoadTests, check RBAC permissions")?;

    let now = chrono::Utc::now();

    let mut rows: Vec<(String, String, String, String)> = list
        .into_iter()
        .map(|lt| {
            let namespace = lt.namespace().unwrap_or_default();
            let name = lt.name_any();
            let state = lt
                .status
                .as_ref()
                .map(|s| format!("{:?}", s.state))
                .unwrap_or_else(|| "Unknown".to_string());
            let age = lt
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| format_age(now.signed_duration_since(t.0)))
                .unwrap_or_else(|| "<unknown>".to_string());
            (namespace, name, state, age)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!("{:<20} {:<40} {:<14} {:<10}", "NAMESPACE", "NAME", "STATE", "AGE");
    println!("{}", "-".repeat(86));
    for (namespace, name, state, age) in &rows {
        println!("{namespace:<20} {name:<40} {state:<14} {age:<10}");
    }
    println!("\nTotal: {} loadtests", rows.len());

    Ok(())
}

fn format_age(d: chrono::Duration) -> String {
    let secs = d.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
