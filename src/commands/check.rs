use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};
use loadtest_operator::crd::LoadTest;

struct CheckOutcome {
    label: &'static str,
    detail: String,
    passed: bool,
}

impl CheckOutcome {
    fn ok(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, detail: detail.into(), passed: true }
    }

    fn fail(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, detail: detail.into(), passed: false }
    }
}

/// Probes the things the operator needs at startup (a reachable apiserver,
/// RBAC for its own watches) and prints a pass/fail report.
pub async fn run() -> anyhow::Result<()> {
    let client = Client::try_default().await.map_err(|e| {
        anyhow::anyhow!("no usable kubeconfig found ({e}) — set KUBECONFIG or run inside a cluster")
    })?;

    let mut outcomes = Vec::new();

    let server_version = match client.apiserver_version().await {
        Ok(v) => {
            outcomes.push(CheckOutcome::ok("apiserver reachable", format!("v{}.{}", v.major, v.minor)));
            Some(v)
        }
        Err(e) => {
            outcomes.push(CheckOutcome::fail("apiserver reachable", e.to_string()));
            None
        }
    };

    if server_version.is_some() {
        let loadtests: Api<LoadTest> = Api::all(client.clone());
        outcomes.push(match loadtests.list(&ListParams::default().limit(1)).await {
            Ok(list) => CheckOutcome::ok("watch LoadTests (reconciler)", format!("{} item(s) visible", list.items.len())),
            Err(e) => CheckOutcome::fail("watch LoadTests (reconciler)", e.to_string()),
        });

        let nodes: Api<Node> = Api::all(client.clone());
        outcomes.push(match nodes.list(&ListParams::default()).await {
            Ok(list) => CheckOutcome::ok("watch nodes (scheduling awareness)", format!("{} item(s) visible", list.items.len())),
            Err(e) => CheckOutcome::fail("watch nodes (scheduling awareness)", e.to_string()),
        });
    }

    print_report(&outcomes);

    if outcomes.iter().any(|o| !o.passed) {
        anyhow::bail!("one or more checks failed; see above");
    }
    Ok(())
}

fn print_report(outcomes: &[CheckOutcome]) {
    let widest = outcomes.iter().map(|o| o.label.len()).max().unwrap_or(0);
    println!("cluster preflight:");
    for outcome in outcomes {
        let mark = if outcome.passed { "pass" } else { "FAIL" };
        println!("  [{mark}] {:<widest$}  {}", outcome.label, outcome.detail, widest = widest);
    }
}
