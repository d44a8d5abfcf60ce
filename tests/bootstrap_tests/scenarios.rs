//! Stories of an operator bootstrapping clouds into one mesh

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crossmesh::cluster::AuthKind;
use crossmesh::config::RunConfig;
use crossmesh::driver::ExecutionDriver;
use crossmesh::error::BackendError;
use crossmesh::graph::NodeState;
use crossmesh::provider::BackendRegistry;
use crossmesh::result::RunStatus;

use super::fakes::{FakeCloud, FakeClusterApi, FakeInstaller};

const TWO_CLOUDS: &str = r#"
meshId: mesh1
verificationTimeoutSecs: 60
networkIds:
  cloudA: A-network
  cloudB: B-network
cloudTargets:
  - name: cluster-a
    cloud: cloudA
    region: region-1
    nodeCount: 2
    machineType: standard-4
    kubernetesVersion: "1.31"
  - name: cluster-b
    cloud: cloudB
    region: region-2
    nodeCount: 3
    machineType: standard-4
    kubernetesVersion: "1.31"
"#;

struct Harness {
    cloud_a: Arc<FakeCloud>,
    cloud_b: Arc<FakeCloud>,
    installer: Arc<FakeInstaller>,
    api: Arc<FakeClusterApi>,
    driver: ExecutionDriver,
}

fn harness(cloud_a: Arc<FakeCloud>, cloud_b: Arc<FakeCloud>, gateways_ready: bool) -> Harness {
    let installer = FakeInstaller::new();
    let api = FakeClusterApi::new(gateways_ready);
    let backends = BackendRegistry::new()
        .register("cloudA", cloud_a.clone())
        .register("cloudB", cloud_b.clone());
    let driver = ExecutionDriver::new(backends, installer.clone(), api.clone());
    Harness {
        cloud_a,
        cloud_b,
        installer,
        api,
        driver,
    }
}

fn config() -> RunConfig {
    RunConfig::from_yaml(TWO_CLOUDS).unwrap()
}

#[tokio::test(start_paused = true)]
async fn story_two_clouds_join_one_mesh_despite_slow_gateways() {
    let h = harness(FakeCloud::new(), FakeCloud::new(), false);

    let result = h
        .driver
        .bootstrap(&config(), CancellationToken::new())
        .await
        .unwrap();

    // Gateway readiness timed out on both clusters, which is best-effort
    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.branches.len(), 2);
    for branch in result.branches.values() {
        assert_eq!(branch.status, RunStatus::Succeeded);
        assert_eq!(branch.handle.as_ref().unwrap().auth, AuthKind::Token);
        assert_eq!(branch.mesh.control_plane_ready, NodeState::Succeeded);
        assert_eq!(branch.mesh.gateway_ready, NodeState::Failed);
    }

    let a = result.branch("cloudA").unwrap();
    assert_eq!(a.endpoint.as_deref(), Some("https://cluster-a.region-1.example"));
    assert_eq!(a.mesh.network, "A-network");
    assert_eq!(a.commands[1], "kubectl --context cluster-a get nodes");
    assert_eq!(result.branch("cloudB").unwrap().mesh.network, "B-network");

    // One mesh namespace per cluster, labeled with its network
    assert_eq!(h.api.namespace_count(), 2);
    assert_eq!(
        h.api.namespace_labels("cluster-b").unwrap()["topology.istio.io/network"],
        "B-network"
    );

    // Control planes share the mesh ID but keep their own network
    assert_eq!(
        h.installer.releases_on("cluster-a"),
        vec!["istio-base", "istiod", "istio-eastwestgateway"]
    );
    let istiod_b = h.installer.values_of("cluster-b", "istiod").unwrap();
    assert_eq!(istiod_b["global"]["meshID"], "mesh1");
    assert_eq!(istiod_b["global"]["network"], "B-network");

    // Each control plane can discover the other
    assert_eq!(
        h.api.remote_secrets(),
        vec![
            ("cluster-a".to_string(), "cluster-b".to_string()),
            ("cluster-b".to_string(), "cluster-a".to_string()),
        ]
    );
    assert!(result
        .trust_links
        .iter()
        .all(|l| l.state == NodeState::Succeeded));
}

#[tokio::test(start_paused = true)]
async fn story_quota_on_one_cloud_leaves_the_other_running() {
    let h = harness(
        FakeCloud::new(),
        FakeCloud::failing(BackendError::QuotaExceeded("CPUS in region-2".to_string())),
        true,
    );

    let result = h
        .driver
        .bootstrap(&config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);

    let a = result.branch("cloudA").unwrap();
    assert_eq!(a.status, RunStatus::Succeeded);
    assert_eq!(a.mesh.gateway_ready, NodeState::Succeeded);

    let b = result.branch("cloudB").unwrap();
    assert_eq!(b.status, RunStatus::Failed);
    let error = b.error.as_ref().unwrap();
    assert_eq!(error.node, "cloudB/cluster");
    assert_eq!(error.kind, "BackendError");
    assert!(error.message.contains("quota"));
    assert!(b.handle.is_none());
    assert_eq!(b.mesh.control_plane, NodeState::Skipped);
    assert!(h.installer.releases_on("cluster-b").is_empty());

    // A single ready cluster has no peer to trust
    assert!(result.trust_links.is_empty());
    assert!(h.api.remote_secrets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn story_rerun_adopts_existing_clusters() {
    let h = harness(FakeCloud::new(), FakeCloud::new(), true);
    let config = config();

    let first = h
        .driver
        .bootstrap(&config, CancellationToken::new())
        .await
        .unwrap();
    let second = h
        .driver
        .bootstrap(&config, CancellationToken::new())
        .await
        .unwrap();

    assert!(first.succeeded());
    assert!(second.succeeded());
    assert_eq!(h.cloud_a.creations(), 1);
    assert_eq!(h.cloud_b.creations(), 1);
    assert_eq!(
        first.branch("cloudA").unwrap().endpoint,
        second.branch("cloudA").unwrap().endpoint
    );
}

#[tokio::test(start_paused = true)]
async fn story_branch_finish_order_does_not_change_the_result() {
    let slow_a = harness(FakeCloud::slow(Duration::from_secs(600)), FakeCloud::new(), true);
    let slow_b = harness(FakeCloud::new(), FakeCloud::slow(Duration::from_secs(600)), true);

    let one = slow_a
        .driver
        .bootstrap(&config(), CancellationToken::new())
        .await
        .unwrap();
    let two = slow_b
        .driver
        .bootstrap(&config(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(one.status, two.status);
    for cloud in ["cloudA", "cloudB"] {
        let (x, y) = (one.branch(cloud).unwrap(), two.branch(cloud).unwrap());
        assert_eq!(x.status, y.status);
        assert_eq!(x.mesh, y.mesh);
        assert_eq!(x.endpoint, y.endpoint);
    }
    assert_eq!(one.trust_links.len(), two.trust_links.len());
}

#[tokio::test(start_paused = true)]
async fn story_strict_gateway_check_fails_both_branches() {
    let h = harness(FakeCloud::new(), FakeCloud::new(), false);
    let mut config = config();
    config.best_effort_proxy_check = false;

    let result = h
        .driver
        .bootstrap(&config, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    for branch in result.branches.values() {
        assert_eq!(branch.status, RunStatus::Failed);
        assert_eq!(branch.error.as_ref().unwrap().kind, "VerificationTimeout");
    }
    assert!(h.api.remote_secrets().is_empty());
}

#[tokio::test]
async fn story_cancelled_before_start_touches_nothing() {
    let h = harness(FakeCloud::new(), FakeCloud::new(), true);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h.driver.bootstrap(&config(), cancel).await.unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    for branch in result.branches.values() {
        assert!(branch.nodes.iter().all(|n| n.state == NodeState::Skipped));
    }
    assert_eq!(h.cloud_a.creations() + h.cloud_b.creations(), 0);
    assert_eq!(h.api.namespace_count(), 0);
    assert!(result.trust_links.is_empty());
}

#[tokio::test]
async fn story_invalid_config_is_rejected_before_any_cloud_call() {
    let h = harness(FakeCloud::new(), FakeCloud::new(), true);
    let mut config = config();
    config.network_ids.insert("cloudB".to_string(), "A-network".to_string());

    let err = h
        .driver
        .bootstrap(&config, CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(h.cloud_a.creations(), 0);
}
