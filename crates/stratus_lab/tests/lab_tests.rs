//! Integration tests for the lab topologies.
//!
//! Every topology runs against the simulated cloud, so these tests exercise
//! the full path from declaration through dependency-ordered provisioning to
//! exports and export sinks.

use std::fs;
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use stratus_core::{
    EdgeKind, ExecutionState, ExportSink, FileSink, NodeState, Outputs, RunReport, Stack,
};
use stratus_lab::{
    declare_aks, declare_eks, declare_rancher, declare_topology, simulated_registry,
    CapturedCall, EksConfig, LabConfig, RancherConfig, SimulatedCloud, Topology,
};

const AKS_RESOURCES: usize = 10;

fn stack(name: &str, cloud: &SimulatedCloud) -> Stack {
    Stack::new(name, Arc::new(simulated_registry(cloud)))
}

fn inputs<'a>(report: &'a RunReport, name: &str) -> &'a Outputs {
    report
        .node(name)
        .and_then(|node| node.inputs.as_ref())
        .unwrap_or_else(|| panic!("no inputs recorded for {}", name))
}

fn outputs<'a>(report: &'a RunReport, name: &str) -> &'a Outputs {
    report
        .node(name)
        .and_then(|node| node.outputs.as_ref())
        .unwrap_or_else(|| panic!("no outputs recorded for {}", name))
}

fn position(calls: &[CapturedCall], name: &str) -> usize {
    calls
        .iter()
        .position(|c| c.name == name)
        .unwrap_or_else(|| panic!("{} was never applied", name))
}

async fn run_aks(cloud: &SimulatedCloud, config: &LabConfig) -> RunReport {
    let mut stack = stack("aks-lab", cloud);
    declare_aks(&mut stack, config, None).unwrap();
    stack.run().await.unwrap()
}

/// Test the AKS lab provisions every resource and resolves all exports.
#[tokio::test(start_paused = true)]
async fn test_aks_lab_resolves_exports() {
    let cloud = SimulatedCloud::new().with_pending_polls(2);

    let report = run_aks(&cloud, &LabConfig::default()).await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.count(NodeState::Settled), AKS_RESOURCES);
    assert_eq!(report.export("aksName"), Some(&json!("aksCluster")));

    let kubeconfig = report.export("kubeConfig").and_then(Value::as_str).unwrap();
    assert!(kubeconfig.contains("server: https://aksCluster.hcp.azmk8s.io:443"));

    let ip = outputs(&report, "traefik")["loadBalancerIp"].as_str().unwrap().to_string();
    assert_eq!(
        report.export("ingressUrl"),
        Some(&json!(format!("http://pulumi-lab.{}.nip.io/", ip)))
    );
    assert_eq!(cloud.address_polls("traefik"), 3);
}

/// Test that outputs reach dependent inputs unchanged.
#[tokio::test(start_paused = true)]
async fn test_aks_outputs_feed_dependent_inputs() {
    let cloud = SimulatedCloud::new().with_pending_polls(1);

    let report = run_aks(&cloud, &LabConfig::default()).await;

    let subnet_id = &outputs(&report, "subnet")["id"];
    let cluster = inputs(&report, "aksCluster");
    assert_eq!(&cluster["agentPoolProfiles"][0]["vnetSubnetID"], subnet_id);
    assert_eq!(cluster["location"], json!("eastus"));

    let credentials = inputs(&report, "aksCredentials");
    assert_eq!(credentials["clusterName"], json!("aksCluster"));
    assert_eq!(
        inputs(&report, "k8sProvider")["kubeconfig"],
        outputs(&report, "aksCredentials")["kubeconfig"]
    );

    let provider_id = &outputs(&report, "k8sProvider")["id"];
    for workload in ["traefik", "rbroker-app", "rbroker-app-service", "app-ingress"] {
        assert_eq!(&inputs(&report, workload)["provider"], provider_id);
    }

    let rule = &inputs(&report, "app-ingress")["rules"][0];
    let ip = outputs(&report, "traefik")["loadBalancerIp"].as_str().unwrap();
    assert_eq!(rule["host"], json!(format!("pulumi-lab.{}.nip.io", ip)));
    assert_eq!(
        rule["http"]["paths"][0]["backend"]["service"]["name"],
        json!("rbroker-app-service")
    );
    assert!(!rule["host"].as_str().unwrap().to_lowercase().contains("pending"));
}

/// Test that resources are applied only after the resources they consume.
#[tokio::test(start_paused = true)]
async fn test_aks_applies_in_dependency_order() {
    let cloud = SimulatedCloud::new().with_pending_polls(1);

    run_aks(&cloud, &LabConfig::default()).await;

    let calls = cloud.calls_with("create");
    assert_eq!(calls.len(), AKS_RESOURCES);
    let chain = [
        "resourceGroup",
        "vnet",
        "subnet",
        "aksCluster",
        "aksCredentials",
        "k8sProvider",
        "traefik",
        "app-ingress",
    ];
    for pair in chain.windows(2) {
        assert!(
            position(&calls, pair[0]) < position(&calls, pair[1]),
            "{} applied after {}",
            pair[0],
            pair[1]
        );
    }
    assert!(position(&calls, "rbroker-app-service") < position(&calls, "app-ingress"));
}

/// Test a second run with identical settings converges without changes.
#[tokio::test(start_paused = true)]
async fn test_aks_second_run_is_idempotent() {
    let cloud = SimulatedCloud::new().with_pending_polls(1);

    let first = run_aks(&cloud, &LabConfig::default()).await;
    let second = run_aks(&cloud, &LabConfig::default()).await;

    assert!(second.is_success());
    assert_eq!(first.exports, second.exports);
    assert_eq!(cloud.calls_with("create").len(), AKS_RESOURCES);
    assert_eq!(cloud.calls_with("noop").len(), AKS_RESOURCES);
    assert!(cloud.calls_with("update").is_empty());
    assert_eq!(cloud.resource_count(), AKS_RESOURCES);
}

/// Test changing one setting only updates the resource that uses it.
#[tokio::test(start_paused = true)]
async fn test_aks_changed_message_updates_deployment_only() {
    let cloud = SimulatedCloud::new();
    run_aks(&cloud, &LabConfig::default()).await;

    let config = LabConfig {
        message: "Hello again".to_string(),
        ..LabConfig::default()
    };
    let report = run_aks(&cloud, &config).await;

    assert!(report.is_success());
    let updates: Vec<String> = cloud
        .calls_with("update")
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(updates, vec!["rbroker-app".to_string()]);

    let deployment = cloud.resource("deployment", "rbroker-app").unwrap();
    assert_eq!(deployment.generation, 2);
    assert_eq!(
        deployment.inputs["containers"][0]["env"][0]["value"],
        json!("Hello again")
    );
}

/// Test a cluster failure fails only the resources downstream of it.
#[tokio::test(start_paused = true)]
async fn test_aks_cluster_failure_is_isolated() {
    let cloud = SimulatedCloud::new();
    cloud.fail_on("aksCluster", "quota exceeded");
    let dir = TempDir::new().unwrap();
    let kubeconfig_path = dir.path().join("kubeconfig");

    let mut stack = stack("aks-lab", &cloud);
    let sink: Arc<dyn ExportSink> = Arc::new(FileSink::new(&kubeconfig_path).raw());
    declare_aks(&mut stack, &LabConfig::default(), Some(sink)).unwrap();
    let report = stack.run().await.unwrap();

    assert_eq!(report.state, ExecutionState::Failed);
    for upstream in ["resourceGroup", "vnet", "subnet"] {
        assert_eq!(report.node_state(upstream), Some(NodeState::Settled));
    }
    assert_eq!(report.count(NodeState::Failed), AKS_RESOURCES - 3);

    let roots = report.root_failures();
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0].resource, "aksCluster");

    let deployment = report.node("rbroker-app").unwrap();
    let error = deployment.error.as_ref().unwrap();
    assert!(error.is_dependency_failure());
    assert_eq!(error.origin(), Some("aksCluster"));
    assert!(!deployment.was_applied());

    assert!(report.exports.is_empty());
    assert!(report.unresolved_exports.contains_key("ingressUrl"));
    assert!(report.unresolved_exports.contains_key("kubeConfig"));
    assert!(!kubeconfig_path.exists());
    assert!(cloud.resource("managed-cluster", "aksCluster").is_none());
}

/// Test the EKS lab wires the namespace into its workloads and writes the
/// kubeconfig.
#[tokio::test(start_paused = true)]
async fn test_eks_lab_orders_workloads_and_writes_kubeconfig() {
    let cloud = SimulatedCloud::new().with_pending_polls(2);
    let dir = TempDir::new().unwrap();
    let kubeconfig_path = dir.path().join("eks-config");

    let mut stack = stack("eks-lab", &cloud);
    let sink: Arc<dyn ExportSink> = Arc::new(FileSink::new(&kubeconfig_path).indent(4));
    let lab = declare_eks(&mut stack, &EksConfig::default(), Some(sink)).unwrap();

    let graph = stack.graph();
    assert_eq!(graph.edge(lab.node_group.id(), lab.kubernetes.id()), None);
    assert_eq!(graph.edge(lab.cluster.id(), lab.kubernetes.id()), Some(EdgeKind::Data));
    assert_eq!(graph.edge(lab.namespace.id(), lab.deployment.id()), Some(EdgeKind::Data));
    assert_eq!(graph.edge(lab.namespace.id(), lab.service.id()), Some(EdgeKind::Data));
    assert_eq!(
        graph.edge(lab.deployment.id(), lab.service.id()),
        Some(EdgeKind::Ordering)
    );

    let report = stack.run().await.unwrap();

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.export("eksClusterName"), Some(&json!("eks-lab")));
    let dns = report.export("loadBalancerDns").and_then(Value::as_str).unwrap();
    assert!(dns.starts_with("app-service-"));
    assert!(dns.ends_with(".elb.amazonaws.com"));

    let calls = cloud.calls_with("create");
    assert!(position(&calls, "pulumi-app-ns") < position(&calls, "app-deployment"));
    assert!(position(&calls, "app-deployment") < position(&calls, "app-service"));

    let node_group = inputs(&report, "eks-nodegroup");
    assert_eq!(node_group["nodeGroupName"], json!("eks-ng"));
    assert_eq!(
        node_group["nodeRoleArn"],
        outputs(&report, "eks-lab")["instanceRoleArn"]
    );
    assert_eq!(inputs(&report, "app-deployment")["namespace"], json!("pulumi-app"));
    assert_eq!(inputs(&report, "app-service")["namespace"], json!("pulumi-app"));

    let content = fs::read_to_string(&kubeconfig_path).unwrap();
    assert!(content.starts_with("{\n    \""));
    let written: Value = serde_json::from_str(&content).unwrap();
    assert_eq!(Some(&written), report.export("kubeconfig"));
    assert_eq!(written["clusters"][0]["name"], json!("eks-lab"));
}

/// Test the Rancher lab exports its fixed ingress URL.
#[tokio::test]
async fn test_rancher_lab_exports() {
    let cloud = SimulatedCloud::new();

    let mut stack = stack("rancher-lab", &cloud);
    declare_rancher(&mut stack, &RancherConfig::default()).unwrap();
    let report = stack.run().await.unwrap();

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.export("namespace"), Some(&json!("pulumi-app")));
    assert_eq!(report.export("serviceName"), Some(&json!("pulumi-app")));
    assert_eq!(
        report.export("ingressUrl"),
        Some(&json!("http://pulumi.lab.192.168.17.11.nip.io"))
    );

    let ingress = inputs(&report, "ingress");
    assert_eq!(
        ingress["annotations"]["kubernetes.io/ingress.class"],
        json!("traefik")
    );
    assert!(ingress.get("ingressClassName").is_none());
    assert_eq!(ingress["namespace"], json!("pulumi-app"));
    assert_eq!(inputs(&report, "deployment")["replicas"], json!(2));
}

/// Test settings files and kubeconfig output through the topology entry point.
#[tokio::test(start_paused = true)]
async fn test_declare_topology_from_settings_file() {
    let dir = TempDir::new().unwrap();
    let settings = dir.path().join("lab.yaml");
    fs::write(&settings, "location: westeurope\nnodeCount: 3\n").unwrap();
    let kubeconfig_path = dir.path().join("kubeconfig");

    let cloud = SimulatedCloud::new();
    let mut stack = stack(Topology::Aks.stack_name(), &cloud);
    declare_topology(
        &mut stack,
        Topology::Aks,
        Some(settings.as_path()),
        Some(kubeconfig_path.as_path()),
    )
    .unwrap();
    let report = stack.run().await.unwrap();

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(inputs(&report, "vnet")["location"], json!("westeurope"));
    assert_eq!(
        inputs(&report, "aksCluster")["agentPoolProfiles"][0]["count"],
        json!(3)
    );

    let written = fs::read_to_string(&kubeconfig_path).unwrap();
    assert_eq!(Some(&json!(written)), report.export("kubeConfig"));
}

/// Test the report of a lab run survives a save and load.
#[tokio::test]
async fn test_rancher_report_persists() {
    let cloud = SimulatedCloud::new();
    let mut stack = stack("rancher-lab", &cloud);
    declare_rancher(&mut stack, &RancherConfig::default()).unwrap();
    let report = stack.run().await.unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("report.json");
    report.save(&path).unwrap();
    let loaded = RunReport::load(&path).unwrap();

    assert_eq!(loaded.run_id, report.run_id);
    assert_eq!(loaded.state, ExecutionState::Completed);
    assert_eq!(loaded.exports, report.exports);
    assert_eq!(loaded.nodes.len(), 4);
}
