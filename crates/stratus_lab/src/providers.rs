//! Simulated cloud providers.
//!
//! Every resource type used by the lab topologies is backed by one in-memory
//! [`SimulatedCloud`]. Providers converge the way real ones do: applying the
//! same inputs twice leaves the stored resource unchanged, different inputs
//! update it. All calls are captured so tests can verify what ran, and
//! failures can be injected per resource name.
//!
//! Load balancer addresses start out "Pending" for a configurable number of
//! polls, so charts and services exposing one have to re-poll before they
//! can report an address.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::debug;

use stratus_core::{
    poll_until, ApplyRequest, CoreError, CoreResult, Outputs, PollConfig, Probe, Provider,
    ProviderRegistry, ResourceSchema,
};

const SUBSCRIPTION: &str = "/subscriptions/00000000-0000-0000-0000-000000000000";

/// Captured provider call information for verification.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCall {
    /// `create`, `update`, `noop` or `read`
    pub method: String,
    pub type_tag: String,
    pub name: String,
    pub inputs: Outputs,
}

/// A resource as stored by the simulated cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    pub inputs: Outputs,
    pub outputs: Outputs,
    /// Incremented on every update
    pub generation: u32,
}

#[derive(Default)]
struct CloudState {
    resources: BTreeMap<(String, String), StoredResource>,
    calls: Vec<CapturedCall>,
    failures: HashMap<String, String>,
    address_polls: HashMap<String, u32>,
}

/// In-memory stand-in for the remote cloud and cluster APIs.
#[derive(Clone)]
pub struct SimulatedCloud {
    state: Arc<RwLock<CloudState>>,
    /// Polls answered with "Pending" before an address is allocated.
    pending_polls: u32,
    poll: PollConfig,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CloudState::default())),
            pending_polls: 0,
            poll: PollConfig::default(),
        }
    }

    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Make every apply of `name` fail with `message`.
    pub fn fail_on(&self, name: impl Into<String>, message: impl Into<String>) {
        self.state.write().failures.insert(name.into(), message.into());
    }

    pub fn clear_failure(&self, name: &str) {
        self.state.write().failures.remove(name);
    }

    pub fn calls(&self) -> Vec<CapturedCall> {
        self.state.read().calls.clone()
    }

    /// Captured calls with a given method.
    pub fn calls_with(&self, method: &str) -> Vec<CapturedCall> {
        self.state
            .read()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    pub fn resource(&self, type_tag: &str, name: &str) -> Option<StoredResource> {
        self.state
            .read()
            .resources
            .get(&(type_tag.to_string(), name.to_string()))
            .cloned()
    }

    pub fn resource_count(&self) -> usize {
        self.state.read().resources.len()
    }

    /// Number of address probes answered so far for `name`.
    pub fn address_polls(&self, name: &str) -> u32 {
        self.state
            .read()
            .address_polls
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn check_failure(&self, name: &str) -> CoreResult<()> {
        match self.state.read().failures.get(name) {
            Some(message) => Err(CoreError::provider(name, message.clone())),
            None => Ok(()),
        }
    }

    fn record(state: &mut CloudState, method: &str, request: &ApplyRequest) {
        state.calls.push(CapturedCall {
            method: method.to_string(),
            type_tag: request.type_tag.clone(),
            name: request.name.clone(),
            inputs: request.inputs.clone(),
        });
    }

    /// Stored outputs, if the resource exists with identical inputs.
    fn unchanged(&self, request: &ApplyRequest) -> Option<Outputs> {
        let mut state = self.state.write();
        let key = (request.type_tag.clone(), request.name.clone());
        let outputs = state
            .resources
            .get(&key)
            .filter(|stored| stored.inputs == request.inputs)
            .map(|stored| stored.outputs.clone())?;
        Self::record(&mut state, "noop", request);
        Some(outputs)
    }

    fn store(&self, request: &ApplyRequest, outputs: Outputs) -> &'static str {
        let mut state = self.state.write();
        let key = (request.type_tag.clone(), request.name.clone());
        let method = match state.resources.get_mut(&key) {
            Some(stored) => {
                stored.inputs = request.inputs.clone();
                stored.outputs = outputs;
                stored.generation += 1;
                "update"
            }
            None => {
                state.resources.insert(
                    key,
                    StoredResource {
                        inputs: request.inputs.clone(),
                        outputs,
                        generation: 1,
                    },
                );
                "create"
            }
        };
        Self::record(&mut state, method, request);
        method
    }

    /// What the load balancer in front of `name` currently reports.
    fn probe_address(&self, name: &str) -> String {
        let mut state = self.state.write();
        let polls = state.address_polls.entry(name.to_string()).or_insert(0);
        *polls += 1;
        if *polls <= self.pending_polls {
            "Pending".to_string()
        } else {
            address_for(name)
        }
    }

    fn find(&self, type_tag: &str, id: &str) -> Option<Outputs> {
        self.state
            .read()
            .resources
            .iter()
            .filter(|((tag, _), _)| tag == type_tag)
            .find(|((_, name), stored)| {
                name == id || stored.outputs.get("id").and_then(Value::as_str) == Some(id)
            })
            .map(|(_, stored)| stored.outputs.clone())
    }
}

/// Resource types understood by the simulated cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ResourceGroup,
    VirtualNetwork,
    Subnet,
    ManagedCluster,
    ClusterCredentials,
    KubernetesProvider,
    HelmChart,
    Namespace,
    Deployment,
    Service,
    Ingress,
    EksCluster,
    NodeGroup,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 13] = [
        ResourceKind::ResourceGroup,
        ResourceKind::VirtualNetwork,
        ResourceKind::Subnet,
        ResourceKind::ManagedCluster,
        ResourceKind::ClusterCredentials,
        ResourceKind::KubernetesProvider,
        ResourceKind::HelmChart,
        ResourceKind::Namespace,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::EksCluster,
        ResourceKind::NodeGroup,
    ];

    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "resource-group",
            Self::VirtualNetwork => "virtual-network",
            Self::Subnet => "subnet",
            Self::ManagedCluster => "managed-cluster",
            Self::ClusterCredentials => "cluster-credentials",
            Self::KubernetesProvider => "kubernetes-provider",
            Self::HelmChart => "helm-chart",
            Self::Namespace => "namespace",
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::Ingress => "ingress",
            Self::EksCluster => "eks-cluster",
            Self::NodeGroup => "node-group",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::ResourceGroup => "Azure resource group",
            Self::VirtualNetwork => "Azure virtual network",
            Self::Subnet => "Subnet of a virtual network",
            Self::ManagedCluster => "AKS managed cluster",
            Self::ClusterCredentials => "User kubeconfig of a managed cluster",
            Self::KubernetesProvider => "Kubernetes API connection",
            Self::HelmChart => "Helm chart release",
            Self::Namespace => "Kubernetes namespace",
            Self::Deployment => "Kubernetes deployment",
            Self::Service => "Kubernetes service",
            Self::Ingress => "Kubernetes ingress",
            Self::EksCluster => "EKS cluster",
            Self::NodeGroup => "EKS managed node group",
        }
    }

    pub fn schema(&self) -> ResourceSchema {
        let s = ResourceSchema::new();
        match self {
            Self::ResourceGroup => s
                .require("resourceGroupName")
                .require("location")
                .output("id")
                .output("name")
                .output("location"),
            Self::VirtualNetwork => s
                .require("resourceGroupName")
                .require("location")
                .require("addressSpace")
                .output("id")
                .output("name"),
            Self::Subnet => s
                .require("resourceGroupName")
                .require("virtualNetworkName")
                .require("addressPrefix")
                .output("id")
                .output("name"),
            Self::ManagedCluster => s
                .require("resourceGroupName")
                .require("location")
                .require("dnsPrefix")
                .require("agentPoolProfiles")
                .optional("identity")
                .optional("enableRbac")
                .optional("networkProfile")
                .output("id")
                .output("name")
                .output("fqdn"),
            Self::ClusterCredentials => s
                .require("resourceGroupName")
                .require("clusterName")
                .output("kubeconfig"),
            Self::KubernetesProvider => s.require("kubeconfig").output("id"),
            Self::HelmChart => s
                .require("chart")
                .require("version")
                .require("repo")
                .require("namespace")
                .optional("values")
                .optional("provider")
                .output("status")
                .output("loadBalancerIp"),
            Self::Namespace => s.require("name").optional("provider").output("name"),
            Self::Deployment => s
                .require("name")
                .require("replicas")
                .require("labels")
                .require("containers")
                .optional("namespace")
                .optional("provider")
                .output("name")
                .output("namespace"),
            Self::Service => s
                .require("name")
                .require("selector")
                .require("ports")
                .optional("namespace")
                .optional("type")
                .optional("labels")
                .optional("provider")
                .output("name")
                .output("namespace")
                .output("hostname"),
            Self::Ingress => s
                .require("name")
                .require("rules")
                .optional("namespace")
                .optional("annotations")
                .optional("provider")
                .output("name")
                .output("host"),
            Self::EksCluster => s
                .require("name")
                .require("instanceType")
                .require("desiredCapacity")
                .require("minSize")
                .require("maxSize")
                .optional("region")
                .output("name")
                .output("kubeconfig")
                .output("instanceRoleArn"),
            Self::NodeGroup => s
                .require("clusterName")
                .require("nodeGroupName")
                .require("nodeRoleArn")
                .require("instanceTypes")
                .require("desiredSize")
                .require("minSize")
                .require("maxSize")
                .output("name"),
        }
    }
}

/// Provider for one [`ResourceKind`], backed by a [`SimulatedCloud`].
pub struct SimulatedProvider {
    kind: ResourceKind,
    cloud: SimulatedCloud,
}

impl SimulatedProvider {
    pub fn new(kind: ResourceKind, cloud: SimulatedCloud) -> Self {
        Self { kind, cloud }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Poll until the load balancer for `name` has an address.
    async fn await_address(&self, name: &str) -> CoreResult<String> {
        poll_until(name, &self.cloud.poll, || {
            let reported = self.cloud.probe_address(name);
            async move { CoreResult::Ok(Probe::from_reported(Some(reported.as_str()), "pending")) }
        })
        .await
    }

    async fn derive_outputs(&self, request: &ApplyRequest) -> CoreResult<Outputs> {
        let name = request.name.as_str();
        let outputs = match self.kind {
            ResourceKind::ResourceGroup => {
                let rg = request.str_input("resourceGroupName")?;
                record([
                    ("id", json!(resource_group_id(rg))),
                    ("name", json!(rg)),
                    ("location", json!(request.str_input("location")?)),
                ])
            }
            ResourceKind::VirtualNetwork => {
                let rg = request.str_input("resourceGroupName")?;
                record([
                    (
                        "id",
                        json!(format!(
                            "{}/providers/Microsoft.Network/virtualNetworks/{}",
                            resource_group_id(rg),
                            name
                        )),
                    ),
                    ("name", json!(name)),
                ])
            }
            ResourceKind::Subnet => {
                let rg = request.str_input("resourceGroupName")?;
                let vnet = request.str_input("virtualNetworkName")?;
                record([
                    (
                        "id",
                        json!(format!(
                            "{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
                            resource_group_id(rg),
                            vnet,
                            name
                        )),
                    ),
                    ("name", json!(name)),
                ])
            }
            ResourceKind::ManagedCluster => {
                let rg = request.str_input("resourceGroupName")?;
                let location = request.str_input("location")?;
                let dns_prefix = request.str_input("dnsPrefix")?;
                record([
                    (
                        "id",
                        json!(format!(
                            "{}/providers/Microsoft.ContainerService/managedClusters/{}",
                            resource_group_id(rg),
                            name
                        )),
                    ),
                    ("name", json!(name)),
                    ("fqdn", json!(format!("{}.hcp.{}.azmk8s.io", dns_prefix, location))),
                ])
            }
            ResourceKind::ClusterCredentials => {
                let cluster = request.str_input("clusterName")?;
                let server = format!("https://{}.hcp.azmk8s.io:443", cluster);
                record([("kubeconfig", json!(kubeconfig_yaml(cluster, &server)))])
            }
            ResourceKind::KubernetesProvider => {
                let kubeconfig = match request.inputs.get("kubeconfig") {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                record([(
                    "id",
                    json!(format!("{}::{:08x}", name, fingerprint(&kubeconfig))),
                )])
            }
            ResourceKind::HelmChart => {
                let exposes_lb = request
                    .inputs
                    .get("values")
                    .and_then(|v| v.pointer("/service/type"))
                    .and_then(Value::as_str)
                    == Some("LoadBalancer");
                let ip = if exposes_lb {
                    json!(self.await_address(name).await?)
                } else {
                    Value::Null
                };
                record([("status", json!("deployed")), ("loadBalancerIp", ip)])
            }
            ResourceKind::Namespace => record([("name", json!(request.str_input("name")?))]),
            ResourceKind::Deployment => record([
                ("name", json!(request.str_input("name")?)),
                ("namespace", json!(namespace_of(request))),
            ]),
            ResourceKind::Service => {
                let service = request.str_input("name")?;
                let hostname = match request.inputs.get("type").and_then(Value::as_str) {
                    Some("LoadBalancer") => {
                        let ip = self.await_address(name).await?;
                        json!(format!("{}-{}.elb.amazonaws.com", service, ip.replace('.', "-")))
                    }
                    _ => Value::Null,
                };
                record([
                    ("name", json!(service)),
                    ("namespace", json!(namespace_of(request))),
                    ("hostname", hostname),
                ])
            }
            ResourceKind::Ingress => {
                let host = request
                    .inputs
                    .get("rules")
                    .and_then(|rules| rules.pointer("/0/host"))
                    .cloned()
                    .ok_or_else(|| CoreError::provider(name, "ingress has no host rule"))?;
                record([("name", json!(request.str_input("name")?)), ("host", host)])
            }
            ResourceKind::EksCluster => {
                let cluster = request.str_input("name")?;
                let server = format!("https://{}.gr7.eks.amazonaws.com", cluster);
                record([
                    ("name", json!(cluster)),
                    ("kubeconfig", kubeconfig_object(cluster, &server)),
                    (
                        "instanceRoleArn",
                        json!(format!("arn:aws:iam::000000000000:role/{}-instance-role", cluster)),
                    ),
                ])
            }
            ResourceKind::NodeGroup => {
                record([("name", json!(request.str_input("nodeGroupName")?))])
            }
        };
        Ok(outputs)
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn type_tag(&self) -> &str {
        self.kind.type_tag()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    fn schema(&self) -> ResourceSchema {
        self.kind.schema()
    }

    async fn apply(&self, request: &ApplyRequest) -> CoreResult<Outputs> {
        self.cloud.check_failure(&request.name)?;
        if let Some(outputs) = self.cloud.unchanged(request) {
            debug!("{} '{}' unchanged", request.type_tag, request.name);
            return Ok(outputs);
        }

        let outputs = self.derive_outputs(request).await?;
        let method = self.cloud.store(request, outputs.clone());
        debug!("{} {} '{}'", method, request.type_tag, request.name);
        Ok(outputs)
    }

    async fn read(&self, id: &str) -> CoreResult<Outputs> {
        self.cloud
            .find(self.kind.type_tag(), id)
            .ok_or_else(|| CoreError::NotFound(format!("{} '{}'", self.kind.type_tag(), id)))
    }
}

/// A registry holding a simulated provider for every [`ResourceKind`].
pub fn simulated_registry(cloud: &SimulatedCloud) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for kind in ResourceKind::ALL {
        registry.register(Arc::new(SimulatedProvider::new(kind, cloud.clone())));
    }
    registry
}

fn record<const N: usize>(fields: [(&str, Value); N]) -> Outputs {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn resource_group_id(name: &str) -> String {
    format!("{}/resourceGroups/{}", SUBSCRIPTION, name)
}

fn namespace_of(request: &ApplyRequest) -> String {
    request
        .inputs
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string()
}

/// Deterministic public address for a load balancer.
fn address_for(name: &str) -> String {
    let fp = fingerprint(name);
    format!("20.{}.{}.{}", 40 + (fp >> 16) % 200, (fp >> 8) % 256, 1 + fp % 254)
}

fn fingerprint(text: &str) -> u32 {
    text.bytes()
        .fold(2166136261u32, |acc, b| (acc ^ b as u32).wrapping_mul(16777619))
}

fn kubeconfig_yaml(cluster: &str, server: &str) -> String {
    format!(
        "apiVersion: v1\nkind: Config\nclusters:\n- name: {cluster}\n  cluster:\n    server: {server}\ncontexts:\n- name: {cluster}\n  context:\n    cluster: {cluster}\n    user: clusterUser_{cluster}\ncurrent-context: {cluster}\nusers:\n- name: clusterUser_{cluster}\n  user:\n    token: simulated\n",
        cluster = cluster,
        server = server
    )
}

fn kubeconfig_object(cluster: &str, server: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": cluster, "cluster": {"server": server}}],
        "contexts": [{"name": "aws", "context": {"cluster": cluster, "user": "aws"}}],
        "current-context": "aws",
        "users": [{"name": "aws", "user": {"exec": {"command": "aws", "args": ["eks", "get-token", "--cluster-name", cluster]}}}],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(type_tag: &str, name: &str, inputs: Value) -> ApplyRequest {
        let inputs = match inputs {
            Value::Object(map) => map,
            _ => Outputs::new(),
        };
        ApplyRequest::new(name, type_tag, inputs)
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let cloud = SimulatedCloud::new();
        let provider = SimulatedProvider::new(ResourceKind::ResourceGroup, cloud.clone());
        let req = request(
            "resource-group",
            "resourceGroup",
            json!({"resourceGroupName": "lab-rg", "location": "eastus"}),
        );

        let first = provider.apply(&req).await.unwrap();
        let second = provider.apply(&req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cloud.calls_with("create").len(), 1);
        assert_eq!(cloud.calls_with("noop").len(), 1);
        assert_eq!(
            cloud.resource("resource-group", "resourceGroup").unwrap().generation,
            1
        );
    }

    #[tokio::test]
    async fn test_changed_inputs_update() {
        let cloud = SimulatedCloud::new();
        let provider = SimulatedProvider::new(ResourceKind::ResourceGroup, cloud.clone());

        provider
            .apply(&request(
                "resource-group",
                "rg",
                json!({"resourceGroupName": "lab-rg", "location": "eastus"}),
            ))
            .await
            .unwrap();
        let updated = provider
            .apply(&request(
                "resource-group",
                "rg",
                json!({"resourceGroupName": "lab-rg", "location": "westeurope"}),
            ))
            .await
            .unwrap();

        assert_eq!(updated["location"], json!("westeurope"));
        assert_eq!(cloud.resource("resource-group", "rg").unwrap().generation, 2);
        assert_eq!(cloud.resource_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let cloud = SimulatedCloud::new();
        cloud.fail_on("vnet", "address space overlaps");
        let provider = SimulatedProvider::new(ResourceKind::VirtualNetwork, cloud.clone());
        let req = request(
            "virtual-network",
            "vnet",
            json!({"resourceGroupName": "lab-rg", "location": "eastus", "addressSpace": {}}),
        );

        let err = provider.apply(&req).await.unwrap_err();
        assert_eq!(err, CoreError::provider("vnet", "address space overlaps"));
        assert!(cloud.calls().is_empty());

        cloud.clear_failure("vnet");
        assert!(provider.apply(&req).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_chart_waits_for_load_balancer_address() {
        let cloud = SimulatedCloud::new()
            .with_pending_polls(2)
            .with_poll_config(PollConfig::new(
                std::time::Duration::from_secs(5),
                std::time::Duration::from_secs(60),
            ));
        let provider = SimulatedProvider::new(ResourceKind::HelmChart, cloud.clone());
        let req = request(
            "helm-chart",
            "traefik",
            json!({
                "chart": "traefik",
                "version": "21.0.0",
                "repo": "https://traefik.github.io/charts",
                "namespace": "kube-system",
                "values": {"service": {"type": "LoadBalancer"}},
            }),
        );

        let outputs = provider.apply(&req).await.unwrap();

        assert_eq!(cloud.address_polls("traefik"), 3);
        assert_eq!(outputs["loadBalancerIp"], json!(address_for("traefik")));
    }

    #[tokio::test]
    async fn test_read_by_id_or_name() {
        let cloud = SimulatedCloud::new();
        let provider = SimulatedProvider::new(ResourceKind::Namespace, cloud.clone());
        provider
            .apply(&request("namespace", "pulumi-app-ns", json!({"name": "pulumi-app"})))
            .await
            .unwrap();

        let outputs = provider.read("pulumi-app-ns").await.unwrap();
        assert_eq!(outputs["name"], json!("pulumi-app"));
        assert!(matches!(
            provider.read("missing").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_registry_covers_every_kind() {
        let registry = simulated_registry(&SimulatedCloud::new());
        assert_eq!(registry.len(), ResourceKind::ALL.len());
        assert!(registry.contains("managed-cluster"));
        assert!(registry.contains("helm-chart"));
    }
}
