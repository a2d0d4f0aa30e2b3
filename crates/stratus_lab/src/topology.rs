//! Lab topologies.
//!
//! Each function declares one complete environment on a [`Stack`]: cloud
//! network and cluster, the Kubernetes connection built from the cluster's
//! credentials, and an application exposed through a load balancer or
//! ingress. Nothing is provisioned until the stack runs.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use stratus_core::{
    interpolate, Deferred, ExportSink, FileSink, Input, Inputs, ResourceOptions, ResourceRef,
    Stack,
};

use crate::config::{EksConfig, LabConfig, RancherConfig};
use crate::error::LabResult;

const APP_IMAGE: &str = "rbroker/pulumi-lab";
const APP_PORT: u32 = 8080;

/// Handles to the resources of the AKS lab.
#[derive(Debug, Clone)]
pub struct AksLab {
    pub resource_group: ResourceRef,
    pub vnet: ResourceRef,
    pub subnet: ResourceRef,
    pub cluster: ResourceRef,
    pub credentials: ResourceRef,
    pub kubernetes: ResourceRef,
    pub traefik: ResourceRef,
    pub deployment: ResourceRef,
    pub service: ResourceRef,
    pub ingress: ResourceRef,
    /// `pulumi-lab.<ingress ip>.nip.io`
    pub ingress_host: Deferred<String>,
}

/// Declare the AKS lab: network, cluster, Traefik ingress controller and the
/// application behind an ingress on the controller's public address.
///
/// Exports `aksName`, `kubeConfig` and `ingressUrl`. The kubeconfig is also
/// written to `kubeconfig_sink`, when given, once it has resolved.
pub fn declare_aks(
    stack: &mut Stack,
    config: &LabConfig,
    kubeconfig_sink: Option<Arc<dyn ExportSink>>,
) -> LabResult<AksLab> {
    let resource_group = stack.declare(
        "resource-group",
        "resourceGroup",
        Inputs::new()
            .field("resourceGroupName", config.resource_group.as_str())
            .field("location", config.location.as_str()),
    )?;

    let vnet = stack.declare(
        "virtual-network",
        "vnet",
        Inputs::new()
            .field("resourceGroupName", resource_group.output("name")?)
            .field("location", resource_group.output("location")?)
            .field("addressSpace", json!({"addressPrefixes": ["10.0.0.0/16"]})),
    )?;

    let subnet = stack.declare(
        "subnet",
        "subnet",
        Inputs::new()
            .field("resourceGroupName", resource_group.output("name")?)
            .field("virtualNetworkName", vnet.output("name")?)
            .field("addressPrefix", "10.0.1.0/24"),
    )?;

    let agent_pool = Input::object([
        ("name", Input::from("agentpool")),
        ("count", config.node_count.into()),
        ("vmSize", config.node_size.as_str().into()),
        ("mode", "System".into()),
        ("osType", "Linux".into()),
        ("vnetSubnetID", subnet.output("id")?.into()),
    ]);
    let cluster = stack.declare(
        "managed-cluster",
        "aksCluster",
        Inputs::new()
            .field("resourceGroupName", resource_group.output("name")?)
            .field("location", resource_group.output("location")?)
            .field("dnsPrefix", config.dns_prefix.as_str())
            .field("agentPoolProfiles", Input::list([agent_pool]))
            .field("identity", json!({"type": "SystemAssigned"}))
            .field("enableRbac", true)
            .field(
                "networkProfile",
                json!({
                    "networkPlugin": "azure",
                    "serviceCidr": "10.0.2.0/24",
                    "dnsServiceIP": "10.0.2.10",
                }),
            ),
    )?;

    let credentials = stack.declare(
        "cluster-credentials",
        "aksCredentials",
        Inputs::new()
            .field("resourceGroupName", resource_group.output("name")?)
            .field("clusterName", cluster.output("name")?),
    )?;
    let kubeconfig = credentials.output("kubeconfig")?;

    let kubernetes = stack.declare(
        "kubernetes-provider",
        "k8sProvider",
        Inputs::new().field("kubeconfig", &kubeconfig),
    )?;
    let provider = kubernetes.output("id")?;

    let traefik = stack.declare(
        "helm-chart",
        "traefik",
        Inputs::new()
            .field("chart", "traefik")
            .field("version", "21.0.0")
            .field("repo", "https://traefik.github.io/charts")
            .field("namespace", "kube-system")
            .field("values", json!({"service": {"type": "LoadBalancer"}}))
            .field("provider", &provider),
    )?;

    let ingress_ip = traefik.output("loadBalancerIp")?;
    let ingress_host = interpolate("pulumi-lab.{}.nip.io", &[ingress_ip]);

    let labels = json!({"app": "rbroker-app"});
    let deployment = stack.declare(
        "deployment",
        "rbroker-app",
        Inputs::new()
            .field("name", "rbroker-app")
            .field("replicas", 2u32)
            .field("labels", labels.clone())
            .field(
                "containers",
                Input::list([app_container("rbroker-app", &config.message)]),
            )
            .field("provider", &provider),
    )?;

    let service = stack.declare(
        "service",
        "rbroker-app-service",
        Inputs::new()
            .field("name", "rbroker-app-service")
            .field("selector", labels)
            .field("ports", json!([{"port": APP_PORT, "targetPort": APP_PORT}]))
            .field("provider", &provider),
    )?;

    let ingress = stack.declare(
        "ingress",
        "app-ingress",
        Inputs::new()
            .field("name", "app-ingress")
            .field(
                "annotations",
                json!({"traefik.ingress.kubernetes.io/router.entrypoints": "web"}),
            )
            .field(
                "rules",
                Input::list([ingress_rule(ingress_host.clone(), service.output("name")?)]),
            )
            .field("provider", &provider),
    )?;

    stack.export("aksName", cluster.output("name")?)?;
    match kubeconfig_sink {
        Some(sink) => stack.export_to("kubeConfig", kubeconfig, sink)?,
        None => stack.export("kubeConfig", kubeconfig)?,
    }
    let ingress_url = interpolate("http://{}/", &[ingress_host.map(Value::String)]);
    stack.export("ingressUrl", ingress_url.map(Value::String))?;

    info!("Declared AKS lab with {} resources", stack.len());
    Ok(AksLab {
        resource_group,
        vnet,
        subnet,
        cluster,
        credentials,
        kubernetes,
        traefik,
        deployment,
        service,
        ingress,
        ingress_host,
    })
}

/// Handles to the resources of the EKS lab.
#[derive(Debug, Clone)]
pub struct EksLab {
    pub cluster: ResourceRef,
    pub node_group: ResourceRef,
    pub kubernetes: ResourceRef,
    pub namespace: ResourceRef,
    pub deployment: ResourceRef,
    pub service: ResourceRef,
}

/// Declare the EKS lab: cluster, managed node group and the application
/// behind a LoadBalancer service.
///
/// The workloads take their namespace from the namespace resource and are
/// also ordered explicitly: the deployment after the namespace, the service
/// after the deployment. Exports `kubeconfig`,
/// `eksClusterName` and `loadBalancerDns`.
pub fn declare_eks(
    stack: &mut Stack,
    config: &EksConfig,
    kubeconfig_sink: Option<Arc<dyn ExportSink>>,
) -> LabResult<EksLab> {
    let cluster = stack.declare(
        "eks-cluster",
        config.eks_cluster_name.as_str(),
        Inputs::new()
            .field("name", config.eks_cluster_name.as_str())
            .field("instanceType", config.instance_types.as_str())
            .field("desiredCapacity", config.node_count)
            .field("minSize", 1u32)
            .field("maxSize", 3u32)
            .field("region", config.aws_region.as_str()),
    )?;

    let node_group = stack.declare(
        "node-group",
        "eks-nodegroup",
        Inputs::new()
            .field("clusterName", cluster.output("name")?)
            .field("nodeGroupName", "eks-ng")
            .field("nodeRoleArn", cluster.output("instanceRoleArn")?)
            .field("instanceTypes", json!([config.instance_types]))
            .field("desiredSize", config.node_count)
            .field("minSize", 1u32)
            .field("maxSize", 3u32),
    )?;

    let kubeconfig = cluster.output("kubeconfig")?;
    let kubernetes = stack.declare(
        "kubernetes-provider",
        "k8s-provider",
        Inputs::new().field("kubeconfig", &kubeconfig),
    )?;
    let provider = kubernetes.output("id")?;

    let namespace = stack.declare(
        "namespace",
        "pulumi-app-ns",
        Inputs::new()
            .field("name", "pulumi-app")
            .field("provider", &provider),
    )?;
    let ns_name = namespace.output("name")?;

    let labels = json!({"app": "pulumi-lab"});
    let deployment = stack.declare_with(
        "deployment",
        "app-deployment",
        Inputs::new()
            .field("name", "app-deployment")
            .field("namespace", &ns_name)
            .field("replicas", 1u32)
            .field("labels", labels.clone())
            .field(
                "containers",
                Input::list([app_container("pulumi-lab", &config.message)]),
            )
            .field("provider", &provider),
        ResourceOptions::new().depends_on(&namespace),
    )?;

    let service = stack.declare_with(
        "service",
        "app-service",
        Inputs::new()
            .field("name", "app-service")
            .field("namespace", &ns_name)
            .field("type", "LoadBalancer")
            .field("selector", labels)
            .field("ports", json!([{"port": 80, "targetPort": APP_PORT}]))
            .field("provider", &provider),
        ResourceOptions::new().depends_on(&deployment),
    )?;

    match kubeconfig_sink {
        Some(sink) => stack.export_to("kubeconfig", kubeconfig, sink)?,
        None => stack.export("kubeconfig", kubeconfig)?,
    }
    stack.export("eksClusterName", cluster.output("name")?)?;
    stack.export("loadBalancerDns", service.output("hostname")?)?;

    info!("Declared EKS lab with {} resources", stack.len());
    Ok(EksLab {
        cluster,
        node_group,
        kubernetes,
        namespace,
        deployment,
        service,
    })
}

/// Handles to the resources of the Rancher lab.
#[derive(Debug, Clone)]
pub struct RancherLab {
    pub namespace: ResourceRef,
    pub deployment: ResourceRef,
    pub service: ResourceRef,
    pub ingress: ResourceRef,
}

/// Declare the Rancher lab: the application on an existing cluster, reached
/// through Traefik on a fixed host. The ingress class is picked with the
/// `kubernetes.io/ingress.class` annotation.
///
/// Exports `namespace`, `serviceName` and `ingressUrl`.
pub fn declare_rancher(stack: &mut Stack, config: &RancherConfig) -> LabResult<RancherLab> {
    let namespace = stack.declare(
        "namespace",
        "namespace",
        Inputs::new().field("name", config.namespace.as_str()),
    )?;
    let ns_name = namespace.output("name")?;

    let labels = json!({"app": "pulumi-app"});
    let deployment = stack.declare(
        "deployment",
        "deployment",
        Inputs::new()
            .field("name", "pulumi-app")
            .field("namespace", &ns_name)
            .field("replicas", config.replicas)
            .field("labels", labels.clone())
            .field(
                "containers",
                Input::list([app_container("pulumi-app", &config.message)]),
            ),
    )?;

    let service = stack.declare(
        "service",
        "service",
        Inputs::new()
            .field("name", "pulumi-app")
            .field("namespace", &ns_name)
            .field("selector", labels)
            .field("ports", json!([{"port": APP_PORT, "targetPort": APP_PORT}])),
    )?;

    let host = Deferred::resolved(config.host.clone());
    let ingress = stack.declare(
        "ingress",
        "ingress",
        Inputs::new()
            .field("name", "pulumi-app")
            .field("namespace", &ns_name)
            .field(
                "annotations",
                json!({"kubernetes.io/ingress.class": "traefik"}),
            )
            .field(
                "rules",
                Input::list([ingress_rule(host, service.output("name")?)]),
            ),
    )?;

    stack.export("namespace", ns_name)?;
    stack.export("serviceName", service.output("name")?)?;
    let url = interpolate("http://{}", &[ingress.output("host")?]);
    stack.export("ingressUrl", url.map(Value::String))?;

    info!("Declared Rancher lab with {} resources", stack.len());
    Ok(RancherLab {
        namespace,
        deployment,
        service,
        ingress,
    })
}

/// The lab environments that can be declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Topology {
    Aks,
    Eks,
    Rancher,
}

impl Topology {
    /// Name of the stack holding this topology.
    pub fn stack_name(&self) -> &'static str {
        match self {
            Self::Aks => "aks-lab",
            Self::Eks => "eks-lab",
            Self::Rancher => "rancher-lab",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aks => write!(f, "aks"),
            Self::Eks => write!(f, "eks"),
            Self::Rancher => write!(f, "rancher"),
        }
    }
}

/// Declare `topology` with settings read from `settings`, or the defaults.
///
/// When `kubeconfig_out` is given the cluster kubeconfig is written there
/// after the run: the raw YAML for AKS, pretty JSON for EKS.
pub fn declare_topology(
    stack: &mut Stack,
    topology: Topology,
    settings: Option<&Path>,
    kubeconfig_out: Option<&Path>,
) -> LabResult<()> {
    match topology {
        Topology::Aks => {
            let config = match settings {
                Some(path) => LabConfig::from_file(path)?,
                None => LabConfig::default(),
            };
            let sink = kubeconfig_out
                .map(|path| Arc::new(FileSink::new(path).raw()) as Arc<dyn ExportSink>);
            declare_aks(stack, &config, sink)?;
        }
        Topology::Eks => {
            let config = match settings {
                Some(path) => EksConfig::from_file(path)?,
                None => EksConfig::default(),
            };
            let sink = kubeconfig_out
                .map(|path| Arc::new(FileSink::new(path).indent(4)) as Arc<dyn ExportSink>);
            declare_eks(stack, &config, sink)?;
        }
        Topology::Rancher => {
            let config = match settings {
                Some(path) => RancherConfig::from_file(path)?,
                None => RancherConfig::default(),
            };
            if kubeconfig_out.is_some() {
                warn!("The rancher lab uses an existing cluster, no kubeconfig is written");
            }
            declare_rancher(stack, &config)?;
        }
    }
    Ok(())
}

/// The lab application container, configured through `MESSAGE`.
fn app_container(name: &str, message: &str) -> Input {
    Input::from(json!({
        "name": name,
        "image": APP_IMAGE,
        "ports": [{"containerPort": APP_PORT}],
        "env": [{"name": "MESSAGE", "value": message}],
    }))
}

/// Route every path on `host` to port 8080 of `service`.
fn ingress_rule(host: Deferred<String>, service: Deferred<Value>) -> Input {
    let backend = Input::object([(
        "service",
        Input::object([
            ("name", Input::from(service)),
            ("port", json!({"number": APP_PORT}).into()),
        ]),
    )]);
    let path = Input::object([
        ("path", Input::from("/")),
        ("pathType", "Prefix".into()),
        ("backend", backend),
    ]);
    Input::object([
        ("host", Input::from(host)),
        ("http", Input::object([("paths", Input::list([path]))])),
    ])
}
