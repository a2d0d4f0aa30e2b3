//! Lab settings.
//!
//! Settings are opaque literal inputs to the declared resources. They are
//! read from JSON or YAML, chosen by file extension.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratus_core::RunConfig;

use crate::error::{LabError, LabResult};

/// Settings for the AKS topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabConfig {
    pub resource_group: String,
    pub location: String,
    pub dns_prefix: String,
    pub node_count: u32,
    pub node_size: String,
    /// Shown by the application container
    pub message: String,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            resource_group: "pulumi-lab-rg".to_string(),
            location: "eastus".to_string(),
            dns_prefix: "pulumi-lab".to_string(),
            node_count: 2,
            node_size: "Standard_B2s".to_string(),
            message: "Hello from AKS!".to_string(),
        }
    }
}

impl LabConfig {
    /// Load settings from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> LabResult<Self> {
        load(path)
    }
}

/// Settings for the EKS topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EksConfig {
    pub aws_region: String,
    pub eks_cluster_name: String,
    pub node_count: u32,
    pub instance_types: String,
    pub message: String,
}

impl Default for EksConfig {
    fn default() -> Self {
        Self {
            aws_region: "us-east-1".to_string(),
            eks_cluster_name: "eks-lab".to_string(),
            node_count: 2,
            instance_types: "t3.medium".to_string(),
            message: "Hello from EKS!".to_string(),
        }
    }
}

impl EksConfig {
    pub fn from_file(path: &Path) -> LabResult<Self> {
        load(path)
    }
}

/// Settings for the Rancher topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RancherConfig {
    pub namespace: String,
    pub replicas: u32,
    pub host: String,
    pub message: String,
}

impl Default for RancherConfig {
    fn default() -> Self {
        Self {
            namespace: "pulumi-app".to_string(),
            replicas: 2,
            host: "pulumi.lab.192.168.17.11.nip.io".to_string(),
            message: "from Rick!".to_string(),
        }
    }
}

impl RancherConfig {
    pub fn from_file(path: &Path) -> LabResult<Self> {
        load(path)
    }
}

/// Load engine settings (timeouts, concurrency, retries).
pub fn run_config_from_file(path: &Path) -> LabResult<RunConfig> {
    load(path)
}

fn load<T: DeserializeOwned>(path: &Path) -> LabResult<T> {
    let content = fs::read_to_string(path)?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    debug!("Loading lab settings from {:?}", path);
    match ext {
        "json" => Ok(serde_json::from_str(&content)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&content)?),
        other => Err(LabError::UnsupportedFormat(format!(
            "{:?} (extension '{}')",
            path, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_json_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"resourceGroup": "lab-rg", "location": "westeurope", "nodeCount": 3}"#,
        )
        .unwrap();

        let config = LabConfig::from_file(&path).unwrap();

        assert_eq!(config.resource_group, "lab-rg");
        assert_eq!(config.location, "westeurope");
        assert_eq!(config.node_count, 3);
        assert_eq!(config.node_size, "Standard_B2s");
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("eks.yaml");
        fs::write(
            &path,
            "aws_region: eu-west-1\neks_cluster_name: lab\ninstance_types: t3.large\n",
        )
        .unwrap();

        let config = EksConfig::from_file(&path).unwrap();

        assert_eq!(config.aws_region, "eu-west-1");
        assert_eq!(config.instance_types, "t3.large");
        assert_eq!(config.node_count, 2);
    }

    #[test]
    fn test_load_run_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.yml");
        fs::write(&path, "max_concurrency: 4\nretries: 2\n").unwrap();

        let config = run_config_from_file(&path).unwrap();

        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.retries, 2);
        assert_eq!(config.apply_timeout(), None);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "location = 'eastus'").unwrap();

        let err = LabConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, LabError::UnsupportedFormat(_)));
    }
}
