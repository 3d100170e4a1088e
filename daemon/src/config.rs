/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::{path::Path, time::Duration};

use anyhow::anyhow;
use log::info;
use podshim_common::{
    error::Result, DEFAULT_CNI_NETWORK_PREFIX, DEFAULT_CNI_RESULTS_DIR,
    DEFAULT_CONTAINERD_ADDRESS, DEFAULT_LISTEN, DEFAULT_POD_LOGS_DIR, DEFAULT_VOLUMES_DIR,
    PRIVATE_NAMESPACE, PUBLIC_NAMESPACE,
};
use serde_derive::Deserialize;
use tokio::fs::read_to_string;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub runtime: RuntimeConfig,
    pub containerd: ContainerdConfig,
    pub gc: GcConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    pub log_level: String,
    /// Root of the per-pod log directories.
    pub pod_logs: String,
    pub volumes: String,
    pub cni_results: String,
    pub cni_prefix: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            pod_logs: DEFAULT_POD_LOGS_DIR.to_string(),
            volumes: DEFAULT_VOLUMES_DIR.to_string(),
            cni_results: DEFAULT_CNI_RESULTS_DIR.to_string(),
            cni_prefix: DEFAULT_CNI_NETWORK_PREFIX.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// CRI runtime service socket.
    pub endpoint: String,
    /// CRI image service socket, the runtime endpoint when empty.
    pub image_endpoint: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_CONTAINERD_ADDRESS.to_string(),
            image_endpoint: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn image_endpoint(&self) -> &str {
        if self.image_endpoint.is_empty() {
            &self.endpoint
        } else {
            &self.image_endpoint
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ContainerdConfig {
    pub address: String,
    pub private_namespace: String,
    pub public_namespace: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONTAINERD_ADDRESS.to_string(),
            private_namespace: PRIVATE_NAMESPACE.to_string(),
            public_namespace: PUBLIC_NAMESPACE.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds to wait between listing and removing orphaned sandboxes.
    pub grace_period: u64,
    /// Seconds to wait before retrying a failed background pass.
    pub retry_delay: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period: 5,
            retry_delay: 5,
        }
    }
}

impl GcConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}

impl Config {
    pub async fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let toml_str = read_to_string(&path).await?;
        let conf: Self = toml::from_str(&toml_str)
            .map_err(|e| anyhow!("failed to parse podshim config {}", e))?;
        Ok(conf)
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        if !path.as_ref().exists() {
            info!(
                "config file {} not found, using defaults",
                path.as_ref().display()
            );
            return Ok(Self::default());
        }
        Self::parse(path).await
    }
}
