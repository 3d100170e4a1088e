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

//! Request and response types of the podshim facade.

use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::{
    api::cri::{
        AuthConfig, Device, DnsConfig, KeyValue, LinuxContainerResources, Mount, PortMapping,
        SeLinuxOption,
    },
    error::{Error, Result},
};

/// Security settings shared by pods and containers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedSecurityOptions {
    /// `NamespaceMode` of the network namespace.
    pub net_mode: i32,
    pub pid_mode: i32,
    pub ipc_mode: i32,
    pub privileged: bool,
    pub selinux_options: Option<SeLinuxOption>,
    pub readonly_root: bool,
    pub seccomp_profile: String,
    /// Username or numeric uid. Empty or `root` keeps the image default.
    pub user: String,
    /// Numeric gid. Empty or `root` keeps the image default.
    pub group: String,
    pub groups: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodOptions {
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    /// CRI runtime handler, empty for the default one.
    pub runtime: String,
    pub dns_config: Option<DnsConfig>,
    pub port_mappings: Vec<PortMapping>,
    pub cgroup_parent: String,
    pub sysctls: HashMap<String, String>,
    pub restart_policy: String,
    pub security_context: Option<SharedSecurityOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerOptions {
    pub name: String,
    pub attempt: u32,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub envs: Vec<KeyValue>,
    pub mounts: Vec<Mount>,
    pub devices: Vec<Device>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub stdin: bool,
    pub stdin_once: bool,
    pub tty: bool,
    pub linux_resources: Option<LinuxContainerResources>,
    /// Requested cpu in thousandths of a cpu.
    pub millis_cpu: i64,
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub no_new_privs: bool,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub security_context: Option<SharedSecurityOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    pub tty: bool,
    pub stdin: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachOptions {
    pub no_stdin: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub follow: bool,
    pub since_seconds: Option<i64>,
    /// RFC 3339 timestamp, takes precedence over `since_seconds`.
    pub since_time: Option<String>,
    pub tail_lines: Option<i64>,
    pub limit_bytes: Option<i64>,
    pub timestamps: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub stderr: bool,
    pub message: String,
}

/// Where an exec or attach session has to be opened.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamResponse {
    pub url: String,
    pub tty: bool,
    pub stdin: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub tags: Vec<String>,
    pub digests: Vec<String>,
    pub size: u64,
}

/// Progress of one content transfer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferInfo {
    #[serde(rename = "ref")]
    pub reference: String,
    pub status: String,
    pub offset: i64,
    pub total: i64,
    /// Unix nanoseconds, zero when unknown.
    pub started_at: i64,
    pub updated_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub created_at: i64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub spec: PodSpec,
    pub status: PodStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub hostname: String,
    pub runtime_handler: Option<String>,
    pub restart_policy: String,
    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,
    pub share_process_namespace: bool,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub supplemental_groups: Vec<i64>,
    pub sysctls: HashMap<String, String>,
    pub selinux_options: Option<SeLinuxOption>,
    pub dns_config: Option<DnsConfig>,
    pub containers: Vec<Container>,
    pub volumes: Vec<PodVolume>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    HostPath { path: String },
    Named,
    Ephemeral,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodVolume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub ports: Vec<ContainerPort>,
    pub env: Vec<KeyValue>,
    pub resources: ResourceRequests,
    pub volume_mounts: Vec<VolumeMount>,
    pub security_context: ContainerSecurity,
    pub stdin: bool,
    pub stdin_once: bool,
    pub tty: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: String,
    pub host_port: i32,
    pub container_port: i32,
    pub host_ip: String,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub readonly: bool,
    pub propagation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSecurity {
    pub add_capabilities: Vec<String>,
    pub drop_capabilities: Vec<String>,
    pub privileged: bool,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub readonly_rootfs: bool,
    pub selinux_options: Option<SeLinuxOption>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: PodPhase,
    pub start_time: Option<i64>,
    pub pod_ip: String,
    pub pod_ips: Vec<String>,
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub image_id: String,
    pub restart_count: u32,
    pub state: ContainerState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerState {
    Waiting {
        reason: String,
        message: String,
    },
    Running {
        started_at: i64,
    },
    Terminated {
        exit_code: i32,
        reason: String,
        message: String,
        started_at: i64,
        finished_at: i64,
        container_id: String,
    },
}

impl Default for ContainerState {
    fn default() -> Self {
        ContainerState::Waiting {
            reason: String::new(),
            message: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetContainerResponse {
    pub pod: Pod,
    pub container: Container,
    pub id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target: String,
    pub error: Option<String>,
}

/// Per-target outcome of a batch operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<TargetResult>,
}

impl BatchReport {
    pub fn record(&mut self, target: &str, result: Result<()>) {
        self.results.push(TargetResult {
            target: target.to_string(),
            error: result.err().map(|e| e.to_string()),
        });
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    /// `PartialFailure` when any target failed.
    pub fn check(&self) -> Result<()> {
        let failed = self.failed();
        if failed == 0 {
            return Ok(());
        }
        let detail = self
            .results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.target, e)))
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::PartialFailure(format!(
            "{} of {} targets failed: {}",
            failed,
            self.results.len(),
            detail
        )))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreatePodRequest {
    pub name: String,
    pub options: Option<PodOptions>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateContainerRequest {
    pub image: String,
    pub options: Option<ContainerOptions>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StopContainersRequest {
    pub ids: Vec<String>,
    pub timeout: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveContainersRequest {
    pub ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecContainerRequest {
    pub cmd: Vec<String>,
    pub options: ExecOptions,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageRequest {
    pub image: String,
    pub auth: Option<AuthConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PullImageResponse {
    pub image_ref: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TagImageRequest {
    pub image: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateVolumeRequest {
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveVolumesRequest {
    pub names: Vec<String>,
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_report() {
        let mut report = BatchReport::default();
        report.record("a", Ok(()));
        report.record("b", Err(Error::NotFound("container b not found".to_string())));
        report.record("c", Ok(()));
        assert_eq!(report.results.len(), 3);
        assert_eq!(report.failed(), 1);
        let err = report.check().unwrap_err();
        assert!(matches!(err, Error::PartialFailure(_)));
        assert_eq!(
            err.to_string(),
            "1 of 3 targets failed: b: container b not found"
        );
    }

    #[test]
    fn test_container_state_json() {
        let state = ContainerState::Running { started_at: 42 };
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"running":{"started_at":42}}"#);
    }

    #[test]
    fn test_transfer_info_ref_field() {
        let info = TransferInfo {
            reference: "layer-sha256:abc".to_string(),
            status: "waiting".to_string(),
            ..Default::default()
        };
        let v: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(v["ref"], "layer-sha256:abc");
    }
}
