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

//! Translates flat pod and container requests into CRI sandbox and container
//! configs, and CRI state back into the flat pod view.

use std::{
    collections::HashMap,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, error, warn};
use podshim_common::{
    api::{
        cri::{
            self, Capability, ContainerConfig, ContainerMetadata, ImageSpec, Int64Value,
            LinuxContainerConfig, LinuxContainerSecurityContext, LinuxPodSandboxConfig,
            LinuxSandboxSecurityContext, MountPropagation, NamespaceMode, NamespaceOption,
            PodSandbox, PodSandboxConfig, PodSandboxFilter, PodSandboxMetadata, PodSandboxState,
            PortMapping, Protocol,
        },
        shim::{
            Container, ContainerOptions, ContainerPort, ContainerSecurity, ContainerState,
            ContainerStatus, Pod, PodOptions, PodPhase, PodSpec, PodStatus, PodVolume,
            ResourceRequests, SharedSecurityOptions, VolumeMount, VolumeSource,
        },
    },
    error::{Context, Error, Result},
    ANNOTATION_CPUS, ANNOTATION_PREFIX, ANNOTATION_RESTART_POLICY, INFO_ANNOTATION_PREFIX,
    POD_NAMESPACE, PRIVATE_NAMESPACE, UNLISTED_LABEL,
};
use serde_derive::Deserialize;

use crate::{
    client::RuntimeService,
    codec::{CONTAINER_CODEC, POD_CODEC},
    network::CniResults,
    volume::{VolumeKind, VolumeResolver},
};

const DEFAULT_RESTART_POLICY: &str = "Never";

pub struct PodTranslator {
    runtime: Arc<dyn RuntimeService>,
    volumes: Arc<VolumeResolver>,
    pod_logs: PathBuf,
    network: CniResults,
}

/// A sandbox with the containers that belong to it.
struct PodData {
    sandbox: PodSandbox,
    containers: Vec<ContainerData>,
}

struct ContainerData {
    container: cri::Container,
    status: cri::ContainerStatus,
    info: HashMap<String, String>,
}

#[derive(Deserialize)]
struct SandboxInfo {
    #[serde(default)]
    config: Option<PodSandboxConfig>,
}

impl PodTranslator {
    pub fn new<P: Into<PathBuf>>(
        runtime: Arc<dyn RuntimeService>,
        volumes: Arc<VolumeResolver>,
        pod_logs: P,
        network: CniResults,
    ) -> Self {
        Self {
            runtime,
            volumes,
            pod_logs: pod_logs.into(),
            network,
        }
    }

    pub async fn create_pod(&self, name: &str, opts: PodOptions) -> Result<String> {
        let sc = opts.security_context.clone().unwrap_or_default();
        let user = to_pod_user(&sc.user);
        let group = to_id(&sc.group).context("invalid group")?;
        let groups = to_group_ids(&sc.groups).context("invalid groups")?;

        let uid = uuid::Uuid::new_v4().to_string();
        let hostname = if opts.hostname.is_empty() {
            name.to_string()
        } else {
            opts.hostname.clone()
        };
        let log_directory = if self.pod_logs.as_os_str().is_empty() {
            String::new()
        } else {
            path_string(&self.pod_logs.join(format!("{}_{}", name, uid)))
        };

        let mut labels = opts.labels.clone();
        labels.insert(UNLISTED_LABEL.to_string(), PRIVATE_NAMESPACE.to_string());
        let mut annotations = opts.annotations.clone();
        if !opts.restart_policy.is_empty() {
            annotations.insert(
                ANNOTATION_RESTART_POLICY.to_string(),
                opts.restart_policy.clone(),
            );
        }

        let mut config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: name.to_string(),
                uid,
                namespace: POD_NAMESPACE.to_string(),
                attempt: 0,
            }),
            hostname,
            log_directory,
            dns_config: opts.dns_config.clone(),
            port_mappings: opts.port_mappings.clone(),
            labels,
            annotations,
            linux: Some(LinuxPodSandboxConfig {
                cgroup_parent: opts.cgroup_parent.clone(),
                security_context: Some(LinuxSandboxSecurityContext {
                    namespace_options: Some(namespace_options(&sc)),
                    selinux_options: sc.selinux_options.clone(),
                    run_as_user: user,
                    readonly_rootfs: sc.readonly_root,
                    supplemental_groups: groups,
                    privileged: sc.privileged,
                    seccomp_profile_path: sc.seccomp_profile.clone(),
                    run_as_group: group,
                }),
                sysctls: opts.sysctls.clone(),
            }),
        };

        let mut annotations = config.annotations.clone();
        POD_CODEC.encode(&opts, &config, &mut annotations)?;
        config.annotations = annotations;

        let id = self
            .runtime
            .run_pod_sandbox(config, &opts.runtime)
            .await
            .with_context(|| format!("failed to run pod sandbox {}", name))?;
        debug!("created pod {} ({})", name, id);
        Ok(id)
    }

    pub async fn create_container(
        &self,
        pod_id: &str,
        image: &str,
        opts: ContainerOptions,
    ) -> Result<String> {
        let pod = self
            .runtime
            .list_pod_sandbox(Some(PodSandboxFilter {
                id: pod_id.to_string(),
                ..Default::default()
            }))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("pod {} not found", pod_id)))?;
        let pod_config = POD_CODEC
            .decode_derived(&pod.annotations)
            .with_context(|| format!("failed to get config of pod {}", pod_id))?;

        let name = if opts.name.is_empty() {
            pod.metadata.as_ref().map(|m| m.name.clone()).unwrap_or_default()
        } else {
            opts.name.clone()
        };

        let sc = opts.security_context.clone().unwrap_or_default();
        let (username, user) = to_user_id(&sc.user);
        let group = to_id(&sc.group).context("invalid group")?;
        let groups = to_group_ids(&sc.groups).context("invalid groups")?;

        let log_path = format!("{}/{}.log", name, opts.attempt);
        if !pod_config.log_directory.is_empty() {
            let dir = Path::new(&pod_config.log_directory).join(&name);
            if let Err(e) = std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&dir)
            {
                warn!("failed to create log dir {}: {}", dir.display(), e);
            }
        }

        let mut mounts = Vec::with_capacity(opts.mounts.len());
        for m in &opts.mounts {
            mounts.push(self.volumes.setup(m).await?);
        }

        let mut labels = opts.labels.clone();
        labels.insert(UNLISTED_LABEL.to_string(), PRIVATE_NAMESPACE.to_string());
        let mut annotations = opts.annotations.clone();
        if opts.millis_cpu > 0 {
            annotations.insert(ANNOTATION_CPUS.to_string(), opts.millis_cpu.to_string());
        }

        let mut config = ContainerConfig {
            metadata: Some(ContainerMetadata {
                name: name.clone(),
                attempt: opts.attempt,
            }),
            image: Some(ImageSpec {
                image: image.to_string(),
                ..Default::default()
            }),
            command: opts.command.clone(),
            args: opts.args.clone(),
            working_dir: opts.working_dir.clone(),
            envs: opts.envs.clone(),
            mounts,
            devices: opts.devices.clone(),
            labels,
            annotations,
            log_path,
            stdin: opts.stdin,
            stdin_once: opts.stdin_once,
            tty: opts.tty,
            linux: Some(LinuxContainerConfig {
                resources: opts.linux_resources.clone(),
                security_context: Some(LinuxContainerSecurityContext {
                    capabilities: Some(Capability {
                        add_capabilities: opts.add_capabilities.clone(),
                        drop_capabilities: opts.drop_capabilities.clone(),
                    }),
                    privileged: sc.privileged,
                    namespace_options: Some(namespace_options(&sc)),
                    selinux_options: sc.selinux_options.clone(),
                    run_as_user: user,
                    run_as_username: username,
                    readonly_rootfs: sc.readonly_root,
                    supplemental_groups: groups,
                    apparmor_profile: String::new(),
                    seccomp_profile_path: sc.seccomp_profile.clone(),
                    no_new_privs: opts.no_new_privs,
                    run_as_group: group,
                    masked_paths: opts.masked_paths.clone(),
                    readonly_paths: opts.readonly_paths.clone(),
                }),
            }),
        };

        let mut annotations = config.annotations.clone();
        CONTAINER_CODEC.encode(&opts, &config, &mut annotations)?;
        config.annotations = annotations;

        let id = self
            .runtime
            .create_container(pod_id, config, pod_config)
            .await
            .with_context(|| format!("failed to create container {} in pod {}", name, pod_id))?;
        debug!("created container {} ({}) in pod {}", name, id, pod_id);
        Ok(id)
    }

    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        let sandboxes = self.runtime.list_pod_sandbox(None).await?;
        let mut index = HashMap::new();
        let mut pods = Vec::with_capacity(sandboxes.len());
        for sandbox in sandboxes {
            index.insert(sandbox.id.clone(), pods.len());
            pods.push(PodData {
                sandbox,
                containers: vec![],
            });
        }

        for container in self.runtime.list_containers(None).await? {
            let i = match index.get(&container.pod_sandbox_id) {
                Some(i) => *i,
                None => continue,
            };
            let resp = match self.runtime.container_status(&container.id, true).await {
                Ok(r) => r,
                Err(e) if e.is_not_found() => {
                    debug!("container {} is gone: {}", container.id, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            pods[i].containers.push(ContainerData {
                container,
                status: resp.status.unwrap_or_default(),
                info: resp.info,
            });
        }

        let ips = self.network.pod_ips().await;
        let mut result = Vec::with_capacity(pods.len());
        for data in &pods {
            let mut pod = match self.to_pod(data).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("failed to convert pod {}: {}", data.sandbox.id, e);
                    continue;
                }
            };
            if let Some(pod_ips) = ips.get(&data.sandbox.id) {
                if let Some(first) = pod_ips.first() {
                    pod.status.pod_ip = first.clone();
                    pod.status.pod_ips = pod_ips.clone();
                }
            }
            result.push(pod);
        }
        Ok(result)
    }

    /// Config stored by the runtime itself, used when ours is unreadable.
    async fn runtime_sandbox_config(&self, id: &str) -> Result<PodSandboxConfig> {
        let resp = self.runtime.pod_sandbox_status(id, true).await?;
        let info = resp
            .info
            .get("info")
            .ok_or_else(|| Error::ConfigCorrupt(format!("sandbox {} has no info", id)))?;
        let info: SandboxInfo = serde_json::from_str(info).map_err(|e| {
            Error::ConfigCorrupt(format!("failed to parse info of sandbox {}: {}", id, e))
        })?;
        Ok(info.config.unwrap_or_default())
    }

    async fn to_pod(&self, data: &PodData) -> Result<Pod> {
        let sandbox = &data.sandbox;
        let config = match POD_CODEC.decode_derived(&sandbox.annotations) {
            Ok(c) => c,
            Err(e) => {
                debug!("falling back to runtime config of pod {}: {}", sandbox.id, e);
                self.runtime_sandbox_config(&sandbox.id).await?
            }
        };
        let metadata = sandbox.metadata.clone().unwrap_or_default();
        let ns = config.namespace_options().cloned().unwrap_or_default();
        let sc = config
            .linux
            .as_ref()
            .and_then(|l| l.security_context.clone())
            .unwrap_or_default();

        let mut pod = Pod {
            id: sandbox.id.clone(),
            name: metadata.name,
            namespace: metadata.namespace,
            uid: metadata.uid,
            created_at: sandbox.created_at,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            spec: PodSpec {
                hostname: config.hostname.clone(),
                runtime_handler: Some(sandbox.runtime_handler.clone()).filter(|r| !r.is_empty()),
                restart_policy: restart_policy(&sandbox.annotations),
                host_network: ns.network() == NamespaceMode::Node,
                host_pid: ns.pid() == NamespaceMode::Node,
                host_ipc: ns.ipc() == NamespaceMode::Node,
                share_process_namespace: ns.pid() == NamespaceMode::Pod,
                run_as_user: sc.run_as_user.as_ref().map(|v| v.value),
                run_as_group: sc.run_as_group.as_ref().map(|v| v.value),
                supplemental_groups: sc.supplemental_groups.clone(),
                sysctls: config
                    .linux
                    .as_ref()
                    .map(|l| l.sysctls.clone())
                    .unwrap_or_default(),
                selinux_options: sc.selinux_options.clone(),
                dns_config: config.dns_config.clone(),
                containers: vec![],
                volumes: vec![],
            },
            status: PodStatus {
                phase: pod_phase(sandbox, &data.containers),
                start_time: start_time(&data.containers),
                container_statuses: data.containers.iter().map(container_status).collect(),
                ..Default::default()
            },
        };
        add_strings(&mut pod.labels, &sandbox.labels);
        add_strings(&mut pod.annotations, &sandbox.annotations);

        for (i, c) in data.containers.iter().enumerate() {
            add_strings(&mut pod.labels, &c.container.labels);
            add_strings(&mut pod.annotations, &c.container.annotations);
            let name = c
                .container
                .metadata
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_default();
            let info = serde_json::to_string(&c.info).unwrap_or_else(|_| "{}".to_string());
            pod.annotations
                .insert(format!("{}{}", INFO_ANNOTATION_PREFIX, name), info);

            let mappings: &[PortMapping] = if i == 0 {
                config.port_mappings.as_slice()
            } else {
                &[]
            };
            let container = self.to_container(mappings, &mut pod.spec.volumes, c);
            pod.spec.containers.push(container);
        }
        Ok(pod)
    }

    fn to_container(
        &self,
        mappings: &[PortMapping],
        volumes: &mut Vec<PodVolume>,
        data: &ContainerData,
    ) -> Container {
        let name = data
            .container
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        let image = data
            .container
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default();

        let config = match CONTAINER_CODEC.decode_derived(&data.container.annotations) {
            Ok(c) => c,
            Err(e) => {
                error!(
                    "failed to read config of container {} in pod {}: {}",
                    data.container.id, data.container.pod_sandbox_id, e
                );
                return Container {
                    name,
                    image,
                    ..Default::default()
                };
            }
        };

        let volume_mounts = config
            .mounts
            .iter()
            .map(|m| self.add_mount(volumes, m))
            .collect();
        let sc = config.security_context().cloned().unwrap_or_default();
        let caps = sc.capabilities.clone().unwrap_or_default();

        Container {
            name,
            image,
            command: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            ports: to_ports(mappings),
            env: config.envs.clone(),
            resources: to_resources(&data.container.pod_sandbox_id, &config),
            volume_mounts,
            security_context: ContainerSecurity {
                add_capabilities: caps.add_capabilities,
                drop_capabilities: caps.drop_capabilities,
                privileged: sc.privileged,
                run_as_user: sc.run_as_user.as_ref().map(|v| v.value),
                run_as_group: sc.run_as_group.as_ref().map(|v| v.value),
                readonly_rootfs: sc.readonly_rootfs,
                selinux_options: sc.selinux_options.clone(),
            },
            stdin: config.stdin,
            stdin_once: config.stdin_once,
            tty: config.tty,
        }
    }

    fn add_mount(&self, volumes: &mut Vec<PodVolume>, mount: &cri::Mount) -> VolumeMount {
        let (name, kind) = self.volumes.classify(&mount.host_path);
        if !volumes.iter().any(|v| v.name == name) {
            let source = match kind {
                VolumeKind::HostPath => VolumeSource::HostPath {
                    path: mount.host_path.clone(),
                },
                VolumeKind::Named => VolumeSource::Named,
                VolumeKind::Ephemeral => VolumeSource::Ephemeral,
            };
            volumes.push(PodVolume {
                name: name.clone(),
                source,
            });
        }
        let propagation = match mount.propagation() {
            MountPropagation::PropagationPrivate => "None",
            MountPropagation::PropagationHostToContainer => "HostToContainer",
            MountPropagation::PropagationBidirectional => "Bidirectional",
        };
        VolumeMount {
            name,
            mount_path: mount.container_path.clone(),
            readonly: mount.readonly,
            propagation: Some(propagation.to_string()),
        }
    }
}

fn namespace_options(sc: &SharedSecurityOptions) -> NamespaceOption {
    NamespaceOption {
        network: sc.net_mode,
        pid: sc.pid_mode,
        ipc: sc.ipc_mode,
        target_id: String::new(),
    }
}

/// Pod level user: a non numeric user is ignored.
fn to_pod_user(val: &str) -> Option<Int64Value> {
    if val.is_empty() || val == "root" {
        return None;
    }
    val.parse::<i64>().ok().map(|value| Int64Value { value })
}

fn to_id(val: &str) -> Result<Option<Int64Value>> {
    if val.is_empty() || val == "root" {
        return Ok(None);
    }
    let value = val
        .parse::<i64>()
        .map_err(|e| Error::InvalidArgument(format!("failed to parse {}: {}", val, e)))?;
    Ok(Some(Int64Value { value }))
}

fn to_group_ids(groups: &[String]) -> Result<Vec<i64>> {
    let mut result = vec![];
    for group in groups {
        if let Some(id) = to_id(group)? {
            result.push(id.value);
        }
    }
    Ok(result)
}

/// Container level user: a numeric user becomes a uid, anything else a
/// username.
fn to_user_id(val: &str) -> (String, Option<Int64Value>) {
    if val.is_empty() || val == "root" {
        return (String::new(), None);
    }
    match val.parse::<i64>() {
        Ok(value) => (String::new(), Some(Int64Value { value })),
        Err(_) => (val.to_string(), None),
    }
}

fn restart_policy(annotations: &HashMap<String, String>) -> String {
    annotations
        .get(ANNOTATION_RESTART_POLICY)
        .filter(|p| !p.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_RESTART_POLICY.to_string())
}

fn add_strings(into: &mut HashMap<String, String>, from: &HashMap<String, String>) {
    for (k, v) in from {
        if k.starts_with(ANNOTATION_PREFIX) {
            continue;
        }
        into.insert(k.clone(), v.clone());
    }
}

fn to_ports(mappings: &[PortMapping]) -> Vec<ContainerPort> {
    mappings
        .iter()
        .enumerate()
        .map(|(i, p)| ContainerPort {
            name: format!("port{}", i),
            host_port: p.host_port,
            container_port: p.container_port,
            host_ip: p.host_ip.clone(),
            protocol: match p.protocol() {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
                Protocol::Sctp => "SCTP",
            }
            .to_string(),
        })
        .collect()
}

fn to_resources(pod_id: &str, config: &ContainerConfig) -> ResourceRequests {
    let mut result = ResourceRequests::default();
    let memory = config
        .resources()
        .map(|r| r.memory_limit_in_bytes)
        .unwrap_or_default();
    if memory > 0 {
        result.memory_bytes = Some(memory);
    }
    if let Some(cpu) = config.annotations.get(ANNOTATION_CPUS) {
        match cpu.parse::<i64>() {
            Ok(millis) => result.cpu_shares = Some(cpu_shares(millis)),
            Err(e) => error!(
                "failed to parse cpu {} of container {}/{}: {}",
                cpu,
                pod_id,
                config.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or_default(),
                e
            ),
        }
    }
    result
}

fn cpu_shares(millis: i64) -> i64 {
    std::cmp::max(2, millis * 1024 / 1000)
}

fn start_time(containers: &[ContainerData]) -> Option<i64> {
    containers
        .iter()
        .map(|c| c.status.started_at)
        .filter(|t| *t > 0)
        .min()
}

fn container_status(data: &ContainerData) -> ContainerStatus {
    let status = &data.status;
    let state = if status.finished_at > 0 {
        ContainerState::Terminated {
            exit_code: status.exit_code,
            reason: status.reason.clone(),
            message: status.message.clone(),
            started_at: status.started_at,
            finished_at: status.finished_at,
            container_id: status.id.clone(),
        }
    } else if status.started_at > 0 {
        ContainerState::Running {
            started_at: status.started_at,
        }
    } else {
        ContainerState::Waiting {
            reason: status.reason.clone(),
            message: status.message.clone(),
        }
    };
    let container_id = if status.id.is_empty() {
        data.container.id.clone()
    } else {
        status.id.clone()
    };
    ContainerStatus {
        name: data
            .container
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        container_id,
        image: status
            .image
            .as_ref()
            .map(|i| i.image.clone())
            .unwrap_or_default(),
        image_id: status.image_ref.clone(),
        restart_count: status.metadata.as_ref().map(|m| m.attempt).unwrap_or_default(),
        state,
    }
}

fn pod_phase(sandbox: &PodSandbox, containers: &[ContainerData]) -> PodPhase {
    if sandbox.state() != PodSandboxState::SandboxReady || containers.is_empty() {
        return PodPhase::Pending;
    }
    let states = containers
        .iter()
        .map(|c| c.container.state())
        .collect::<Vec<_>>();
    if states.contains(&cri::ContainerState::ContainerCreated) {
        return PodPhase::Pending;
    }
    if states.contains(&cri::ContainerState::ContainerUnknown) {
        return PodPhase::Unknown;
    }
    let failed = containers.iter().any(|c| {
        c.container.state() == cri::ContainerState::ContainerExited && c.status.exit_code != 0
    });
    if failed {
        return PodPhase::Failed;
    }
    if states.contains(&cri::ContainerState::ContainerRunning) {
        return PodPhase::Running;
    }
    PodPhase::Succeeded
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
