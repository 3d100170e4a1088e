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

pub mod api;
pub mod error;
pub mod signal;

/// Containerd namespace the build engine writes images into.
pub const PRIVATE_NAMESPACE: &str = "podshim.io";
/// Containerd namespace the CRI runtime reads images from.
pub const PUBLIC_NAMESPACE: &str = "k8s.io";
/// Namespace recorded in the CRI sandbox metadata.
pub const POD_NAMESPACE: &str = "podshim";

pub const UNLISTED_LABEL: &str = "io.podshim.unlisted";

pub const ANNOTATION_PREFIX: &str = "podshim.io/";
pub const ANNOTATION_POD_CONFIG: &str = "podshim.io/pod-config";
pub const ANNOTATION_USER_POD_CONFIG: &str = "podshim.io/user-pod-config";
pub const ANNOTATION_CONTAINER_CONFIG: &str = "podshim.io/container-config";
pub const ANNOTATION_USER_CONTAINER_CONFIG: &str = "podshim.io/user-container-config";
pub const ANNOTATION_CONFIG_VERSION: &str = "podshim.io/config-version";
pub const ANNOTATION_RESTART_POLICY: &str = "podshim.io/restart-policy";
pub const ANNOTATION_CPUS: &str = "podshim.io/cpus";
pub const INFO_ANNOTATION_PREFIX: &str = "info.podshim.io/";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/podshim/config.toml";
pub const DEFAULT_LISTEN: &str = "/run/podshim/podshim.sock";
pub const DEFAULT_CONTAINERD_ADDRESS: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_POD_LOGS_DIR: &str = "/var/log/pods";
pub const DEFAULT_VOLUMES_DIR: &str = "/var/lib/podshim/volumes";
pub const DEFAULT_CNI_RESULTS_DIR: &str = "/var/lib/cni/results";
pub const DEFAULT_CNI_NETWORK_PREFIX: &str = "podshim-net";
