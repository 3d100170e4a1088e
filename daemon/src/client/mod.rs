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

//! Seams towards the CRI runtime and the containerd content store.
//!
//! Every component takes these traits instead of concrete clients, the
//! gRPC implementations live in [`cri`] and [`containerd`].

use std::{collections::HashMap, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use podshim_common::{
    api::{
        containerd::{Descriptor, Envelope, Image as ContainerdImage, Info, Status},
        cri::{
            AttachRequest, AuthConfig, Container, ContainerConfig, ContainerFilter,
            ContainerStatusResponse, ExecRequest, Image, PodSandbox, PodSandboxConfig,
            PodSandboxFilter, PodSandboxStatusResponse,
        },
    },
    error::{Error, Result},
};
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub mod containerd;
pub mod cri;
#[cfg(test)]
pub mod fake;

pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;
pub type EventStream = BoxStream<'static, Result<Envelope>>;

#[async_trait]
pub trait RuntimeService: Send + Sync + 'static {
    async fn run_pod_sandbox(&self, config: PodSandboxConfig, runtime_handler: &str)
        -> Result<String>;
    async fn stop_pod_sandbox(&self, id: &str) -> Result<()>;
    async fn remove_pod_sandbox(&self, id: &str) -> Result<()>;
    async fn pod_sandbox_status(&self, id: &str, verbose: bool)
        -> Result<PodSandboxStatusResponse>;
    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>>;

    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        sandbox_config: PodSandboxConfig,
    ) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>>;
    async fn container_status(&self, id: &str, verbose: bool) -> Result<ContainerStatusResponse>;

    /// Returns the streaming server url of the exec session.
    async fn exec(&self, req: ExecRequest) -> Result<String>;
    async fn attach(&self, req: AttachRequest) -> Result<String>;
}

#[async_trait]
pub trait ImageService: Send + Sync + 'static {
    async fn list_images(&self) -> Result<Vec<Image>>;
    /// `None` when the image is not present.
    async fn image_status(&self, image: &str) -> Result<Option<Image>>;
    async fn pull_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<String>;
    async fn remove_image(&self, image: &str) -> Result<()>;
}

/// The containerd content store. Every call is scoped to a namespace.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    async fn info(&self, ns: &str, digest: &str) -> Result<Info>;
    async fn read(&self, ns: &str, digest: &str) -> Result<ByteStream>;
    /// Writes `data` under the ingest ref `reference` and commits it with
    /// `labels`. An already existing blob is not an error.
    async fn write(
        &self,
        ns: &str,
        reference: &str,
        desc: &Descriptor,
        data: ByteStream,
        labels: HashMap<String, String>,
    ) -> Result<()>;
    /// Sets the given labels, other labels are kept.
    async fn update_labels(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<()>;
    async fn list_statuses(&self, ns: &str) -> Result<Vec<Status>>;
}

#[async_trait]
pub trait ImageStore: Send + Sync + 'static {
    async fn get(&self, ns: &str, name: &str) -> Result<ContainerdImage>;
    async fn create(&self, ns: &str, image: ContainerdImage) -> Result<ContainerdImage>;
    /// Replaces the target and labels of an existing image.
    async fn update(&self, ns: &str, image: ContainerdImage) -> Result<ContainerdImage>;
    async fn delete(&self, ns: &str, name: &str) -> Result<()>;
}

#[async_trait]
pub trait EventService: Send + Sync + 'static {
    async fn subscribe(&self, filters: Vec<String>) -> Result<EventStream>;
}

/// Everything the daemon talks to.
#[derive(Clone)]
pub struct Backend {
    pub runtime: Arc<dyn RuntimeService>,
    pub images: Arc<dyn ImageService>,
    pub content: Arc<dyn ContentStore>,
    pub image_store: Arc<dyn ImageStore>,
    pub events: Arc<dyn EventService>,
}

impl Backend {
    /// Connects to the CRI endpoints and to containerd.
    pub async fn connect(
        runtime_endpoint: &str,
        image_endpoint: &str,
        containerd_address: &str,
    ) -> Result<Self> {
        let runtime_channel = connect(runtime_endpoint).await?;
        let image_channel = if image_endpoint == runtime_endpoint {
            runtime_channel.clone()
        } else {
            connect(image_endpoint).await?
        };
        let containerd_channel = if containerd_address == runtime_endpoint {
            runtime_channel.clone()
        } else {
            connect(containerd_address).await?
        };

        let cri = Arc::new(cri::CriClient::new(runtime_channel, image_channel));
        let containerd = Arc::new(containerd::ContainerdClient::new(containerd_channel));
        Ok(Self {
            runtime: cri.clone(),
            images: cri,
            content: containerd.clone(),
            image_store: containerd.clone(),
            events: containerd,
        })
    }
}

/// Opens a gRPC channel over a unix socket. A `unix://` prefix is accepted.
pub async fn connect(address: &str) -> Result<Channel> {
    let path = PathBuf::from(address.trim_start_matches("unix://"));
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
        .map_err(|e| Error::Unavailable(format!("failed to connect {}: {}", address, e)))?;
    Ok(channel)
}
