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

use async_trait::async_trait;
use podshim_common::{
    api::cri::*,
    error::{Error, Result},
};
use tonic::{
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    transport::Channel,
};

use crate::client::{ImageService, RuntimeService};

const RUNTIME_SERVICE: &str = "/runtime.v1.RuntimeService/";
const IMAGE_SERVICE: &str = "/runtime.v1.ImageService/";

/// CRI v1 client for the runtime and image services.
#[derive(Clone)]
pub struct CriClient {
    runtime: Channel,
    image: Channel,
}

impl CriClient {
    pub fn new(runtime: Channel, image: Channel) -> Self {
        Self { runtime, image }
    }

    async fn runtime_call<Req, Resp>(&self, method: &str, req: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        unary(self.runtime.clone(), RUNTIME_SERVICE, method, req).await
    }

    async fn image_call<Req, Resp>(&self, method: &str, req: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        unary(self.image.clone(), IMAGE_SERVICE, method, req).await
    }
}

async fn unary<Req, Resp>(channel: Channel, service: &str, method: &str, req: Req) -> Result<Resp>
where
    Req: prost::Message + Send + Sync + 'static,
    Resp: prost::Message + Default + Send + Sync + 'static,
{
    let mut grpc = tonic::client::Grpc::new(channel);
    grpc.ready()
        .await
        .map_err(|e| Error::Unavailable(format!("cri service was not ready: {}", e)))?;
    let path = PathAndQuery::try_from(format!("{}{}", service, method))
        .map_err(|e| Error::InvalidArgument(format!("invalid method {}: {}", method, e)))?;
    let codec: ProstCodec<Req, Resp> = ProstCodec::default();
    let resp = grpc.unary(tonic::Request::new(req), path, codec).await?;
    Ok(resp.into_inner())
}

#[async_trait]
impl RuntimeService for CriClient {
    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let resp: RunPodSandboxResponse = self
            .runtime_call(
                "RunPodSandbox",
                RunPodSandboxRequest {
                    config: Some(config),
                    runtime_handler: runtime_handler.to_string(),
                },
            )
            .await?;
        Ok(resp.pod_sandbox_id)
    }

    async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let _: StopPodSandboxResponse = self
            .runtime_call(
                "StopPodSandbox",
                StopPodSandboxRequest {
                    pod_sandbox_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let _: RemovePodSandboxResponse = self
            .runtime_call(
                "RemovePodSandbox",
                RemovePodSandboxRequest {
                    pod_sandbox_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn pod_sandbox_status(
        &self,
        id: &str,
        verbose: bool,
    ) -> Result<PodSandboxStatusResponse> {
        self.runtime_call(
            "PodSandboxStatus",
            PodSandboxStatusRequest {
                pod_sandbox_id: id.to_string(),
                verbose,
            },
        )
        .await
    }

    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        let resp: ListPodSandboxResponse = self
            .runtime_call("ListPodSandbox", ListPodSandboxRequest { filter })
            .await?;
        Ok(resp.items)
    }

    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        sandbox_config: PodSandboxConfig,
    ) -> Result<String> {
        let resp: CreateContainerResponse = self
            .runtime_call(
                "CreateContainer",
                CreateContainerRequest {
                    pod_sandbox_id: pod_id.to_string(),
                    config: Some(config),
                    sandbox_config: Some(sandbox_config),
                },
            )
            .await?;
        Ok(resp.container_id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let _: StartContainerResponse = self
            .runtime_call(
                "StartContainer",
                StartContainerRequest {
                    container_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        let _: StopContainerResponse = self
            .runtime_call(
                "StopContainer",
                StopContainerRequest {
                    container_id: id.to_string(),
                    timeout,
                },
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let _: RemoveContainerResponse = self
            .runtime_call(
                "RemoveContainer",
                RemoveContainerRequest {
                    container_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        let resp: ListContainersResponse = self
            .runtime_call("ListContainers", ListContainersRequest { filter })
            .await?;
        Ok(resp.containers)
    }

    async fn container_status(&self, id: &str, verbose: bool) -> Result<ContainerStatusResponse> {
        self.runtime_call(
            "ContainerStatus",
            ContainerStatusRequest {
                container_id: id.to_string(),
                verbose,
            },
        )
        .await
    }

    async fn exec(&self, req: ExecRequest) -> Result<String> {
        let resp: ExecResponse = self.runtime_call("Exec", req).await?;
        Ok(resp.url)
    }

    async fn attach(&self, req: AttachRequest) -> Result<String> {
        let resp: AttachResponse = self.runtime_call("Attach", req).await?;
        Ok(resp.url)
    }
}

#[async_trait]
impl ImageService for CriClient {
    async fn list_images(&self) -> Result<Vec<Image>> {
        let resp: ListImagesResponse = self
            .image_call("ListImages", ListImagesRequest { filter: None })
            .await?;
        Ok(resp.images)
    }

    async fn image_status(&self, image: &str) -> Result<Option<Image>> {
        let resp: ImageStatusResponse = self
            .image_call(
                "ImageStatus",
                ImageStatusRequest {
                    image: Some(image_spec(image)),
                    verbose: false,
                },
            )
            .await?;
        Ok(resp.image)
    }

    async fn pull_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<String> {
        let resp: PullImageResponse = self
            .image_call(
                "PullImage",
                PullImageRequest {
                    image: Some(image_spec(image)),
                    auth,
                    sandbox_config: None,
                },
            )
            .await?;
        Ok(resp.image_ref)
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let _: RemoveImageResponse = self
            .image_call(
                "RemoveImage",
                RemoveImageRequest {
                    image: Some(image_spec(image)),
                },
            )
            .await?;
        Ok(())
    }
}
