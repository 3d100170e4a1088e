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

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use podshim_common::{
    api::containerd::*,
    error::{Error, Result},
};
use prost_types::FieldMask;
use tokio::sync::mpsc::channel;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    codec::ProstCodec,
    codegen::http::uri::PathAndQuery,
    metadata::{Ascii, MetadataValue},
    transport::Channel,
};

use crate::client::{ByteStream, ContentStore, EventService, EventStream, ImageStore};

const CONTENT_SERVICE: &str = "/containerd.services.content.v1.Content/";
const IMAGES_SERVICE: &str = "/containerd.services.images.v1.Images/";
const EVENTS_SERVICE: &str = "/containerd.services.events.v1.Events/";
const NAMESPACE_HEADER: &str = "containerd-namespace";

const WRITE_CHANNEL_SIZE: usize = 16;

#[derive(Clone)]
pub struct ContainerdClient {
    channel: Channel,
}

impl ContainerdClient {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    async fn grpc(&self) -> Result<tonic::client::Grpc<Channel>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::Unavailable(format!("containerd was not ready: {}", e)))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, ns: &str, service: &str, method: &str, req: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let resp = grpc
            .unary(namespaced(ns, req)?, path(service, method)?, codec)
            .await?;
        Ok(resp.into_inner())
    }
}

fn path(service: &str, method: &str) -> Result<PathAndQuery> {
    PathAndQuery::try_from(format!("{}{}", service, method))
        .map_err(|e| Error::InvalidArgument(format!("invalid method {}: {}", method, e)))
}

/// Wraps `msg` in a request scoped to the containerd namespace `ns`. An
/// empty namespace leaves the request unscoped.
fn namespaced<T>(ns: &str, msg: T) -> Result<tonic::Request<T>> {
    let mut req = tonic::Request::new(msg);
    if !ns.is_empty() {
        let value = ns
            .parse::<MetadataValue<Ascii>>()
            .map_err(|e| Error::InvalidArgument(format!("invalid namespace {}: {}", ns, e)))?;
        req.metadata_mut().insert(NAMESPACE_HEADER, value);
    }
    Ok(req)
}

fn label_mask(labels: &HashMap<String, String>) -> FieldMask {
    let mut paths = labels
        .keys()
        .map(|k| format!("labels.{}", k))
        .collect::<Vec<_>>();
    paths.sort();
    FieldMask { paths }
}

#[async_trait]
impl ContentStore for ContainerdClient {
    async fn info(&self, ns: &str, digest: &str) -> Result<Info> {
        let resp: InfoResponse = self
            .unary(
                ns,
                CONTENT_SERVICE,
                "Info",
                InfoRequest {
                    digest: digest.to_string(),
                },
            )
            .await?;
        resp.info
            .ok_or_else(|| Error::NotFound(format!("content {} not found", digest)))
    }

    async fn read(&self, ns: &str, digest: &str) -> Result<ByteStream> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<ReadContentRequest, ReadContentResponse> = ProstCodec::default();
        let req = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let resp = grpc
            .server_streaming(namespaced(ns, req)?, path(CONTENT_SERVICE, "Read")?, codec)
            .await?;
        let stream = resp
            .into_inner()
            .map(|r| r.map(|chunk| chunk.data).map_err(Error::from));
        Ok(stream.boxed())
    }

    async fn write(
        &self,
        ns: &str,
        reference: &str,
        desc: &Descriptor,
        data: ByteStream,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let (tx, rx) = channel::<WriteContentRequest>(WRITE_CHANNEL_SIZE);
        let reference = reference.to_string();
        let total = desc.size;
        let expected = desc.digest.clone();
        let feeder = tokio::spawn(async move {
            let mut data = data;
            let mut offset = 0i64;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                let len = chunk.len() as i64;
                let req = WriteContentRequest {
                    action: WriteAction::Write as i32,
                    r#ref: reference.clone(),
                    total,
                    expected: expected.clone(),
                    offset,
                    data: chunk,
                    labels: HashMap::new(),
                };
                offset += len;
                if tx.send(req).await.is_err() {
                    return Err(Error::Unavailable(format!(
                        "content writer {} closed",
                        reference
                    )));
                }
            }
            let commit = WriteContentRequest {
                action: WriteAction::Commit as i32,
                r#ref: reference.clone(),
                total,
                expected,
                offset,
                data: vec![],
                labels,
            };
            if tx.send(commit).await.is_err() {
                return Err(Error::Unavailable(format!(
                    "content writer {} closed before commit",
                    reference
                )));
            }
            Ok(())
        });

        let result = async {
            let mut grpc = self.grpc().await?;
            let codec: ProstCodec<WriteContentRequest, WriteContentResponse> =
                ProstCodec::default();
            let resp = grpc
                .streaming(
                    namespaced(ns, ReceiverStream::new(rx))?,
                    path(CONTENT_SERVICE, "Write")?,
                    codec,
                )
                .await?;
            let mut responses = resp.into_inner();
            while let Some(resp) = responses.message().await? {
                if resp.action == WriteAction::Commit as i32 {
                    debug!("committed content {}", resp.digest);
                }
            }
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => feeder
                .await
                .map_err(|e| anyhow!("content writer task failed: {}", e))?,
            Err(e) if e.is_already_exists() => {
                feeder.abort();
                Ok(())
            }
            Err(e) => {
                feeder.abort();
                Err(e)
            }
        }
    }

    async fn update_labels(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        let update_mask = label_mask(&labels);
        let _: UpdateResponse = self
            .unary(
                ns,
                CONTENT_SERVICE,
                "Update",
                UpdateRequest {
                    info: Some(Info {
                        digest: digest.to_string(),
                        labels,
                        ..Default::default()
                    }),
                    update_mask: Some(update_mask),
                },
            )
            .await?;
        Ok(())
    }

    async fn list_statuses(&self, ns: &str) -> Result<Vec<Status>> {
        let resp: ListStatusesResponse = self
            .unary(
                ns,
                CONTENT_SERVICE,
                "ListStatuses",
                ListStatusesRequest { filters: vec![] },
            )
            .await?;
        Ok(resp.statuses)
    }
}

#[async_trait]
impl ImageStore for ContainerdClient {
    async fn get(&self, ns: &str, name: &str) -> Result<Image> {
        let resp: GetImageResponse = self
            .unary(
                ns,
                IMAGES_SERVICE,
                "Get",
                GetImageRequest {
                    name: name.to_string(),
                },
            )
            .await?;
        resp.image
            .ok_or_else(|| Error::NotFound(format!("image {} not found", name)))
    }

    async fn create(&self, ns: &str, image: Image) -> Result<Image> {
        let name = image.name.clone();
        let resp: CreateImageResponse = self
            .unary(
                ns,
                IMAGES_SERVICE,
                "Create",
                CreateImageRequest { image: Some(image) },
            )
            .await?;
        resp.image
            .ok_or_else(|| anyhow!("containerd returned no image for {}", name).into())
    }

    async fn update(&self, ns: &str, image: Image) -> Result<Image> {
        let name = image.name.clone();
        let resp: UpdateImageResponse = self
            .unary(
                ns,
                IMAGES_SERVICE,
                "Update",
                UpdateImageRequest {
                    image: Some(image),
                    update_mask: None,
                },
            )
            .await?;
        resp.image
            .ok_or_else(|| anyhow!("containerd returned no image for {}", name).into())
    }

    async fn delete(&self, ns: &str, name: &str) -> Result<()> {
        let _: () = self
            .unary(
                ns,
                IMAGES_SERVICE,
                "Delete",
                DeleteImageRequest {
                    name: name.to_string(),
                    sync: false,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EventService for ContainerdClient {
    async fn subscribe(&self, filters: Vec<String>) -> Result<EventStream> {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<SubscribeRequest, Envelope> = ProstCodec::default();
        let resp = grpc
            .server_streaming(
                namespaced("", SubscribeRequest { filters })?,
                path(EVENTS_SERVICE, "Subscribe")?,
                codec,
            )
            .await?;
        Ok(resp.into_inner().map(|r| r.map_err(Error::from)).boxed())
    }
}
