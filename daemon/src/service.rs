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

//! The facade every transport calls into.
//!
//! A [`ContainerService`] exists from startup on, but fails every call with
//! [`Error::NotReady`] until [`ContainerService::init`] attached a backend.

use std::sync::Arc;

use log::{debug, error};
use podshim_common::{
    api::{
        cri::AuthConfig,
        shim::{
            AttachOptions, BatchReport, ContainerOptions, Event, ExecOptions,
            GetContainerResponse, Image, LogEntry, LogOptions, Pod, PodOptions, StreamResponse,
            TransferInfo, Volume,
        },
    },
    error::{Context, Error, Result},
    signal::ExitSignal,
};
use tokio::sync::{mpsc::Receiver, OnceCell};
use tracing::instrument;

use crate::{
    client::{Backend, EventService},
    config::Config,
    container::ContainerManager,
    events,
    gc::Kicker,
    image::ImageManager,
    names,
    network::CniResults,
    pod::PodTranslator,
    progress::MemoryTracker,
    volume::VolumeResolver,
};

struct Engine {
    pods: Arc<PodTranslator>,
    containers: ContainerManager,
    images: ImageManager,
    volumes: Arc<VolumeResolver>,
    events: Arc<dyn EventService>,
}

pub struct ContainerService {
    engine: OnceCell<Engine>,
    exit: Arc<ExitSignal>,
}

/// Logs a failed call before handing the result on.
fn logged<T>(op: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("{} failed: {}", op, e);
    }
    result
}

impl ContainerService {
    pub fn new(exit: Arc<ExitSignal>) -> Self {
        Self {
            engine: OnceCell::new(),
            exit,
        }
    }

    /// Attaches the backend. Only the first call has an effect.
    pub fn init(&self, backend: Backend, config: &Config, gc: Kicker) -> Result<()> {
        let volumes = Arc::new(VolumeResolver::new(&config.daemon.volumes)?);
        let network = CniResults::new(&config.daemon.cni_results, &config.daemon.cni_prefix);
        let pods = Arc::new(PodTranslator::new(
            backend.runtime.clone(),
            volumes.clone(),
            &config.daemon.pod_logs,
            network,
        ));
        let containers = ContainerManager::new(
            backend.runtime.clone(),
            pods.clone(),
            gc,
            self.exit.clone(),
        );
        let images = ImageManager::new(
            backend.images.clone(),
            backend.content.clone(),
            backend.image_store.clone(),
            &config.containerd.public_namespace,
            Arc::new(MemoryTracker::default()),
            self.exit.clone(),
        );
        let engine = Engine {
            pods,
            containers,
            images,
            volumes,
            events: backend.events,
        };
        if self.engine.set(engine).is_err() {
            debug!("container service already initialized");
        }
        Ok(())
    }

    fn engine(&self) -> Result<&Engine> {
        self.engine.get().ok_or(Error::NotReady)
    }

    #[instrument(skip_all)]
    pub async fn create_pod(&self, name: &str, opts: PodOptions) -> Result<String> {
        debug!("create pod {}", name);
        let result = async {
            self.engine()?
                .pods
                .create_pod(name, opts)
                .await
                .with_context(|| format!("failed to create pod {}", name))
        }
        .await;
        logged("CreatePod", result)
    }

    #[instrument(skip_all)]
    pub async fn create_container(
        &self,
        pod_id: &str,
        image: &str,
        mut opts: ContainerOptions,
    ) -> Result<String> {
        if opts.name.is_empty() {
            opts.name = names::random();
        }
        debug!("create container {} in pod {}", opts.name, pod_id);
        let name = opts.name.clone();
        let result = async {
            self.engine()?
                .pods
                .create_container(pod_id, image, opts)
                .await
                .with_context(|| format!("failed to create container {}", name))
        }
        .await;
        logged("CreateContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn list_pods(&self) -> Result<Vec<Pod>> {
        debug!("list pods");
        let result = async {
            self.engine()?
                .pods
                .list_pods()
                .await
                .context("failed to list pods")
        }
        .await;
        logged("ListPods", result)
    }

    #[instrument(skip_all)]
    pub async fn get_container(&self, name: &str) -> Result<GetContainerResponse> {
        debug!("get container {}", name);
        let result = async { self.engine()?.containers.get_container(name).await }.await;
        logged("GetContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn start_container(&self, name: &str) -> Result<()> {
        debug!("start container {}", name);
        let result = async {
            self.engine()?
                .containers
                .start_container(name)
                .await
                .with_context(|| format!("failed to start container {}", name))
        }
        .await;
        logged("StartContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn stop_container(&self, name: &str, timeout: i64) -> Result<()> {
        debug!("stop container {} with timeout {}", name, timeout);
        let result = async {
            self.engine()?
                .containers
                .stop_container(name, timeout)
                .await
                .with_context(|| format!("failed to stop container {}", name))
        }
        .await;
        logged("StopContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        debug!("remove container {}", name);
        let result = async {
            self.engine()?
                .containers
                .remove_container(name)
                .await
                .with_context(|| format!("failed to remove container {}", name))
        }
        .await;
        logged("RemoveContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn stop_containers(&self, names: &[String], timeout: i64) -> Result<BatchReport> {
        debug!("stop containers {:?}", names);
        let engine = self.engine()?;
        let report = engine.containers.stop_containers(names, timeout).await;
        if let Err(e) = report.check() {
            error!("StopContainers failed: {}", e);
        }
        Ok(report)
    }

    #[instrument(skip_all)]
    pub async fn remove_containers(&self, names: &[String]) -> Result<BatchReport> {
        debug!("remove containers {:?}", names);
        let engine = self.engine()?;
        let report = engine.containers.remove_containers(names).await;
        if let Err(e) = report.check() {
            error!("RemoveContainers failed: {}", e);
        }
        Ok(report)
    }

    #[instrument(skip_all)]
    pub async fn exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<StreamResponse> {
        debug!("exec {:?} in container {}", cmd, name);
        let result = async {
            self.engine()?
                .containers
                .exec(name, cmd, opts)
                .await
                .with_context(|| format!("failed to exec in container {}", name))
        }
        .await;
        logged("Exec", result)
    }

    #[instrument(skip_all)]
    pub async fn attach(&self, name: &str, opts: AttachOptions) -> Result<StreamResponse> {
        debug!("attach to container {}", name);
        let result = async {
            self.engine()?
                .containers
                .attach(name, opts)
                .await
                .with_context(|| format!("failed to attach to container {}", name))
        }
        .await;
        logged("Attach", result)
    }

    #[instrument(skip_all)]
    pub async fn log_container(&self, name: &str, opts: LogOptions) -> Result<Receiver<LogEntry>> {
        debug!("logs of container {}", name);
        let result = async {
            self.engine()?
                .containers
                .log_container(name, opts)
                .await
                .with_context(|| format!("failed to get logs of container {}", name))
        }
        .await;
        logged("LogContainer", result)
    }

    #[instrument(skip_all)]
    pub async fn list_images(&self) -> Result<Vec<Image>> {
        debug!("list images");
        let result = async {
            self.engine()?
                .images
                .list_images()
                .await
                .context("failed to list images")
        }
        .await;
        logged("ListImages", result)
    }

    #[instrument(skip_all)]
    pub async fn get_image(&self, image: &str) -> Result<Image> {
        debug!("get image {}", image);
        let result = async { self.engine()?.images.get_image(image).await }.await;
        logged("GetImage", result)
    }

    #[instrument(skip_all)]
    pub async fn pull_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<String> {
        debug!("pull image {}", image);
        let result = async {
            self.engine()?
                .images
                .pull_image(image, auth)
                .await
                .with_context(|| format!("failed to pull image {}", image))
        }
        .await;
        logged("PullImage", result)
    }

    #[instrument(skip_all)]
    pub async fn push_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<()> {
        debug!("push image {}", image);
        let result = async {
            self.engine()?
                .images
                .push_image(image, auth)
                .await
                .with_context(|| format!("failed to push image {}", image))
        }
        .await;
        logged("PushImage", result)
    }

    #[instrument(skip_all)]
    pub async fn tag_image(&self, image: &str, tags: &[String]) -> Result<()> {
        debug!("tag image {} as {:?}", image, tags);
        let result = async {
            self.engine()?
                .images
                .tag_image(image, tags)
                .await
                .with_context(|| format!("failed to tag image {}", image))
        }
        .await;
        logged("TagImage", result)
    }

    #[instrument(skip_all)]
    pub async fn remove_image(&self, image: &str) -> Result<()> {
        debug!("remove image {}", image);
        let result = async {
            self.engine()?
                .images
                .remove_image(image)
                .await
                .with_context(|| format!("failed to remove image {}", image))
        }
        .await;
        logged("RemoveImage", result)
    }

    #[instrument(skip_all)]
    pub fn pull_progress(&self, image: &str) -> Result<Receiver<Vec<TransferInfo>>> {
        debug!("pull progress of {}", image);
        logged(
            "PullProgress",
            self.engine().map(|e| e.images.pull_progress(image)),
        )
    }

    #[instrument(skip_all)]
    pub fn push_progress(&self, image: &str) -> Result<Receiver<Vec<TransferInfo>>> {
        debug!("push progress of {}", image);
        logged(
            "PushProgress",
            self.engine().map(|e| e.images.push_progress(image)),
        )
    }

    #[instrument(skip_all)]
    pub async fn events(&self) -> Result<Receiver<Event>> {
        debug!("subscribe events");
        let result = async {
            let engine = self.engine()?;
            events::subscribe(engine.events.clone(), self.exit.clone())
                .await
                .context("failed to subscribe events")
        }
        .await;
        logged("Events", result)
    }

    #[instrument(skip_all)]
    pub async fn create_volume(&self, name: &str) -> Result<Volume> {
        debug!("create volume {}", name);
        let result = async {
            self.engine()?
                .volumes
                .create(name)
                .await
                .with_context(|| format!("failed to create volume {}", name))
        }
        .await;
        logged("CreateVolume", result)
    }

    #[instrument(skip_all)]
    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        debug!("list volumes");
        let result = async {
            self.engine()?
                .volumes
                .list()
                .await
                .context("failed to list volumes")
        }
        .await;
        logged("ListVolumes", result)
    }

    #[instrument(skip_all)]
    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        debug!("remove volume {}", name);
        let result = async {
            self.engine()?
                .volumes
                .remove(name, force)
                .await
                .with_context(|| format!("failed to remove volume {}", name))
        }
        .await;
        logged("RemoveVolume", result)
    }

    #[instrument(skip_all)]
    pub async fn remove_volumes(&self, names: &[String], force: bool) -> Result<BatchReport> {
        debug!("remove volumes {:?}", names);
        let engine = self.engine()?;
        let mut report = BatchReport::default();
        for name in names {
            let result = engine
                .volumes
                .remove(name, force)
                .await
                .with_context(|| format!("failed to remove volume {}", name));
            report.record(name, result);
        }
        if let Err(e) = report.check() {
            error!("RemoveVolumes failed: {}", e);
        }
        Ok(report)
    }
}
