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

//! In-memory backends for unit tests. Every call that changes state is
//! recorded so tests can assert on the sequence of runtime calls.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use podshim_common::{
    api::{
        containerd::{Descriptor, Envelope, Image as ContainerdImage, Info, Status},
        cri::*,
    },
    error::{Error, Result},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{
    Backend, ByteStream, ContentStore, EventService, EventStream, ImageService, ImageStore,
    RuntimeService,
};

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    clock: i64,
    sandboxes: Vec<(PodSandbox, PodSandboxConfig)>,
    containers: Vec<(Container, ContainerStatus)>,
    calls: Vec<String>,
    failing: HashSet<String>,
    removed_before_status: HashSet<String>,
}

impl RuntimeState {
    fn tick(&mut self) -> i64 {
        self.clock += 1_000;
        self.clock
    }

    fn record(&mut self, call: String) -> Result<()> {
        let failed = self.failing.contains(&call);
        self.calls.push(call.clone());
        if failed {
            return Err(Error::Other(anyhow::anyhow!("injected failure: {}", call)));
        }
        Ok(())
    }

    fn container_mut(&mut self, id: &str) -> Result<&mut (Container, ContainerStatus)> {
        self.containers
            .iter_mut()
            .find(|(c, _)| c.id == id)
            .ok_or_else(|| Error::NotFound(format!("container {} not found", id)))
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Makes the exact call string (as recorded in `calls`) fail.
    pub fn fail(&self, call: &str) {
        self.state.lock().unwrap().failing.insert(call.to_string());
    }

    /// Makes the container vanish once its status is asked for, as if it was
    /// removed right after being listed.
    pub fn remove_before_status(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .removed_before_status
            .insert(id.to_string());
    }

    pub fn sandbox_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.sandboxes.iter().map(|(s, _)| s.id.clone()).collect()
    }

    pub fn container_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.containers.iter().map(|(c, _)| c.id.clone()).collect()
    }

    pub fn sandbox_config(&self, id: &str) -> Option<PodSandboxConfig> {
        let state = self.state.lock().unwrap();
        state
            .sandboxes
            .iter()
            .find(|(s, _)| s.id == id)
            .map(|(_, c)| c.clone())
    }

    pub fn container(&self, id: &str) -> Option<Container> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .iter()
            .find(|(c, _)| c.id == id)
            .map(|(c, _)| c.clone())
    }

    /// Overwrites the annotations of a sandbox as if written by someone else.
    pub fn set_sandbox_annotations(&self, id: &str, annotations: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        if let Some((s, _)) = state.sandboxes.iter_mut().find(|(s, _)| s.id == id) {
            s.annotations = annotations;
        }
    }

    pub fn set_container_annotations(&self, id: &str, annotations: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        if let Ok((c, s)) = state.container_mut(id) {
            c.annotations = annotations.clone();
            s.annotations = annotations;
        }
    }

    /// Marks a container as exited with `exit_code`.
    pub fn exit_container(&self, id: &str, exit_code: i32) {
        let mut state = self.state.lock().unwrap();
        let now = state.tick();
        if let Ok((c, s)) = state.container_mut(id) {
            c.state = ContainerState::ContainerExited as i32;
            s.state = ContainerState::ContainerExited as i32;
            if s.started_at == 0 {
                s.started_at = now;
            }
            s.finished_at = now;
            s.exit_code = exit_code;
        }
    }

    pub fn set_container_state(&self, id: &str, container_state: ContainerState) {
        let mut state = self.state.lock().unwrap();
        if let Ok((c, s)) = state.container_mut(id) {
            c.state = container_state as i32;
            s.state = container_state as i32;
        }
    }
}

fn matches_labels(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl RuntimeService for FakeRuntime {
    async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("pod{}", state.next_id);
        state.record(format!("RunPodSandbox {}", id))?;
        let created_at = state.tick();
        let sandbox = PodSandbox {
            id: id.clone(),
            metadata: config.metadata.clone(),
            state: PodSandboxState::SandboxReady as i32,
            created_at,
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            runtime_handler: runtime_handler.to_string(),
        };
        state.sandboxes.push((sandbox, config));
        Ok(id)
    }

    async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("StopPodSandbox {}", id))?;
        if let Some((s, _)) = state.sandboxes.iter_mut().find(|(s, _)| s.id == id) {
            s.state = PodSandboxState::SandboxNotready as i32;
        }
        Ok(())
    }

    async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("RemovePodSandbox {}", id))?;
        state.sandboxes.retain(|(s, _)| s.id != id);
        state.containers.retain(|(c, _)| c.pod_sandbox_id != id);
        Ok(())
    }

    async fn pod_sandbox_status(
        &self,
        id: &str,
        verbose: bool,
    ) -> Result<PodSandboxStatusResponse> {
        let state = self.state.lock().unwrap();
        let (sandbox, config) = state
            .sandboxes
            .iter()
            .find(|(s, _)| s.id == id)
            .ok_or_else(|| Error::NotFound(format!("sandbox {} not found", id)))?;
        let mut info = HashMap::new();
        if verbose {
            let value = serde_json::json!({ "config": config });
            info.insert("info".to_string(), value.to_string());
        }
        Ok(PodSandboxStatusResponse {
            status: Some(PodSandboxStatus {
                id: sandbox.id.clone(),
                metadata: sandbox.metadata.clone(),
                state: sandbox.state,
                created_at: sandbox.created_at,
                labels: sandbox.labels.clone(),
                annotations: sandbox.annotations.clone(),
                runtime_handler: sandbox.runtime_handler.clone(),
                ..Default::default()
            }),
            info,
        })
    }

    async fn list_pod_sandbox(&self, filter: Option<PodSandboxFilter>) -> Result<Vec<PodSandbox>> {
        let state = self.state.lock().unwrap();
        let filter = filter.unwrap_or_default();
        Ok(state
            .sandboxes
            .iter()
            .map(|(s, _)| s)
            .filter(|s| filter.id.is_empty() || s.id == filter.id)
            .filter(|s| matches_labels(&s.labels, &filter.label_selector))
            .cloned()
            .collect())
    }

    async fn create_container(
        &self,
        pod_id: &str,
        config: ContainerConfig,
        _sandbox_config: PodSandboxConfig,
    ) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !state.sandboxes.iter().any(|(s, _)| s.id == pod_id) {
            return Err(Error::NotFound(format!("sandbox {} not found", pod_id)));
        }
        state.next_id += 1;
        let id = format!("ctr{}", state.next_id);
        state.record(format!("CreateContainer {}", id))?;
        let created_at = state.tick();
        let container = Container {
            id: id.clone(),
            pod_sandbox_id: pod_id.to_string(),
            metadata: config.metadata.clone(),
            image: config.image.clone(),
            image_ref: format!("sha256:{}", id),
            state: ContainerState::ContainerCreated as i32,
            created_at,
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
        };
        let status = ContainerStatus {
            id: id.clone(),
            metadata: config.metadata.clone(),
            state: ContainerState::ContainerCreated as i32,
            created_at,
            image: config.image.clone(),
            image_ref: container.image_ref.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
            mounts: config.mounts.clone(),
            log_path: config.log_path.clone(),
            ..Default::default()
        };
        state.containers.push((container, status));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("StartContainer {}", id))?;
        let now = state.tick();
        let (c, s) = state.container_mut(id)?;
        c.state = ContainerState::ContainerRunning as i32;
        s.state = ContainerState::ContainerRunning as i32;
        s.started_at = now;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("StopContainer {} {}", id, timeout))?;
        let now = state.tick();
        let (c, s) = state.container_mut(id)?;
        if c.state == ContainerState::ContainerRunning as i32 {
            c.state = ContainerState::ContainerExited as i32;
            s.state = ContainerState::ContainerExited as i32;
            s.finished_at = now;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("RemoveContainer {}", id))?;
        state.containers.retain(|(c, _)| c.id != id);
        Ok(())
    }

    async fn list_containers(&self, filter: Option<ContainerFilter>) -> Result<Vec<Container>> {
        let state = self.state.lock().unwrap();
        let filter = filter.unwrap_or_default();
        Ok(state
            .containers
            .iter()
            .map(|(c, _)| c)
            .filter(|c| filter.id.is_empty() || c.id == filter.id)
            .filter(|c| filter.pod_sandbox_id.is_empty() || c.pod_sandbox_id == filter.pod_sandbox_id)
            .filter(|c| matches_labels(&c.labels, &filter.label_selector))
            .cloned()
            .collect())
    }

    async fn container_status(&self, id: &str, verbose: bool) -> Result<ContainerStatusResponse> {
        let mut state = self.state.lock().unwrap();
        if state.removed_before_status.remove(id) {
            state.containers.retain(|(c, _)| c.id != id);
        }
        let (_, status) = state.container_mut(id)?;
        let mut info = HashMap::new();
        if verbose {
            info.insert("info".to_string(), format!("{{\"pid\":{}}}", 100));
        }
        Ok(ContainerStatusResponse {
            status: Some(status.clone()),
            info,
        })
    }

    async fn exec(&self, req: ExecRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.record(format!(
            "Exec {} {} tty={} stdin={} stderr={}",
            req.container_id,
            req.cmd.join(" "),
            req.tty,
            req.stdin,
            req.stderr
        ))?;
        Ok(format!("http://streaming/exec/{}", req.container_id))
    }

    async fn attach(&self, req: AttachRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.record(format!(
            "Attach {} tty={} stdin={} stderr={}",
            req.container_id, req.tty, req.stdin, req.stderr
        ))?;
        Ok(format!("http://streaming/attach/{}", req.container_id))
    }
}

#[derive(Default)]
pub struct FakeImages {
    images: Mutex<Vec<Image>>,
    calls: Mutex<Vec<String>>,
}

impl FakeImages {
    pub fn add(&self, image: Image) {
        self.images.lock().unwrap().push(image);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn image_matches(image: &Image, name: &str) -> bool {
    image.id == name
        || image.repo_tags.iter().any(|t| t == name)
        || image.repo_digests.iter().any(|d| d == name)
}

#[async_trait]
impl ImageService for FakeImages {
    async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.images.lock().unwrap().clone())
    }

    async fn image_status(&self, image: &str) -> Result<Option<Image>> {
        let images = self.images.lock().unwrap();
        Ok(images.iter().find(|i| image_matches(i, image)).cloned())
    }

    async fn pull_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<String> {
        self.calls.lock().unwrap().push(format!(
            "PullImage {} auth={}",
            image,
            auth.map(|a| a.username).unwrap_or_default()
        ));
        let id = format!("sha256:{:0>64}", image.len());
        let repo = image.split(':').next().unwrap_or(image);
        self.add(Image {
            id: id.clone(),
            repo_tags: vec![image.to_string()],
            repo_digests: vec![format!("{}@{}", repo, id)],
            size: 1024,
        });
        Ok(id)
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("RemoveImage {}", image));
        let mut images = self.images.lock().unwrap();
        let before = images.len();
        images.retain(|i| !image_matches(i, image));
        if images.len() == before {
            return Err(Error::NotFound(format!("image {} not found", image)));
        }
        Ok(())
    }
}

struct Blob {
    data: Vec<u8>,
    info: Info,
}

#[derive(Default)]
pub struct FakeContent {
    blobs: Mutex<HashMap<(String, String), Blob>>,
    statuses: Mutex<HashMap<String, Vec<Status>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeContent {
    pub fn insert(&self, ns: &str, digest: &str, data: &[u8], labels: HashMap<String, String>) {
        self.blobs.lock().unwrap().insert(
            (ns.to_string(), digest.to_string()),
            Blob {
                data: data.to_vec(),
                info: Info {
                    digest: digest.to_string(),
                    size: data.len() as i64,
                    labels,
                    ..Default::default()
                },
            },
        );
    }

    pub fn data(&self, ns: &str, digest: &str) -> Option<Vec<u8>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&(ns.to_string(), digest.to_string()))
            .map(|b| b.data.clone())
    }

    pub fn labels(&self, ns: &str, digest: &str) -> Option<HashMap<String, String>> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&(ns.to_string(), digest.to_string()))
            .map(|b| b.info.labels.clone())
    }

    pub fn set_statuses(&self, ns: &str, statuses: Vec<Status>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(ns.to_string(), statuses);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl ContentStore for FakeContent {
    async fn info(&self, ns: &str, digest: &str) -> Result<Info> {
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&(ns.to_string(), digest.to_string()))
            .map(|b| b.info.clone())
            .ok_or_else(|| Error::NotFound(format!("content {} not found", digest)))
    }

    async fn read(&self, ns: &str, digest: &str) -> Result<ByteStream> {
        let data = self
            .data(ns, digest)
            .ok_or_else(|| Error::NotFound(format!("content {} not found", digest)))?;
        // two chunks so consumers have to reassemble
        let mid = data.len() / 2;
        let chunks = vec![Ok(data[..mid].to_vec()), Ok(data[mid..].to_vec())];
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn write(
        &self,
        ns: &str,
        reference: &str,
        desc: &Descriptor,
        mut data: ByteStream,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("write {} {} {}", ns, reference, desc.digest));
        let mut buf = vec![];
        while let Some(chunk) = data.next().await {
            buf.extend(chunk?);
        }
        let key = (ns.to_string(), desc.digest.clone());
        if self.blobs.lock().unwrap().contains_key(&key) {
            return Ok(());
        }
        self.insert(ns, &desc.digest, &buf, labels);
        Ok(())
    }

    async fn update_labels(
        &self,
        ns: &str,
        digest: &str,
        labels: HashMap<String, String>,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("update {} {}", ns, digest));
        let mut blobs = self.blobs.lock().unwrap();
        let blob = blobs
            .get_mut(&(ns.to_string(), digest.to_string()))
            .ok_or_else(|| Error::NotFound(format!("content {} not found", digest)))?;
        blob.info.labels.extend(labels);
        Ok(())
    }

    async fn list_statuses(&self, ns: &str) -> Result<Vec<Status>> {
        let statuses = self.statuses.lock().unwrap();
        Ok(statuses.get(ns).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeImageStore {
    images: Mutex<HashMap<(String, String), ContainerdImage>>,
}

impl FakeImageStore {
    pub fn names(&self, ns: &str) -> Vec<String> {
        let images = self.images.lock().unwrap();
        let mut names = images
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[async_trait]
impl ImageStore for FakeImageStore {
    async fn get(&self, ns: &str, name: &str) -> Result<ContainerdImage> {
        let images = self.images.lock().unwrap();
        images
            .get(&(ns.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("image {} not found", name)))
    }

    async fn create(&self, ns: &str, image: ContainerdImage) -> Result<ContainerdImage> {
        let mut images = self.images.lock().unwrap();
        let key = (ns.to_string(), image.name.clone());
        if images.contains_key(&key) {
            return Err(Error::AlreadyExist(format!(
                "image {} already exists",
                image.name
            )));
        }
        images.insert(key, image.clone());
        Ok(image)
    }

    async fn update(&self, ns: &str, image: ContainerdImage) -> Result<ContainerdImage> {
        let mut images = self.images.lock().unwrap();
        match images.get_mut(&(ns.to_string(), image.name.clone())) {
            Some(existing) => {
                *existing = image.clone();
                Ok(image)
            }
            None => Err(Error::NotFound(format!("image {} not found", image.name))),
        }
    }

    async fn delete(&self, ns: &str, name: &str) -> Result<()> {
        let mut images = self.images.lock().unwrap();
        images
            .remove(&(ns.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("image {} not found", name)))
    }
}

/// Hands out one subscription per `push_sender` call.
#[derive(Default)]
pub struct FakeEvents {
    receivers: Mutex<Vec<UnboundedReceiver<Result<Envelope>>>>,
    subscriptions: Mutex<Vec<Vec<String>>>,
}

impl FakeEvents {
    /// Queues a new subscription and returns the sender feeding it.
    pub fn push_sender(&self) -> UnboundedSender<Result<Envelope>> {
        let (tx, rx) = unbounded_channel();
        self.receivers.lock().unwrap().push(rx);
        tx
    }

    pub fn subscriptions(&self) -> Vec<Vec<String>> {
        self.subscriptions.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventService for FakeEvents {
    async fn subscribe(&self, filters: Vec<String>) -> Result<EventStream> {
        self.subscriptions.lock().unwrap().push(filters);
        let mut receivers = self.receivers.lock().unwrap();
        if receivers.is_empty() {
            return Err(Error::Unavailable("no event subscription queued".to_string()));
        }
        let rx = receivers.remove(0);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[derive(Default, Clone)]
pub struct Fakes {
    pub runtime: Arc<FakeRuntime>,
    pub images: Arc<FakeImages>,
    pub content: Arc<FakeContent>,
    pub image_store: Arc<FakeImageStore>,
    pub events: Arc<FakeEvents>,
}

impl Fakes {
    pub fn backend(&self) -> Backend {
        Backend {
            runtime: self.runtime.clone(),
            images: self.images.clone(),
            content: self.content.clone(),
            image_store: self.image_store.clone(),
            events: self.events.clone(),
        }
    }
}
