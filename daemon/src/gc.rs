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

//! Removes sandboxes that no longer hold any container created by us.
//!
//! A pod is created with its first container, so a labelled sandbox without
//! labelled containers is garbage. Scans run on startup and whenever a
//! container is removed.

use std::{collections::HashMap, sync::Arc, time::Duration};

use log::{debug, error, warn};
use podshim_common::{
    api::cri::{ContainerFilter, PodSandboxFilter},
    error::{Error, Result},
    signal::ExitSignal,
    PRIVATE_NAMESPACE, UNLISTED_LABEL,
};
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

use crate::{client::RuntimeService, codec::CONTAINER_CODEC};

/// Requests a reconciler pass. Kicks sent while a pass is pending coalesce.
#[derive(Clone, Debug)]
pub struct Kicker {
    tx: Sender<()>,
}

impl Kicker {
    /// Returns a kicker that is already kicked, so the first pass runs as
    /// soon as the receiver is polled.
    pub fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = channel(1);
        let kicker = Self { tx };
        kicker.kick();
        (kicker, rx)
    }

    pub fn kick(&self) {
        match self.tx.try_send(()) {
            Ok(_) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => debug!("reconciler is gone, kick dropped"),
        }
    }
}

pub struct Reconciler {
    runtime: Arc<dyn RuntimeService>,
    kicker: Kicker,
    kicks: Receiver<()>,
    grace_period: Duration,
    retry_delay: Duration,
    exit: Arc<ExitSignal>,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn RuntimeService>,
        kicker: Kicker,
        kicks: Receiver<()>,
        grace_period: Duration,
        retry_delay: Duration,
        exit: Arc<ExitSignal>,
    ) -> Self {
        Self {
            runtime,
            kicker,
            kicks,
            grace_period,
            retry_delay,
            exit,
        }
    }

    /// Runs passes until the exit signal fires.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                kick = self.kicks.recv() => {
                    if kick.is_none() {
                        return;
                    }
                }
                _ = self.exit.wait() => return,
            }

            if let Err(e) = self.sweep().await {
                error!("failed to run pod gc: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(self.retry_delay) => self.kicker.kick(),
                    _ = self.exit.wait() => return,
                }
            }
        }
    }

    /// One pass: removes containers with unreadable configs right away, then
    /// after the grace period stops and removes every labelled sandbox that
    /// had no labelled container and still has none. Returns the last
    /// sandbox failure.
    pub async fn sweep(&self) -> Result<()> {
        let selector = HashMap::from([(UNLISTED_LABEL.to_string(), PRIVATE_NAMESPACE.to_string())]);
        let sandboxes = self
            .runtime
            .list_pod_sandbox(Some(PodSandboxFilter {
                label_selector: selector.clone(),
                ..Default::default()
            }))
            .await?;
        let mut counts: HashMap<String, usize> =
            sandboxes.into_iter().map(|s| (s.id, 0)).collect();

        let containers = self
            .runtime
            .list_containers(Some(ContainerFilter {
                label_selector: selector.clone(),
                ..Default::default()
            }))
            .await?;
        for container in containers {
            if let Err(e) = CONTAINER_CODEC.decode(&container.annotations) {
                warn!("removing container {} with corrupt config: {}", container.id, e);
                if let Err(e) = self.runtime.stop_container(&container.id, 0).await {
                    debug!("failed to stop container {}: {}", container.id, e);
                }
                if let Err(e) = self.runtime.remove_container(&container.id).await {
                    error!("failed to remove container {}: {}", container.id, e);
                }
                continue;
            }
            if let Some(count) = counts.get_mut(&container.pod_sandbox_id) {
                *count += 1;
            }
        }

        // a pod being created has its sandbox before its first container
        tokio::time::sleep(self.grace_period).await;

        let mut last_err: Option<Error> = None;
        for (id, count) in counts {
            if count > 0 {
                continue;
            }
            match self.has_live_container(&id, &selector).await {
                Ok(true) => {
                    debug!("pod {} gained a container, keeping it", id);
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("failed to list containers of pod {}: {}", id, e);
                    last_err = Some(e);
                    continue;
                }
            }
            debug!("removing pod {}", id);
            if let Err(e) = self.runtime.stop_pod_sandbox(&id).await {
                error!("failed to stop pod {}: {}", id, e);
                last_err = Some(e);
                continue;
            }
            if let Err(e) = self.runtime.remove_pod_sandbox(&id).await {
                error!("failed to remove pod {}: {}", id, e);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether sandbox `id` now holds a labelled container with a readable
    /// config.
    async fn has_live_container(
        &self,
        id: &str,
        selector: &HashMap<String, String>,
    ) -> Result<bool> {
        let containers = self
            .runtime
            .list_containers(Some(ContainerFilter {
                pod_sandbox_id: id.to_string(),
                label_selector: selector.clone(),
                ..Default::default()
            }))
            .await?;
        Ok(containers
            .iter()
            .any(|c| CONTAINER_CODEC.decode(&c.annotations).is_ok()))
    }
}
