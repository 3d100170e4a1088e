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

//! Copies images created in the private (build) namespace into the public
//! namespace the CRI runtime reads from.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, warn};
use podshim_common::{
    api::containerd::{
        events::{ImageCreate, ImageUpdate, IMAGE_CREATE, IMAGE_UPDATE},
        type_name, Descriptor, Envelope,
    },
    error::{Context, Error, Result},
    signal::ExitSignal,
};
use prost::Message;

use crate::{
    client::{ContentStore, EventService, ImageStore},
    manifest,
};

pub const IMAGE_TOPIC_FILTER: &str = r#"topic~="/images/""#;

pub struct NamespaceImageSync {
    content: Arc<dyn ContentStore>,
    images: Arc<dyn ImageStore>,
    events: Arc<dyn EventService>,
    private_ns: String,
    public_ns: String,
    retry_delay: Duration,
    exit: Arc<ExitSignal>,
}

impl NamespaceImageSync {
    pub fn new(
        content: Arc<dyn ContentStore>,
        images: Arc<dyn ImageStore>,
        events: Arc<dyn EventService>,
        private_ns: &str,
        public_ns: &str,
        retry_delay: Duration,
        exit: Arc<ExitSignal>,
    ) -> Self {
        Self {
            content,
            images,
            events,
            private_ns: private_ns.to_string(),
            public_ns: public_ns.to_string(),
            retry_delay,
            exit,
        }
    }

    /// Follows image events until the exit signal fires, subscribing again
    /// whenever the subscription breaks.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.listen() => {}
                _ = self.exit.wait() => return,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = self.exit.wait() => return,
            }
        }
    }

    async fn listen(&self) {
        let mut stream = match self
            .events
            .subscribe(vec![IMAGE_TOPIC_FILTER.to_string()])
            .await
        {
            Ok(s) => s,
            Err(e) => {
                error!("failed to subscribe image events: {}", e);
                return;
            }
        };
        info!("syncing images from {} to {}", self.private_ns, self.public_ns);

        while let Some(envelope) = stream.next().await {
            let envelope = match envelope {
                Ok(e) => e,
                Err(e) => {
                    error!("image event subscription broken: {}", e);
                    return;
                }
            };
            if envelope.namespace != self.private_ns {
                continue;
            }
            if let Err(e) = self.handle_event(&envelope).await {
                error!("failed to handle image event {}: {}", envelope.topic, e);
            }
        }
        warn!("image event subscription closed");
    }

    async fn handle_event(&self, envelope: &Envelope) -> Result<()> {
        let any = match &envelope.event {
            Some(a) => a,
            None => return Ok(()),
        };
        let name = match type_name(any) {
            IMAGE_CREATE => ImageCreate::decode(any.value.as_slice()).map(|e| e.name),
            IMAGE_UPDATE => ImageUpdate::decode(any.value.as_slice()).map(|e| e.name),
            _ => return Ok(()),
        }
        .map_err(|e| Error::InvalidArgument(format!("failed to decode {}: {}", any.type_url, e)))?;
        debug!("image event {} for {}", envelope.topic, name);
        self.sync_image(&name)
            .await
            .with_context(|| format!("failed to sync image {}", name))
    }

    /// Copies every blob of the image and then the image record. Blobs that
    /// already exist are not written again; an existing record is updated to
    /// the new target.
    pub async fn sync_image(&self, name: &str) -> Result<()> {
        let mut image = self.images.get(&self.private_ns, name).await?;
        let target = image
            .target
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("image {} has no target", name)))?;

        for desc in manifest::walk(self.content.as_ref(), &self.private_ns, &target).await? {
            self.copy_blob(name, &desc)
                .await
                .with_context(|| format!("failed to copy {}", desc.digest))?;
        }

        image.created_at = None;
        image.updated_at = None;
        let existing = image.clone();
        match self.images.create(&self.public_ns, image).await {
            Ok(_) => {
                info!("synced image {} to {}", name, self.public_ns);
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                self.images.update(&self.public_ns, existing).await?;
                info!("updated image {} in {}", name, self.public_ns);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn copy_blob(&self, reference: &str, desc: &Descriptor) -> Result<()> {
        let source = self.content.info(&self.private_ns, &desc.digest).await?;
        match self.content.info(&self.public_ns, &desc.digest).await {
            Ok(existing) => {
                let missing = missing_labels(&source.labels, &existing.labels);
                if !missing.is_empty() {
                    debug!("updating labels of {}", desc.digest);
                    self.content
                        .update_labels(&self.public_ns, &desc.digest, missing)
                        .await?;
                }
                return Ok(());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let data = self.content.read(&self.private_ns, &desc.digest).await?;
        self.content
            .write(&self.public_ns, reference, desc, data, source.labels)
            .await
    }
}

/// Labels of `source` that `dest` lacks or holds with another value.
fn missing_labels(
    source: &HashMap<String, String>,
    dest: &HashMap<String, String>,
) -> HashMap<String, String> {
    source
        .iter()
        .filter(|(k, v)| dest.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
