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

use std::sync::Arc;

use log::{error, info};
use podshim_common::{
    api::{
        containerd::Image as ContainerdImage,
        cri::{AuthConfig, Image as CriImage},
        shim::{Image, TransferInfo},
    },
    error::{Context, Error, Result},
    signal::ExitSignal,
};
use tokio::sync::mpsc::Receiver;

use crate::{
    client::{ContentStore, ImageService, ImageStore},
    progress::{pull_progress, push_progress, PushJobs, PushTracker, StatusTracker},
    reference::Reference,
    registry::RegistryPusher,
};

pub struct ImageManager {
    images: Arc<dyn ImageService>,
    content: Arc<dyn ContentStore>,
    image_store: Arc<dyn ImageStore>,
    public_ns: String,
    jobs: Arc<PushJobs>,
    statuses: Arc<dyn StatusTracker>,
    exit: Arc<ExitSignal>,
}

fn to_image(image: CriImage) -> Image {
    Image {
        id: image.id,
        tags: image.repo_tags,
        digests: image.repo_digests,
        size: image.size,
    }
}

impl ImageManager {
    pub fn new(
        images: Arc<dyn ImageService>,
        content: Arc<dyn ContentStore>,
        image_store: Arc<dyn ImageStore>,
        public_ns: &str,
        statuses: Arc<dyn StatusTracker>,
        exit: Arc<ExitSignal>,
    ) -> Self {
        Self {
            images,
            content,
            image_store,
            public_ns: public_ns.to_string(),
            jobs: Arc::new(PushJobs::default()),
            statuses,
            exit,
        }
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let images = self.images.list_images().await?;
        Ok(images.into_iter().map(to_image).collect())
    }

    pub async fn get_image(&self, image: &str) -> Result<Image> {
        match self.images.image_status(image).await? {
            Some(i) => Ok(to_image(i)),
            None => Err(Error::NotFound(format!("image {} not found", image))),
        }
    }

    pub async fn pull_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<String> {
        self.images.pull_image(image, auth).await
    }

    pub async fn remove_image(&self, image: &str) -> Result<()> {
        self.images.remove_image(image).await
    }

    /// The containerd record of `image` in the public namespace, found by
    /// its first repo digest.
    async fn resolve(&self, image: &str) -> Result<ContainerdImage> {
        let found = self.get_image(image).await?;
        let digest = found.digests.first().ok_or_else(|| {
            Error::InvalidArgument(format!("image {} has no repo digest", image))
        })?;
        self.image_store.get(&self.public_ns, digest).await
    }

    pub async fn tag_image(&self, image: &str, tags: &[String]) -> Result<()> {
        let mut record = self.resolve(image).await?;
        for tag in tags {
            let normalized = Reference::parse_normalized(tag)?;
            record.name = normalized.to_string();
            self.image_store
                .create(&self.public_ns, record.clone())
                .await
                .with_context(|| format!("failed to tag {} as {}", image, tag))?;
            info!("tagged {} as {}", image, record.name);
        }
        Ok(())
    }

    /// Starts pushing `image` in the background. Progress is available from
    /// [`ImageManager::push_progress`] until the push ends.
    pub async fn push_image(&self, image: &str, auth: Option<AuthConfig>) -> Result<()> {
        let reference = Reference::parse_normalized(image)?;
        let record = self.resolve(image).await?;
        let target = record.target.ok_or_else(|| {
            Error::InvalidArgument(format!("image {} has no target", image))
        })?;

        let tracker = Arc::new(PushTracker::new(self.statuses.clone()));
        let mut pusher = RegistryPusher::new(
            reference,
            auth.as_ref(),
            self.content.clone(),
            &self.public_ns,
            tracker.clone(),
        )?;
        self.jobs.insert(image, tracker.clone());

        let jobs = self.jobs.clone();
        let image = image.to_string();
        tokio::spawn(async move {
            if let Err(e) = pusher.push(&target).await {
                error!("failed to push image {}: {}", image, e);
            }
            tracker.finish();
            jobs.remove(&image);
        });
        Ok(())
    }

    pub fn pull_progress(&self, image: &str) -> Receiver<Vec<TransferInfo>> {
        pull_progress(
            self.images.clone(),
            self.content.clone(),
            &self.public_ns,
            image,
            self.exit.clone(),
        )
    }

    pub fn push_progress(&self, image: &str) -> Receiver<Vec<TransferInfo>> {
        push_progress(self.jobs.clone(), image, self.exit.clone())
    }

    #[cfg(test)]
    fn pushing(&self, image: &str) -> bool {
        self.jobs.get(image).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use podshim_common::{
        api::{containerd::Image as ContainerdImage, cri::Image as CriImage},
        signal::ExitSignal,
    };

    use super::ImageManager;
    use crate::{
        client::{fake::Fakes, ImageStore},
        manifest::tests::seed_image,
        progress::MemoryTracker,
    };

    const PUBLIC: &str = "k8s.io";
    const DIGEST_NAME: &str = "docker.io/library/app@sha256:index";

    fn manager(fakes: &Fakes) -> ImageManager {
        let backend = fakes.backend();
        ImageManager::new(
            backend.images,
            backend.content,
            backend.image_store,
            PUBLIC,
            Arc::new(MemoryTracker::default()),
            Arc::new(ExitSignal::default()),
        )
    }

    async fn seed(fakes: &Fakes, tag: &str) {
        let target = seed_image(&fakes.content, PUBLIC);
        fakes.images.add(CriImage {
            id: "sha256:index".to_string(),
            repo_tags: vec![tag.to_string()],
            repo_digests: vec![DIGEST_NAME.to_string()],
            size: 42,
        });
        fakes
            .image_store
            .create(
                PUBLIC,
                ContainerdImage {
                    name: DIGEST_NAME.to_string(),
                    target: Some(target),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_get_and_list_images() {
        let fakes = Fakes::default();
        seed(&fakes, "docker.io/library/app:1").await;
        let images = manager(&fakes);

        let image = images.get_image("docker.io/library/app:1").await.unwrap();
        assert_eq!(image.id, "sha256:index");
        assert_eq!(image.digests, vec![DIGEST_NAME]);
        assert_eq!(image.size, 42);
        assert_eq!(images.list_images().await.unwrap(), vec![image]);
        assert!(images.get_image("absent").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_pull_and_remove_image() {
        let fakes = Fakes::default();
        let images = manager(&fakes);
        let image_ref = images.pull_image("busybox:1", None).await.unwrap();
        assert_eq!(images.get_image("busybox:1").await.unwrap().id, image_ref);
        images.remove_image("busybox:1").await.unwrap();
        assert!(images.get_image("busybox:1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_tag_image() {
        let fakes = Fakes::default();
        seed(&fakes, "docker.io/library/app:1").await;
        let images = manager(&fakes);

        images
            .tag_image(
                "docker.io/library/app:1",
                &["app:v2".to_string(), "ghcr.io/owner/app:1".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(
            fakes.image_store.names(PUBLIC),
            vec![
                "docker.io/library/app:v2",
                DIGEST_NAME,
                "ghcr.io/owner/app:1"
            ]
        );
        let tagged = fakes
            .image_store
            .get(PUBLIC, "ghcr.io/owner/app:1")
            .await
            .unwrap();
        assert_eq!(tagged.target.unwrap().digest, "sha256:index");

        // an existing tag is reported
        assert!(images
            .tag_image("docker.io/library/app:1", &["app:v2".to_string()])
            .await
            .unwrap_err()
            .is_already_exists());
        assert!(images
            .tag_image("docker.io/library/app:1", &["Bad Tag".to_string()])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_push_unknown_image() {
        let fakes = Fakes::default();
        let images = manager(&fakes);
        assert!(images
            .push_image("localhost:1/absent", None)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(!images.pushing("localhost:1/absent"));
    }

    #[tokio::test]
    async fn test_push_job_ends_on_failure() {
        let fakes = Fakes::default();
        seed(&fakes, "localhost:1/app:1").await;
        let images = manager(&fakes);

        images.push_image("localhost:1/app:1", None).await.unwrap();
        for _ in 0..500 {
            if !images.pushing("localhost:1/app:1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!images.pushing("localhost:1/app:1"));
    }
}
