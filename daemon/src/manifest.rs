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

//! Image DAG traversal over the content store.

use std::collections::{HashMap, HashSet, VecDeque};

use futures::StreamExt;
use podshim_common::{
    api::containerd::{
        Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
    },
    error::{Context, Error, Result},
};
use serde_derive::Deserialize;

use crate::client::ContentStore;

pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    #[serde(default)]
    media_type: String,
    digest: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

impl From<OciDescriptor> for Descriptor {
    fn from(d: OciDescriptor) -> Self {
        Descriptor {
            media_type: d.media_type,
            digest: d.digest,
            size: d.size,
            annotations: d.annotations,
        }
    }
}

/// The fields shared by image manifests and indexes.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDoc {
    config: Option<OciDescriptor>,
    #[serde(default)]
    layers: Vec<OciDescriptor>,
    #[serde(default)]
    manifests: Vec<OciDescriptor>,
}

pub fn is_index(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

pub fn is_manifest(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

pub fn is_config(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_DOCKER_CONFIG || media_type == MEDIA_TYPE_OCI_CONFIG
}

pub fn is_layer(media_type: &str) -> bool {
    media_type.contains(".layer.") || media_type.contains("rootfs.diff")
}

/// Returns the progress key of a descriptor, `<kind>-<digest>`.
pub fn ref_key(desc: &Descriptor) -> String {
    let kind = if is_manifest(&desc.media_type) {
        "manifest"
    } else if is_index(&desc.media_type) {
        "index"
    } else if is_config(&desc.media_type) {
        "config"
    } else if is_layer(&desc.media_type) {
        "layer"
    } else {
        "unknown"
    };
    format!("{}-{}", kind, desc.digest)
}

/// Parses the children of a manifest or index. Other blobs have none.
pub fn children(desc: &Descriptor, data: &[u8]) -> Result<Vec<Descriptor>> {
    let manifest = is_manifest(&desc.media_type);
    if !manifest && !is_index(&desc.media_type) {
        return Ok(vec![]);
    }
    let doc: ManifestDoc = serde_json::from_slice(data).map_err(|e| {
        Error::InvalidArgument(format!("failed to parse {}: {}", desc.digest, e))
    })?;
    if manifest {
        let mut result: Vec<Descriptor> = doc.config.into_iter().map(Into::into).collect();
        result.extend(doc.layers.into_iter().map(Into::into));
        Ok(result)
    } else {
        Ok(doc.manifests.into_iter().map(Into::into).collect())
    }
}

pub async fn read_all(content: &dyn ContentStore, ns: &str, digest: &str) -> Result<Vec<u8>> {
    let mut stream = content.read(ns, digest).await?;
    let mut data = vec![];
    while let Some(chunk) = stream.next().await {
        data.extend(chunk?);
    }
    Ok(data)
}

/// Lists every node reachable from `target` in breadth first order, parents
/// before children, each digest once.
pub async fn walk(
    content: &dyn ContentStore,
    ns: &str,
    target: &Descriptor,
) -> Result<Vec<Descriptor>> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([target.clone()]);
    let mut result = vec![];
    while let Some(desc) = queue.pop_front() {
        if !seen.insert(desc.digest.clone()) {
            continue;
        }
        if is_manifest(&desc.media_type) || is_index(&desc.media_type) {
            let data = read_all(content, ns, &desc.digest)
                .await
                .with_context(|| format!("failed to read {}", desc.digest))?;
            queue.extend(children(&desc, &data)?);
        }
        result.push(desc);
    }
    Ok(result)
}
