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

//! Persists the caller's request and the derived CRI config inside the
//! annotations of the object they created.

use std::{collections::HashMap, marker::PhantomData};

use podshim_common::{
    api::{
        cri::{ContainerConfig, PodSandboxConfig},
        shim::{ContainerOptions, PodOptions},
    },
    error::{Error, Result},
    ANNOTATION_CONFIG_VERSION, ANNOTATION_CONTAINER_CONFIG, ANNOTATION_POD_CONFIG,
    ANNOTATION_USER_CONTAINER_CONFIG, ANNOTATION_USER_POD_CONFIG,
};
use serde::{de::DeserializeOwned, Serialize};

pub const CODEC_VERSION: &str = "v1";

pub struct ConfigCodec<O, D> {
    original_key: &'static str,
    derived_key: &'static str,
    _marker: PhantomData<fn() -> (O, D)>,
}

pub type PodCodec = ConfigCodec<PodOptions, PodSandboxConfig>;
pub type ContainerCodec = ConfigCodec<ContainerOptions, ContainerConfig>;

pub const POD_CODEC: PodCodec =
    ConfigCodec::new(ANNOTATION_USER_POD_CONFIG, ANNOTATION_POD_CONFIG);
pub const CONTAINER_CODEC: ContainerCodec =
    ConfigCodec::new(ANNOTATION_USER_CONTAINER_CONFIG, ANNOTATION_CONTAINER_CONFIG);

impl<O, D> ConfigCodec<O, D> {
    pub const fn new(original_key: &'static str, derived_key: &'static str) -> Self {
        Self {
            original_key,
            derived_key,
            _marker: PhantomData,
        }
    }
}

impl<O, D> ConfigCodec<O, D>
where
    O: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    /// Writes both values into `annotations`. Keys other than the reserved
    /// ones are left alone.
    pub fn encode(
        &self,
        original: &O,
        derived: &D,
        annotations: &mut HashMap<String, String>,
    ) -> Result<()> {
        let derived_json = serde_json::to_string(derived)
            .map_err(|e| anyhow::anyhow!("failed to marshal {}: {}", self.derived_key, e))?;
        let original_json = serde_json::to_string(original)
            .map_err(|e| anyhow::anyhow!("failed to marshal {}: {}", self.original_key, e))?;
        annotations.insert(self.derived_key.to_string(), derived_json);
        annotations.insert(self.original_key.to_string(), original_json);
        annotations.insert(
            ANNOTATION_CONFIG_VERSION.to_string(),
            CODEC_VERSION.to_string(),
        );
        Ok(())
    }

    pub fn decode(&self, annotations: &HashMap<String, String>) -> Result<(O, D)> {
        if let Some(v) = annotations.get(ANNOTATION_CONFIG_VERSION) {
            if v != CODEC_VERSION {
                return Err(Error::ConfigCorrupt(format!(
                    "unknown config version {}",
                    v
                )));
            }
        }
        let derived = self.decode_key(annotations, self.derived_key)?;
        let original = self.decode_key(annotations, self.original_key)?;
        Ok((original, derived))
    }

    /// Decodes only the derived config.
    pub fn decode_derived(&self, annotations: &HashMap<String, String>) -> Result<D> {
        self.decode(annotations).map(|(_, d)| d)
    }

    fn decode_key<T: DeserializeOwned>(
        &self,
        annotations: &HashMap<String, String>,
        key: &str,
    ) -> Result<T> {
        let value = annotations
            .get(key)
            .ok_or_else(|| Error::ConfigCorrupt(format!("annotation {} is missing", key)))?;
        serde_json::from_str(value)
            .map_err(|e| Error::ConfigCorrupt(format!("failed to parse {}: {}", key, e)))
    }
}
