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

use std::{
    io::ErrorKind,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
};

use lazy_static::lazy_static;
use log::{debug, info};
use md5::{Digest, Md5};
use podshim_common::{
    api::{
        cri::{Mount, MountPropagation},
        shim::Volume,
    },
    error::{Context, Error, Result},
};
use regex::Regex;

lazy_static! {
    static ref VOLUME_NAME: Regex = Regex::new("^[-a-zA-Z0-9]+$").unwrap();
    static ref ANONYMOUS_NAME: Regex = Regex::new("^[a-f0-9]{32}$").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeKind {
    HostPath,
    Named,
    Ephemeral,
}

/// Maps volume names onto directories below a base dir.
#[derive(Debug)]
pub struct VolumeResolver {
    base_dir: PathBuf,
}

impl VolumeResolver {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&base_dir)
            .with_context(|| format!("failed to create volume dir {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        validate(name)?;
        Ok(self.base_dir.join(name))
    }

    /// Rewrites the host path of a mount: an empty path gets a fresh
    /// anonymous volume, a relative one names a volume that is created on
    /// first use, an absolute one is kept.
    pub async fn setup(&self, mount: &Mount) -> Result<Mount> {
        let mut mnt = mount.clone();
        if mount.host_path.is_empty() {
            let volume = self.create("").await?;
            mnt.host_path = path_string(&self.resolve(&volume.id)?);
        } else if !mount.host_path.starts_with('/') {
            match self.get(&mount.host_path).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => match self.create(&mount.host_path).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }
            mnt.host_path = path_string(&self.resolve(&mount.host_path)?);
        }
        Ok(mnt)
    }

    pub async fn get(&self, name: &str) -> Result<Volume> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(Volume {
                id: name.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("volume {} not found", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create(&self, name: &str) -> Result<Volume> {
        let name = if name.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            name.to_string()
        };
        let path = self.resolve(&name)?;
        let mut builder = tokio::fs::DirBuilder::new();
        builder.mode(0o755);
        match builder.create(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExist(format!("volume {} already exists", name)))
            }
            Err(e) => {
                return Err(Error::from(e).context(format!("failed to create volume {}", name)))
            }
        }
        info!("created volume {}", name);
        Ok(Volume { id: name })
    }

    /// Removing a volume that does not exist succeeds.
    pub async fn remove(&self, name: &str, force: bool) -> Result<()> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(_) => {
                debug!("removed volume {} (force: {})", name, force);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).context(format!("failed to remove volume {}", name))),
        }
    }

    pub async fn list(&self) -> Result<Vec<Volume>> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut volumes = vec![];
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                volumes.push(Volume {
                    id: name.to_string(),
                });
            }
        }
        volumes.sort();
        Ok(volumes)
    }

    /// Returns a stable key for a host path and the kind of volume it is.
    pub fn classify(&self, path: &str) -> (String, VolumeKind) {
        if let Ok(rest) = Path::new(path).strip_prefix(&self.base_dir) {
            let name = rest
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            if ANONYMOUS_NAME.is_match(&name) {
                return (name, VolumeKind::Ephemeral);
            }
            if !name.is_empty() {
                return (name, VolumeKind::Named);
            }
        }
        (hex::encode(Md5::digest(path.as_bytes())), VolumeKind::HostPath)
    }
}

fn validate(name: &str) -> Result<()> {
    if !VOLUME_NAME.is_match(name) {
        return Err(Error::InvalidArgument("invalid volume name".to_string()));
    }
    Ok(())
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Parses `[src:]dest[:ro|rw]` mount specs.
pub fn parse_mounts(specs: &[String]) -> Result<Vec<Mount>> {
    specs.iter().map(|s| parse_mount(s)).collect()
}

fn parse_mount(spec: &str) -> Result<Mount> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host_path, container_path, readonly) = match parts.as_slice() {
        [dest] => ("", *dest, false),
        [src, dest] => (*src, *dest, false),
        [src, dest, "ro"] => (*src, *dest, true),
        [src, dest, "rw"] => (*src, *dest, false),
        [_, _, opt] => {
            return Err(Error::InvalidArgument(format!(
                "invalid mount option {} in {}",
                opt, spec
            )))
        }
        _ => {
            return Err(Error::InvalidArgument(format!(
                "invalid mount spec {}",
                spec
            )))
        }
    };
    if container_path.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "mount {} has no destination",
            spec
        )));
    }
    Ok(Mount {
        container_path: container_path.to_string(),
        host_path: host_path.to_string(),
        readonly,
        selinux_relabel: false,
        propagation: MountPropagation::PropagationPrivate as i32,
    })
}
