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

use std::{collections::HashMap, path::PathBuf};

use log::{error, warn};
use serde_derive::Deserialize;

const INTERFACE_SUFFIX: &str = "-eth0";

#[derive(Debug, Default, Deserialize)]
struct CniResult {
    #[serde(default)]
    ips: Vec<IpConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct IpConfig {
    #[serde(default)]
    address: String,
}

/// Reads pod addresses from the result files the CNI plugins cache.
#[derive(Clone, Debug)]
pub struct CniResults {
    dir: PathBuf,
    prefix: String,
}

impl CniResults {
    pub fn new<P: Into<PathBuf>>(dir: P, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: format!("{}-", prefix),
        }
    }

    /// Returns the addresses of every pod with a cached result, keyed by
    /// sandbox id. Unreadable files are skipped.
    pub async fn pod_ips(&self) -> HashMap<String, Vec<String>> {
        let mut result = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "failed to read CNI results in {}: {}",
                    self.dir.display(),
                    e
                );
                return result;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!("failed to list CNI results in {}: {}", self.dir.display(), e);
                    break;
                }
            };
            let file_name = entry.file_name().to_string_lossy().to_string();
            let pod_id = match file_name
                .strip_prefix(&self.prefix)
                .and_then(|n| n.strip_suffix(INTERFACE_SUFFIX))
            {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => continue,
            };

            let content = match tokio::fs::read(entry.path()).await {
                Ok(c) => c,
                Err(e) => {
                    error!("failed to open CNI result {}: {}", file_name, e);
                    continue;
                }
            };
            let parsed: CniResult = match serde_json::from_slice(&content) {
                Ok(r) => r,
                Err(e) => {
                    error!("failed to decode CNI result {}: {}", file_name, e);
                    continue;
                }
            };
            let ips = parsed
                .ips
                .iter()
                .map(|ip| strip_prefix_len(&ip.address).to_string())
                .filter(|ip| !ip.is_empty())
                .collect();
            result.insert(pod_id, ips);
        }
        result
    }
}

fn strip_prefix_len(address: &str) -> &str {
    address.split_once('/').map(|(ip, _)| ip).unwrap_or(address)
}
