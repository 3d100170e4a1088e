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

//! Pushes an image from the content store to an OCI distribution registry.

use std::{sync::Arc, time::Duration};

use log::{debug, info};
use podshim_common::{
    api::{containerd::Descriptor, cri::AuthConfig},
    error::{Context, Error, Result},
};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde_derive::Deserialize;

use crate::{
    client::ContentStore,
    manifest::{self, ref_key},
    progress::{now_nanos, PushTracker, Status},
    reference::{Reference, DEFAULT_DOMAIN},
};

const DOCKER_REGISTRY_HOST: &str = "registry-1.docker.io";
const USER_AGENT: &str = concat!("podshim/", env!("CARGO_PKG_VERSION"));
const UPLOAD_UUID_HEADER: &str = "Docker-Upload-UUID";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Credentials {
    Anonymous,
    Basic { username: String, password: String },
    /// Pre-encoded `user:password`.
    EncodedBasic(String),
    /// OAuth2 refresh token traded for an access token.
    Identity(String),
    Bearer(String),
}

impl Credentials {
    /// Picks the credentials in `auth` that apply to `host`.
    fn for_host(auth: Option<&AuthConfig>, host: &str) -> Self {
        let auth = match auth {
            Some(a) => a,
            None => return Credentials::Anonymous,
        };
        if !auth.server_address.is_empty()
            && canonical_host(server_host(&auth.server_address)) != canonical_host(host)
        {
            return Credentials::Anonymous;
        }
        if !auth.registry_token.is_empty() {
            Credentials::Bearer(auth.registry_token.clone())
        } else if !auth.username.is_empty() {
            Credentials::Basic {
                username: auth.username.clone(),
                password: auth.password.clone(),
            }
        } else if !auth.identity_token.is_empty() {
            Credentials::Identity(auth.identity_token.clone())
        } else if !auth.auth.is_empty() {
            Credentials::EncodedBasic(auth.auth.clone())
        } else {
            Credentials::Anonymous
        }
    }

    fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Credentials::Basic { username, password } => req.basic_auth(username, Some(password)),
            Credentials::EncodedBasic(encoded) => {
                req.header(header::AUTHORIZATION, format!("Basic {}", encoded))
            }
            _ => req,
        }
    }
}

/// Host part of a server address, which may carry a scheme and a path.
fn server_host(address: &str) -> &str {
    let address = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address);
    address.split('/').next().unwrap_or(address)
}

/// Docker Hub is reachable under several names.
fn canonical_host(host: &str) -> &str {
    match host {
        "index.docker.io" | "registry-1.docker.io" => DEFAULT_DOMAIN,
        h => h,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Challenge {
    scheme: String,
    realm: String,
    service: String,
    scope: String,
}

fn parse_challenge(value: &str) -> Challenge {
    let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));
    let mut challenge = Challenge {
        scheme: scheme.to_lowercase(),
        ..Default::default()
    };
    for part in split_params(params) {
        let (key, val) = match part.trim().split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        let val = val.trim_matches('"').to_string();
        match key.trim() {
            "realm" => challenge.realm = val,
            "service" => challenge.service = val,
            "scope" => challenge.scope = val,
            _ => {}
        }
    }
    challenge
}

/// Splits challenge parameters on commas outside of quoted values.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = vec![];
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

pub struct RegistryPusher {
    client: Client,
    base_url: String,
    reference: Reference,
    credentials: Credentials,
    token: Option<String>,
    content: Arc<dyn ContentStore>,
    ns: String,
    tracker: Arc<PushTracker>,
}

impl RegistryPusher {
    pub fn new(
        reference: Reference,
        auth: Option<&AuthConfig>,
        content: Arc<dyn ContentStore>,
        ns: &str,
        tracker: Arc<PushTracker>,
    ) -> Result<Self> {
        let host = if reference.domain == DEFAULT_DOMAIN {
            DOCKER_REGISTRY_HOST
        } else {
            reference.domain.as_str()
        };
        let scheme = if is_local(host) { "http" } else { "https" };
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::Other(anyhow::anyhow!("failed to create http client: {}", e)))?;
        let credentials = Credentials::for_host(auth, &reference.domain);
        let token = match &credentials {
            Credentials::Bearer(t) => Some(t.clone()),
            _ => None,
        };
        Ok(Self {
            client,
            base_url: format!("{}://{}", scheme, host),
            reference,
            credentials,
            token,
            content,
            ns: ns.to_string(),
            tracker,
        })
    }

    /// Uploads every blob and manifest under `target`, children before the
    /// manifests that reference them. The target manifest is tagged with
    /// the reference's tag or digest.
    pub async fn push(&mut self, target: &Descriptor) -> Result<()> {
        let nodes = manifest::walk(self.content.as_ref(), &self.ns, target).await?;
        for desc in &nodes {
            self.tracker.add(&ref_key(desc));
        }
        for desc in nodes.iter().rev() {
            let is_target = desc.digest == target.digest;
            if manifest::is_manifest(&desc.media_type) || manifest::is_index(&desc.media_type) {
                let object = if is_target {
                    self.reference.object().to_string()
                } else {
                    desc.digest.clone()
                };
                self.push_manifest(desc, &object)
                    .await
                    .with_context(|| format!("failed to push manifest {}", desc.digest))?;
            } else {
                self.push_blob(desc)
                    .await
                    .with_context(|| format!("failed to push blob {}", desc.digest))?;
            }
        }
        info!("pushed {}", self.reference);
        Ok(())
    }

    async fn push_blob(&mut self, desc: &Descriptor) -> Result<()> {
        let key = ref_key(desc);
        let statuses = self.tracker.statuses();
        let started_at = now_nanos();
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, self.reference.path, desc.digest
        );
        let resp = self.send(Method::HEAD, &url, |r| r).await?;
        if resp.status().is_success() {
            debug!("blob {} already exists", desc.digest);
            statuses.set_status(
                &key,
                Status {
                    offset: desc.size,
                    total: desc.size,
                    started_at,
                    updated_at: now_nanos(),
                    upload_uuid: String::new(),
                },
            );
            return Ok(());
        }

        let url = format!("{}/v2/{}/blobs/uploads/", self.base_url, self.reference.path);
        let resp = self.send(Method::POST, &url, |r| r).await?;
        let resp = check_status(resp, StatusCode::ACCEPTED).await?;
        let location = header_value(&resp, header::LOCATION.as_str())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("upload session has no location")))?;
        let upload_uuid = header_value(&resp, UPLOAD_UUID_HEADER).unwrap_or_else(|| location.clone());
        statuses.set_status(
            &key,
            Status {
                offset: 0,
                total: desc.size,
                started_at,
                updated_at: now_nanos(),
                upload_uuid: upload_uuid.clone(),
            },
        );

        let data = manifest::read_all(self.content.as_ref(), &self.ns, &desc.digest).await?;
        statuses.set_status(
            &key,
            Status {
                offset: data.len() as i64,
                total: desc.size,
                started_at,
                updated_at: now_nanos(),
                upload_uuid,
            },
        );
        let url = upload_url(&self.base_url, &location, &desc.digest);
        let resp = self
            .send(Method::PUT, &url, |r| {
                r.header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        check_status(resp, StatusCode::CREATED).await?;
        statuses.set_status(
            &key,
            Status {
                offset: desc.size,
                total: desc.size,
                started_at,
                updated_at: now_nanos(),
                upload_uuid: String::new(),
            },
        );
        Ok(())
    }

    async fn push_manifest(&mut self, desc: &Descriptor, object: &str) -> Result<()> {
        let key = ref_key(desc);
        let started_at = now_nanos();
        let data = manifest::read_all(self.content.as_ref(), &self.ns, &desc.digest).await?;
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.reference.path, object
        );
        let media_type = desc.media_type.clone();
        let resp = self
            .send(Method::PUT, &url, |r| {
                r.header(header::CONTENT_TYPE, media_type.as_str())
                    .body(data.clone())
            })
            .await?;
        check_status(resp, StatusCode::CREATED).await?;
        self.tracker.statuses().set_status(
            &key,
            Status {
                offset: desc.size,
                total: desc.size,
                started_at,
                updated_at: now_nanos(),
                upload_uuid: String::new(),
            },
        );
        Ok(())
    }

    /// Sends a request, answering one authentication challenge.
    async fn send<F>(&mut self, method: Method, url: &str, build: F) -> Result<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let resp = self.request(method.clone(), url, &build).send().await.map_err(http_error)?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }
        let challenge = resp
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(parse_challenge)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("unauthorized without challenge")))?;
        if challenge.scheme == "bearer" {
            self.token = Some(self.fetch_token(&challenge).await?);
        } else if self.credentials == Credentials::Anonymous {
            return Err(Error::InvalidArgument(format!(
                "registry {} requires credentials",
                self.reference.domain
            )));
        }
        let resp = self.request(method, url, &build).send().await.map_err(http_error)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::InvalidArgument(format!(
                "unauthorized to push to {}",
                self.reference
            )));
        }
        Ok(resp)
    }

    fn request<F>(&self, method: Method, url: &str, build: &F) -> RequestBuilder
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let req = self.client.request(method, url);
        let req = match &self.token {
            Some(token) => req.bearer_auth(token),
            None => self.credentials.apply(req),
        };
        build(req)
    }

    async fn fetch_token(&self, challenge: &Challenge) -> Result<String> {
        let scope = if challenge.scope.is_empty() {
            format!("repository:{}:pull,push", self.reference.path)
        } else {
            challenge.scope.clone()
        };
        debug!("requesting token from {} for {}", challenge.realm, scope);
        let req = match &self.credentials {
            Credentials::Identity(refresh_token) => self.client.post(&challenge.realm).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("service", challenge.service.as_str()),
                ("scope", scope.as_str()),
                ("client_id", "podshim"),
            ]),
            c => c.apply(
                self.client
                    .get(&challenge.realm)
                    .query(&[("service", challenge.service.as_str()), ("scope", scope.as_str())]),
            ),
        };
        let resp = req.send().await.map_err(http_error)?;
        let resp = check_status(resp, StatusCode::OK).await?;
        let token: TokenResponse = resp.json().await.map_err(http_error)?;
        if !token.token.is_empty() {
            Ok(token.token)
        } else if !token.access_token.is_empty() {
            Ok(token.access_token)
        } else {
            Err(Error::Other(anyhow::anyhow!(
                "empty token from {}",
                challenge.realm
            )))
        }
    }
}

fn is_local(host: &str) -> bool {
    let name = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    name == "localhost" || name == "127.0.0.1" || name == "[::1]"
}

fn header_value(resp: &Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Completes an upload location, which may be relative and may already carry
/// query parameters, with the digest of the blob.
fn upload_url(base_url: &str, location: &str, digest: &str) -> String {
    let absolute = if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}{}", base_url, location)
    };
    let sep = if absolute.contains('?') { '&' } else { '?' };
    format!("{}{}digest={}", absolute, sep, digest)
}

async fn check_status(resp: Response, expected: StatusCode) -> Result<Response> {
    let status = resp.status();
    if status == expected || (expected == StatusCode::OK && status.is_success()) {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    let msg = format!("unexpected status {} from {}: {}", status, url, body.trim());
    Err(match status {
        StatusCode::NOT_FOUND => Error::NotFound(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST => {
            Error::InvalidArgument(msg)
        }
        _ => Error::Other(anyhow::anyhow!(msg)),
    })
}

fn http_error(e: reqwest::Error) -> Error {
    Error::Unavailable(format!("registry request failed: {}", e))
}
