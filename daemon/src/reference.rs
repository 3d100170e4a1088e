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

//! Docker style image references, `[domain/]path[:tag][@digest]`.

use std::fmt::{Display, Formatter};

use lazy_static::lazy_static;
use podshim_common::error::{Error, Result};
use regex::Regex;

pub const DEFAULT_DOMAIN: &str = "docker.io";
const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

lazy_static! {
    static ref PATH_COMPONENT: Regex =
        Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*$").unwrap();
    static ref DOMAIN: Regex = Regex::new(
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?))*(?::[0-9]+)?$"
    )
    .unwrap();
    static ref TAG: Regex = Regex::new(r"^[\w][\w.-]{0,127}$").unwrap();
    static ref DIGEST: Regex =
        Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[0-9a-fA-F]{32,}$").unwrap();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// Parses and normalizes a reference: the default domain and the
    /// `library/` prefix are filled in, and `latest` is used when neither a
    /// tag nor a digest is given. A digest wins over a tag.
    pub fn parse_normalized(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidArgument(format!("invalid reference {}: {}", s, why));
        if s.is_empty() {
            return Err(invalid("empty"));
        }

        let (name, digest) = match s.split_once('@') {
            Some((n, d)) => {
                if !DIGEST.is_match(d) {
                    return Err(invalid("bad digest"));
                }
                (n, Some(d.to_string()))
            }
            None => (s, None),
        };

        // a colon after the last slash starts the tag
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let (n, t) = name.split_at(last_slash + i);
                let t = &t[1..];
                if !TAG.is_match(t) {
                    return Err(invalid("bad tag"));
                }
                (n, Some(t.to_string()))
            }
            None => (name, None),
        };

        let (domain, path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.')
                    || first.contains(':')
                    || first == "localhost"
                    || first.chars().any(|c| c.is_ascii_uppercase()) =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };
        let domain = if domain == LEGACY_DEFAULT_DOMAIN {
            DEFAULT_DOMAIN.to_string()
        } else {
            domain
        };
        if !DOMAIN.is_match(&domain) {
            return Err(invalid("bad domain"));
        }
        if path.split('/').any(|c| !PATH_COMPONENT.is_match(c)) {
            return Err(invalid("repository name must be lowercase alphanumerics"));
        }
        let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
            format!("{}{}", OFFICIAL_REPO_PREFIX, path)
        } else {
            path
        };

        let tag = match (&digest, tag) {
            (Some(_), _) => None,
            (None, Some(t)) => Some(t),
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };
        Ok(Self {
            domain,
            path,
            tag,
            digest,
        })
    }

    /// The tag or digest addressing the manifest.
    pub fn object(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Reference;

    #[test]
    fn test_normalize() {
        let cases = [
            ("nginx", "docker.io/library/nginx:latest"),
            ("nginx:1.25", "docker.io/library/nginx:1.25"),
            ("user/app", "docker.io/user/app:latest"),
            ("index.docker.io/user/app:v1", "docker.io/user/app:v1"),
            ("ghcr.io/owner/repo:v1", "ghcr.io/owner/repo:v1"),
            ("localhost/app", "localhost/app:latest"),
            ("localhost:5000/team/app:dev", "localhost:5000/team/app:dev"),
            (
                "nginx:1.25@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
                "docker.io/library/nginx@sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef",
            ),
        ];
        for (input, expected) in cases {
            assert_eq!(
                Reference::parse_normalized(input).unwrap().to_string(),
                expected,
                "{}",
                input
            );
        }
    }

    #[test]
    fn test_invalid() {
        for input in ["", "Nginx", "app:", "app:-bad", "app@sha256:short", "a//b"] {
            assert!(Reference::parse_normalized(input).is_err(), "{}", input);
        }
    }

    #[test]
    fn test_object() {
        let r = Reference::parse_normalized("ghcr.io/owner/repo").unwrap();
        assert_eq!(r.domain, "ghcr.io");
        assert_eq!(r.path, "owner/repo");
        assert_eq!(r.object(), "latest");
    }
}
