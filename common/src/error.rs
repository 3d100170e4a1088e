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

use std::fmt::Display;

use thiserror::Error;
use tonic::Code;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExist(String),

    #[error("{0}")]
    InvalidArgument(String),

    /// Persisted config annotations are missing or undecodable.
    #[error("{0}")]
    ConfigCorrupt(String),

    /// The runtime or content store could not be reached.
    #[error("{0}")]
    Unavailable(String),

    /// Some targets of a batch operation failed.
    #[error("{0}")]
    PartialFailure(String),

    #[error("server is not initialized yet")]
    NotReady,

    #[error("{0}")]
    IO(#[from] std::io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Prefix the message with `ctx` while keeping the error kind.
    pub fn context<C: Display>(self, ctx: C) -> Self {
        match self {
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", ctx, m)),
            Error::AlreadyExist(m) => Error::AlreadyExist(format!("{}: {}", ctx, m)),
            Error::InvalidArgument(m) => Error::InvalidArgument(format!("{}: {}", ctx, m)),
            Error::ConfigCorrupt(m) => Error::ConfigCorrupt(format!("{}: {}", ctx, m)),
            Error::Unavailable(m) => Error::Unavailable(format!("{}: {}", ctx, m)),
            Error::PartialFailure(m) => Error::PartialFailure(format!("{}: {}", ctx, m)),
            Error::NotReady => Error::NotReady,
            Error::IO(e) => match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(format!("{}: {}", ctx, e)),
                std::io::ErrorKind::AlreadyExists => {
                    Error::AlreadyExist(format!("{}: {}", ctx, e))
                }
                _ => Error::Other(anyhow::Error::new(e).context(ctx.to_string())),
            },
            Error::Other(e) => Error::Other(e.context(ctx.to_string())),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::IO(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExist(_) => true,
            Error::IO(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(s: tonic::Status) -> Self {
        let msg = s.message().to_string();
        match s.code() {
            Code::NotFound => Error::NotFound(msg),
            Code::AlreadyExists => Error::AlreadyExist(msg),
            Code::InvalidArgument => Error::InvalidArgument(msg),
            Code::Unavailable => Error::Unavailable(msg),
            c => Error::Other(anyhow::anyhow!("rpc error {:?}: {}", c, msg)),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Unavailable(format!("transport error: {}", e))
    }
}

/// Adds context to a result, like `anyhow::Context`, without erasing the
/// error kind.
pub trait Context<T> {
    fn context<C: Display>(self, ctx: C) -> Result<T>;

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context<C: Display>(self, ctx: C) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(ctx))
    }

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Into::<Error>::into(e).context(f()))
    }
}
