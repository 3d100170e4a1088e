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

//! HTTP/1.1 JSON transport of the [`ContainerService`] on a unix socket.
//!
//! Streaming verbs answer newline delimited JSON, one value per line.

use std::{io::ErrorKind, path::Path, sync::Arc};

use axum::{
    body::Body,
    extract::{Path as UrlPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use hyper::{body::Incoming, server::conn::http1};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use podshim_common::{
    api::shim::{
        AttachOptions, BatchReport, CreateContainerRequest, CreatePodRequest,
        CreateVolumeRequest, ExecContainerRequest, IdResponse, ImageRequest, LogOptions,
        PullImageResponse, RemoveContainersRequest, RemoveVolumesRequest, StopContainersRequest,
        TagImageRequest,
    },
    error::{Context, Error, Result},
    signal::ExitSignal,
};
use serde::Serialize;
use serde_derive::Deserialize;
use tokio::{net::UnixListener, sync::mpsc::Receiver};
use tokio_stream::wrappers::ReceiverStream;
use tower::Service;

use crate::service::ContainerService;

const NDJSON: &str = "application/x-ndjson";

type AppState = Arc<ContainerService>;

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::AlreadyExist(_) => StatusCode::CONFLICT,
            Error::NotReady | Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::PartialFailure(_) => StatusCode::MULTI_STATUS,
            Error::IO(e) if e.kind() == ErrorKind::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "message": self.0.to_string()
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// A batch report, as 207 when any target failed.
fn batch(report: BatchReport) -> Response {
    let status = if report.failed() > 0 {
        StatusCode::MULTI_STATUS
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

/// Streams every received value as one JSON line.
fn ndjson<T: Serialize + Send + 'static>(rx: Receiver<T>) -> Response {
    let lines = ReceiverStream::new(rx).map(|item| {
        let mut line = serde_json::to_vec(&item)?;
        line.push(b'\n');
        Ok::<_, serde_json::Error>(Bytes::from(line))
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response()
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct TimeoutQuery {
    timeout: i64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ForceQuery {
    force: bool,
}

pub fn router(service: AppState) -> Router {
    Router::new()
        .route("/pods", get(list_pods).post(create_pod))
        .route("/pods/{id}/containers", post(create_container))
        .route("/containers/stop", post(stop_containers))
        .route("/containers/remove", post(remove_containers))
        .route(
            "/containers/{name}",
            get(get_container).delete(remove_container),
        )
        .route("/containers/{name}/start", post(start_container))
        .route("/containers/{name}/stop", post(stop_container))
        .route("/containers/{name}/exec", post(exec))
        .route("/containers/{name}/attach", post(attach))
        .route("/containers/{name}/logs", get(log_container))
        .route("/images", get(list_images))
        .route("/images/get", post(get_image))
        .route("/images/pull", post(pull_image))
        .route("/images/push", post(push_image))
        .route("/images/tag", post(tag_image))
        .route("/images/remove", post(remove_image))
        .route("/images/pull-progress", post(pull_progress))
        .route("/images/push-progress", post(push_progress))
        .route("/events", get(events))
        .route("/volumes", get(list_volumes).post(create_volume))
        .route("/volumes/remove", post(remove_volumes))
        .route("/volumes/{name}", axum::routing::delete(remove_volume))
        .with_state(service)
}

async fn create_pod(
    State(s): State<AppState>,
    Json(req): Json<CreatePodRequest>,
) -> ApiResult<Json<IdResponse>> {
    let id = s
        .create_pod(&req.name, req.options.unwrap_or_default())
        .await?;
    Ok(Json(IdResponse { id }))
}

async fn list_pods(State(s): State<AppState>) -> ApiResult<Response> {
    Ok(Json(s.list_pods().await?).into_response())
}

async fn create_container(
    State(s): State<AppState>,
    UrlPath(pod_id): UrlPath<String>,
    Json(req): Json<CreateContainerRequest>,
) -> ApiResult<Json<IdResponse>> {
    let id = s
        .create_container(&pod_id, &req.image, req.options.unwrap_or_default())
        .await?;
    Ok(Json(IdResponse { id }))
}

async fn get_container(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Response> {
    Ok(Json(s.get_container(&name).await?).into_response())
}

async fn start_container(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<StatusCode> {
    s.start_container(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_container(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(q): Query<TimeoutQuery>,
) -> ApiResult<StatusCode> {
    s.stop_container(&name, q.timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_container(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<StatusCode> {
    s.remove_container(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_containers(
    State(s): State<AppState>,
    Json(req): Json<StopContainersRequest>,
) -> ApiResult<Response> {
    Ok(batch(s.stop_containers(&req.ids, req.timeout).await?))
}

async fn remove_containers(
    State(s): State<AppState>,
    Json(req): Json<RemoveContainersRequest>,
) -> ApiResult<Response> {
    Ok(batch(s.remove_containers(&req.ids).await?))
}

async fn exec(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(req): Json<ExecContainerRequest>,
) -> ApiResult<Response> {
    Ok(Json(s.exec(&name, req.cmd, req.options).await?).into_response())
}

async fn attach(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(opts): Json<AttachOptions>,
) -> ApiResult<Response> {
    Ok(Json(s.attach(&name, opts).await?).into_response())
}

async fn log_container(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(opts): Query<LogOptions>,
) -> ApiResult<Response> {
    Ok(ndjson(s.log_container(&name, opts).await?))
}

async fn list_images(State(s): State<AppState>) -> ApiResult<Response> {
    Ok(Json(s.list_images().await?).into_response())
}

async fn get_image(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Response> {
    Ok(Json(s.get_image(&req.image).await?).into_response())
}

async fn pull_image(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Json<PullImageResponse>> {
    let image_ref = s.pull_image(&req.image, req.auth).await?;
    Ok(Json(PullImageResponse { image_ref }))
}

async fn push_image(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<StatusCode> {
    s.push_image(&req.image, req.auth).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn tag_image(
    State(s): State<AppState>,
    Json(req): Json<TagImageRequest>,
) -> ApiResult<StatusCode> {
    s.tag_image(&req.image, &req.tags).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_image(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<StatusCode> {
    s.remove_image(&req.image).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pull_progress(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Response> {
    Ok(ndjson(s.pull_progress(&req.image)?))
}

async fn push_progress(
    State(s): State<AppState>,
    Json(req): Json<ImageRequest>,
) -> ApiResult<Response> {
    Ok(ndjson(s.push_progress(&req.image)?))
}

async fn events(State(s): State<AppState>) -> ApiResult<Response> {
    Ok(ndjson(s.events().await?))
}

async fn create_volume(
    State(s): State<AppState>,
    Json(req): Json<CreateVolumeRequest>,
) -> ApiResult<Response> {
    Ok(Json(s.create_volume(&req.name).await?).into_response())
}

async fn list_volumes(State(s): State<AppState>) -> ApiResult<Response> {
    Ok(Json(s.list_volumes().await?).into_response())
}

async fn remove_volume(
    State(s): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(q): Query<ForceQuery>,
) -> ApiResult<StatusCode> {
    s.remove_volume(&name, q.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_volumes(
    State(s): State<AppState>,
    Json(req): Json<RemoveVolumesRequest>,
) -> ApiResult<Response> {
    Ok(batch(s.remove_volumes(&req.names, req.force).await?))
}

/// Binds `listen`, replacing a stale socket file.
pub async fn bind<P: AsRef<Path>>(listen: P) -> Result<UnixListener> {
    let listen = listen.as_ref();
    if let Some(parent) = listen.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    match tokio::fs::remove_file(listen).await {
        Ok(_) => debug!("removed stale socket {}", listen.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(Error::from(e).context(format!("failed to remove {}", listen.display()))),
    }
    UnixListener::bind(listen).with_context(|| format!("failed to listen on {}", listen.display()))
}

/// Serves connections until the exit signal fires.
pub async fn serve(listener: UnixListener, service: AppState, exit: Arc<ExitSignal>) -> Result<()> {
    let app = router(service);
    if let Ok(addr) = listener.local_addr() {
        info!("serving podshim api on {:?}", addr.as_pathname());
    }
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                        continue;
                    }
                }
            }
            _ = exit.wait() => {
                info!("podshim api server stopped");
                return Ok(());
            }
        };
        let tower_service = app.clone();
        tokio::spawn(async move {
            let hyper_service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
                tower_service.clone().call(req)
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), hyper_service)
                .await
            {
                if !e.is_incomplete_message() {
                    debug!("failed to serve connection: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
    };
    use podshim_common::{
        api::shim::{BatchReport, IdResponse},
        error::{Context, Error},
        signal::ExitSignal,
    };
    use temp_dir::TempDir;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixStream,
    };
    use tower::Service;

    use super::{bind, router, serve, ApiError};
    use crate::{client::fake::Fakes, service::tests::service, service::ContainerService};

    async fn call(
        app: &mut axum::Router,
        method: Method,
        uri: &str,
        body: &str,
    ) -> (StatusCode, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.call(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_error_status() {
        let cases = [
            (Error::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (Error::InvalidArgument("x".to_string()), StatusCode::BAD_REQUEST),
            (Error::AlreadyExist("x".to_string()), StatusCode::CONFLICT),
            (Error::NotReady, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Unavailable("x".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::PartialFailure("x".to_string()), StatusCode::MULTI_STATUS),
            (
                Error::ConfigCorrupt("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError(err).status_code(), status);
        }

        let missing: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        let err = missing.context("failed to open log").unwrap_err();
        assert_eq!(ApiError(err).status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_not_ready() {
        let svc = Arc::new(ContainerService::new(Arc::new(ExitSignal::default())));
        let mut app = router(svc);
        let (status, body) = call(&mut app, Method::GET, "/pods", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, r#"{"message":"server is not initialized yet"}"#);
    }

    #[tokio::test]
    async fn test_routes() {
        let fakes = Fakes::default();
        let dir = TempDir::new().unwrap();
        let mut app = router(Arc::new(service(&fakes, &dir)));

        let (status, body) = call(&mut app, Method::POST, "/pods", r#"{"name":"web"}"#).await;
        assert_eq!(status, StatusCode::OK);
        let pod: IdResponse = serde_json::from_str(&body).unwrap();

        let (status, body) = call(
            &mut app,
            Method::POST,
            &format!("/pods/{}/containers", pod.id),
            r#"{"image":"busybox","options":{"name":"app"}}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ctr: IdResponse = serde_json::from_str(&body).unwrap();

        let (status, _) = call(&mut app, Method::POST, "/containers/app/start", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&mut app, Method::GET, "/containers/nope", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &mut app,
            Method::POST,
            "/containers/remove",
            &format!(r#"{{"ids":["{}","nope"]}}"#, ctr.id),
        )
        .await;
        assert_eq!(status, StatusCode::MULTI_STATUS);
        let report: BatchReport = serde_json::from_str(&body).unwrap();
        assert_eq!(report.failed(), 1);

        let (status, _) = call(&mut app, Method::POST, "/volumes", r#"{"name":"data"}"#).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&mut app, Method::POST, "/volumes", r#"{"name":"data"}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, body) = call(&mut app, Method::GET, "/volumes", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"[{"id":"data"}]"#);
        let (status, _) = call(&mut app, Method::DELETE, "/volumes/data?force=true", "").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_logs_stream_ndjson() {
        let fakes = Fakes::default();
        let dir = TempDir::new().unwrap();
        let svc = service(&fakes, &dir);
        let pod = svc
            .create_pod("web", Default::default())
            .await
            .unwrap();
        let id = svc
            .create_container(&pod, "busybox", Default::default())
            .await
            .unwrap();
        let found = svc.get_container(&id).await.unwrap();
        let log_dir = dir
            .child("logs")
            .join(format!("web_{}", found.pod.uid))
            .join(&found.container.name);
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(
            log_dir.join("0.log"),
            "2024-01-01T00:00:00.000000000Z stdout F hello\n\
             2024-01-01T00:00:01.000000000Z stderr F world\n",
        )
        .unwrap();

        let mut app = router(Arc::new(svc));
        let (status, body) = call(&mut app, Method::GET, &format!("/containers/{}/logs", id), "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            "{\"stderr\":false,\"message\":\"hello\\n\"}\n{\"stderr\":true,\"message\":\"world\\n\"}\n"
        );
    }

    #[tokio::test]
    async fn test_serve_unix_socket() {
        let dir = TempDir::new().unwrap();
        let sock = dir.child("run").join("podshim.sock");
        let exit = Arc::new(ExitSignal::default());
        let svc = Arc::new(ContainerService::new(exit.clone()));
        let listener = bind(&sock).await.unwrap();
        let handle = tokio::spawn(serve(listener, svc, exit.clone()));

        let mut stream = UnixStream::connect(&sock).await.unwrap();
        stream
            .write_all(b"GET /volumes HTTP/1.1\r\nHost: podshim\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 503"), "{}", response);

        exit.signal();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // a stale socket is replaced
        assert!(bind(&sock).await.is_ok());
    }
}
