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

use std::{path::Path, sync::Arc};

use log::{debug, info};
use podshim_common::{
    api::{
        cri::{AttachRequest, ContainerFilter, ExecRequest, PodSandboxFilter},
        shim::{
            AttachOptions, BatchReport, ExecOptions, GetContainerResponse, LogEntry, LogOptions,
            StreamResponse,
        },
    },
    error::{Context, Error, Result},
    signal::ExitSignal,
};
use time::OffsetDateTime;
use tokio::sync::mpsc::{channel, Receiver};

use crate::{
    client::RuntimeService,
    codec::{CONTAINER_CODEC, POD_CODEC},
    gc::Kicker,
    logs::{LogFilter, LogReader},
    pod::PodTranslator,
};

const LOG_CHANNEL_SIZE: usize = 128;

/// Verbs addressing a single container by name or id prefix.
pub struct ContainerManager {
    runtime: Arc<dyn RuntimeService>,
    pods: Arc<PodTranslator>,
    gc: Kicker,
    exit: Arc<ExitSignal>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn RuntimeService>,
        pods: Arc<PodTranslator>,
        gc: Kicker,
        exit: Arc<ExitSignal>,
    ) -> Self {
        Self {
            runtime,
            pods,
            gc,
            exit,
        }
    }

    /// Finds a container by exact name or by a prefix of its id.
    pub async fn get_container(&self, name: &str) -> Result<GetContainerResponse> {
        if name.is_empty() {
            return Err(Error::InvalidArgument(
                "container name must not be empty".to_string(),
            ));
        }
        for pod in self.pods.list_pods().await? {
            let status = match pod
                .status
                .container_statuses
                .iter()
                .find(|s| s.name == name || s.container_id.starts_with(name))
            {
                Some(s) => s,
                None => continue,
            };
            if let Some(container) = pod.spec.containers.iter().find(|c| c.name == status.name) {
                return Ok(GetContainerResponse {
                    id: status.container_id.clone(),
                    container: container.clone(),
                    pod: pod.clone(),
                });
            }
        }
        Err(Error::NotFound(format!("container {} not found", name)))
    }

    async fn resolve(&self, name: &str) -> Result<String> {
        Ok(self.get_container(name).await?.id)
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        let id = self.resolve(name).await?;
        self.runtime.start_container(&id).await
    }

    pub async fn stop_container(&self, name: &str, timeout: i64) -> Result<()> {
        let id = self.resolve(name).await?;
        self.runtime.stop_container(&id, timeout).await
    }

    /// Removes the container and asks the reconciler to look for pods left
    /// empty, whether or not the removal succeeded.
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        let res = match self.resolve(name).await {
            Ok(id) => self.runtime.remove_container(&id).await,
            Err(e) => Err(e),
        };
        self.gc.kick();
        res
    }

    pub async fn stop_containers(&self, names: &[String], timeout: i64) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            let res = self
                .stop_container(name, timeout)
                .await
                .with_context(|| format!("failed to stop container {}", name));
            report.record(name, res);
        }
        report
    }

    pub async fn remove_containers(&self, names: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            let res = self
                .remove_container(name)
                .await
                .with_context(|| format!("failed to remove container {}", name));
            report.record(name, res);
        }
        report
    }

    pub async fn exec(
        &self,
        name: &str,
        cmd: Vec<String>,
        opts: ExecOptions,
    ) -> Result<StreamResponse> {
        let id = self.resolve(name).await?;
        let req = ExecRequest {
            container_id: id,
            cmd,
            tty: opts.tty,
            stdin: opts.stdin,
            stdout: true,
            stderr: !opts.tty,
        };
        let url = self.runtime.exec(req).await?;
        Ok(StreamResponse {
            url,
            tty: opts.tty,
            stdin: opts.stdin,
        })
    }

    /// Attaches with the tty and stdin settings the container was created with.
    pub async fn attach(&self, name: &str, opts: AttachOptions) -> Result<StreamResponse> {
        let found = self.get_container(name).await?;
        let tty = found.container.tty;
        let stdin = found.container.stdin && !opts.no_stdin;
        let req = AttachRequest {
            container_id: found.id,
            stdin,
            tty,
            stdout: true,
            stderr: !tty,
        };
        let url = self.runtime.attach(req).await?;
        Ok(StreamResponse { url, tty, stdin })
    }

    /// Streams the CRI log file of a container. The channel is closed when
    /// the container has no log file configured.
    pub async fn log_container(
        &self,
        name: &str,
        opts: LogOptions,
    ) -> Result<Receiver<LogEntry>> {
        let filter = LogFilter::new(&opts, OffsetDateTime::now_utc())?;
        let id = self.resolve(name).await?;
        let (tx, rx) = channel(LOG_CHANNEL_SIZE);

        let container = match self
            .runtime
            .list_containers(Some(ContainerFilter {
                id: id.clone(),
                ..Default::default()
            }))
            .await?
            .into_iter()
            .next()
        {
            Some(c) => c,
            None => return Ok(rx),
        };
        let config = CONTAINER_CODEC
            .decode_derived(&container.annotations)
            .with_context(|| format!("failed to get config of container {}", id))?;

        let sandbox = match self
            .runtime
            .list_pod_sandbox(Some(PodSandboxFilter {
                id: container.pod_sandbox_id.clone(),
                ..Default::default()
            }))
            .await?
            .into_iter()
            .next()
        {
            Some(s) => s,
            None => return Ok(rx),
        };
        let pod_config = POD_CODEC
            .decode_derived(&sandbox.annotations)
            .with_context(|| format!("failed to get config of pod {}", sandbox.id))?;

        if pod_config.log_directory.is_empty() || config.log_path.is_empty() {
            debug!("container {} has no log file", id);
            return Ok(rx);
        }

        let path = Path::new(&pod_config.log_directory).join(&config.log_path);
        let reader = LogReader::new(
            path.clone(),
            &id,
            filter,
            opts.follow,
            self.runtime.clone(),
            self.exit.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = reader.run(tx).await {
                info!("error reading {}: {}", path.display(), e);
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use podshim_common::{
        api::{
            cri::ContainerState,
            shim::{AttachOptions, ContainerOptions, ExecOptions, LogOptions, PodOptions},
        },
        error::Error,
        signal::ExitSignal,
    };
    use temp_dir::TempDir;

    use super::ContainerManager;
    use crate::{
        client::fake::Fakes,
        gc::Kicker,
        network::CniResults,
        pod::PodTranslator,
        volume::VolumeResolver,
    };

    struct Fixture {
        fakes: Fakes,
        manager: ContainerManager,
        kicks: tokio::sync::mpsc::Receiver<()>,
        logs: TempDir,
        _volumes: TempDir,
    }

    async fn fixture() -> Fixture {
        let fakes = Fakes::default();
        let logs = TempDir::new().unwrap();
        let volumes = TempDir::new().unwrap();
        let runtime = fakes.backend().runtime;
        let pods = Arc::new(PodTranslator::new(
            runtime.clone(),
            Arc::new(VolumeResolver::new(volumes.path()).unwrap()),
            logs.path(),
            CniResults::new(volumes.child("cni"), "podshim-net"),
        ));
        let (kicker, mut kicks) = Kicker::new();
        kicks.try_recv().unwrap();
        Fixture {
            manager: ContainerManager::new(runtime, pods, kicker, Arc::new(ExitSignal::default())),
            fakes,
            kicks,
            logs,
            _volumes: volumes,
        }
    }

    async fn run(f: &Fixture, name: &str, opts: ContainerOptions) -> String {
        let pods = &f.manager.pods;
        let pod = pods.create_pod(name, PodOptions::default()).await.unwrap();
        pods.create_container(&pod, "docker.io/library/nginx:latest", opts)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_container() {
        let f = fixture().await;
        let id = run(&f, "web", ContainerOptions::default()).await;

        let found = f.manager.get_container("web").await.unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.container.name, "web");
        assert_eq!(found.pod.name, "web");

        let found = f.manager.get_container(&id[..2]).await.unwrap();
        assert_eq!(found.id, id);

        assert!(matches!(
            f.manager.get_container("").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            f.manager.get_container("db").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_stop_remove() {
        let mut f = fixture().await;
        let id = run(&f, "web", ContainerOptions::default()).await;
        f.fakes.runtime.clear_calls();

        f.manager.start_container("web").await.unwrap();
        f.manager.stop_container("web", 10).await.unwrap();
        f.manager.remove_container("web").await.unwrap();
        assert_eq!(
            f.fakes.runtime.calls(),
            vec![
                format!("StartContainer {}", id),
                format!("StopContainer {} 10", id),
                format!("RemoveContainer {}", id),
            ]
        );
        assert!(f.kicks.try_recv().is_ok());

        // a failed removal still kicks
        assert!(f.manager.remove_container("web").await.is_err());
        assert!(f.kicks.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_batch_reports_every_target() {
        let f = fixture().await;
        let web = run(&f, "web", ContainerOptions::default()).await;
        f.fakes.runtime.fail(&format!("StopContainer {} 5", web));
        let db = run(&f, "db", ContainerOptions::default()).await;

        let report = f
            .manager
            .stop_containers(&["web".to_string(), "db".to_string(), "cache".to_string()], 5)
            .await;
        assert_eq!(report.results.len(), 3);
        assert!(report.results[0].error.is_some());
        assert!(report.results[1].error.is_none());
        assert!(report.results[2].error.is_some());
        assert!(matches!(report.check(), Err(Error::PartialFailure(_))));
        assert!(f
            .fakes
            .runtime
            .calls()
            .contains(&format!("StopContainer {} 5", db)));

        let report = f.manager.remove_containers(&["db".to_string()]).await;
        assert!(report.check().is_ok());
    }

    #[tokio::test]
    async fn test_exec_and_attach() {
        let f = fixture().await;
        let id = run(
            &f,
            "web",
            ContainerOptions {
                tty: true,
                stdin: true,
                ..Default::default()
            },
        )
        .await;

        let resp = f
            .manager
            .exec(
                "web",
                vec!["ls".to_string(), "-l".to_string()],
                ExecOptions {
                    tty: false,
                    stdin: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.url, format!("http://streaming/exec/{}", id));
        assert!(!resp.tty);
        assert!(resp.stdin);

        let resp = f
            .manager
            .attach("web", AttachOptions { no_stdin: true })
            .await
            .unwrap();
        assert!(resp.tty);
        assert!(!resp.stdin);

        let calls = f.fakes.runtime.calls();
        assert!(calls.contains(&format!(
            "Exec {} ls -l tty=false stdin=true stderr=true",
            id
        )));
        assert!(calls.contains(&format!(
            "Attach {} tty=true stdin=false stderr=false",
            id
        )));
    }

    #[tokio::test]
    async fn test_log_container() {
        let f = fixture().await;
        let id = run(&f, "web", ContainerOptions::default()).await;
        f.fakes.runtime.set_container_state(&id, ContainerState::ContainerExited);

        let pod = f.manager.get_container("web").await.unwrap().pod;
        let log = f
            .logs
            .path()
            .join(format!("web_{}", pod.uid))
            .join("web")
            .join("0.log");
        std::fs::write(
            &log,
            "2024-05-01T10:00:00Z stdout F hello\n2024-05-01T10:00:01Z stderr F world\n",
        )
        .unwrap();

        let mut rx = f
            .manager
            .log_container(
                "web",
                LogOptions {
                    follow: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "hello\n");
        let second = rx.recv().await.unwrap();
        assert!(second.stderr);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_log_container_without_log_dir() {
        let fakes = Fakes::default();
        let volumes = TempDir::new().unwrap();
        let runtime = fakes.backend().runtime;
        let pods = Arc::new(PodTranslator::new(
            runtime.clone(),
            Arc::new(VolumeResolver::new(volumes.path()).unwrap()),
            "",
            CniResults::new(volumes.child("cni"), "podshim-net"),
        ));
        let pod = pods.create_pod("web", PodOptions::default()).await.unwrap();
        pods.create_container(&pod, "nginx", ContainerOptions::default())
            .await
            .unwrap();
        let (kicker, _kicks) = Kicker::new();
        let manager = ContainerManager::new(runtime, pods, kicker, Arc::new(ExitSignal::default()));

        let mut rx = manager
            .log_container("web", LogOptions::default())
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
