/// Docker Engine - container primitives used by the lifecycle
///
/// Behind a trait so the orchestration can be exercised without a daemon.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CommitContainerOptions, RemoveImageOptions};
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use gauntlet_common::types::ImageMetadata;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Label put on every container and network we create, used by scram
pub const MANAGED_LABEL: &str = "gauntlet.managed";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    pub network: Option<String>,
    /// DNS name under which other containers on `network` reach this one
    pub network_alias: Option<String>,
    pub memory_limit_mib: Option<u64>,
    /// In CPU cores
    pub cpu_limit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// `allow_external = false` creates an internal network: containers
    /// reach each other but not the outside world.
    async fn create_network(&self, name: &str, allow_external: bool) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    /// Returns the container id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn write_file(&self, container_id: &str, path: &str, contents: &[u8], mode: u32)
        -> Result<()>;

    async fn copy_file(&self, container_id: &str, local: &Path, path: &str, mode: u32) -> Result<()> {
        let contents = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        self.write_file(container_id, path, &contents, mode).await
    }

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Exit code, or `None` if the container was still running when
    /// `timeout` expired. `None` timeout waits indefinitely.
    async fn wait_timeout(&self, container_id: &str, timeout: Option<Duration>)
        -> Result<Option<i64>>;

    /// Zero grace kills immediately
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs>;

    /// Commits the container filesystem and returns the new image reference
    async fn commit(&self, container_id: &str, repository: &str, tag: &str) -> Result<String>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn remove_image(&self, image: &str) -> Result<()>;

    async fn inspect_image(&self, image: &str) -> Result<ImageMetadata>;

    async fn list_managed_containers(&self) -> Result<Vec<String>>;
}

/// Packs a single file into a tar archive, the only upload format the
/// Docker API accepts
pub fn single_file_tar(path: &str, contents: &[u8], mode: u32) -> Result<(String, Vec<u8>)> {
    let path = Path::new(path);
    let parent = path
        .parent()
        .and_then(|p| p.to_str())
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
        .to_string();
    let file_name = path
        .file_name()
        .context("Upload target has no file name")?
        .to_owned();

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, contents)
        .context("Failed to build upload archive")?;
    let archive = builder.into_inner().context("Failed to finish upload archive")?;
    Ok((parent, archive))
}

/// [`ContainerEngine`] talking to the local Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_network(&self, name: &str, allow_external: bool) -> Result<()> {
        let options = CreateNetworkOptions {
            name,
            driver: "bridge",
            internal: !allow_external,
            labels: HashMap::from([(MANAGED_LABEL, "1")]),
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .with_context(|| format!("Failed to create network {}", name))?;
        debug!(network = name, internal = !allow_external, "Created network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker
            .remove_network(name)
            .await
            .with_context(|| format!("Failed to remove network {}", name))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let memory = spec.memory_limit_mib.map(|mib| (mib as i64) * 1024 * 1024);
        let host_config = HostConfig {
            memory,
            // Same value as memory disables swap
            memory_swap: memory,
            nano_cpus: spec.cpu_limit.map(|cores| (cores * 1_000_000_000.0) as i64),
            network_mode: spec.network.clone(),
            ..Default::default()
        };

        let networking_config = match (&spec.network, &spec.network_alias) {
            (Some(network), Some(alias)) => Some(NetworkingConfig {
                endpoints_config: HashMap::from([(
                    network.clone(),
                    EndpointSettings {
                        aliases: Some(vec![alias.clone()]),
                        ..Default::default()
                    },
                )]),
            }),
            _ => None,
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(spec.env.clone()),
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "1".to_string())])),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        Ok(container.id)
    }

    async fn write_file(
        &self,
        container_id: &str,
        path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<()> {
        let (parent, archive) = single_file_tar(path, contents, mode)?;
        let options = UploadToContainerOptions {
            path: parent,
            ..Default::default()
        };
        self.docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .with_context(|| format!("Failed to write {} into container", path))
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
    }

    async fn wait_timeout(
        &self,
        container_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<i64>> {
        let wait = async {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = self.docker.wait_container(container_id, Some(options));
            match stream.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // bollard reports non-zero exit codes as an error value
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(anyhow::Error::new(e).context("Failed to wait for container")),
                None => anyhow::bail!("No wait response from container"),
            }
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(code) => code.map(Some),
                Err(_) => Ok(None),
            },
            None => wait.await.map(Some),
        }
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        if grace.is_zero() {
            self.docker
                .kill_container(container_id, None::<KillContainerOptions<String>>)
                .await
                .context("Failed to kill container")
        } else {
            let options = StopContainerOptions {
                t: grace.as_secs() as i64,
            };
            self.docker
                .stop_container(container_id, Some(options))
                .await
                .context("Failed to stop container")
        }
    }

    async fn logs(&self, container_id: &str) -> Result<ContainerLogs> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut logs = ContainerLogs::default();
        let mut stream = self.docker.logs(container_id, Some(options));
        while let Some(output) = stream.next().await {
            match output.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => logs.stdout.extend_from_slice(&message),
                LogOutput::StdErr { message } => logs.stderr.extend_from_slice(&message),
                _ => {}
            }
        }
        Ok(logs)
    }

    async fn commit(&self, container_id: &str, repository: &str, tag: &str) -> Result<String> {
        let options = CommitContainerOptions {
            container: container_id,
            repo: repository,
            tag,
            pause: true,
            ..Default::default()
        };
        self.docker
            .commit_container(options, Config::<String>::default())
            .await
            .context("Failed to commit container")?;
        Ok(format!("{}:{}", repository, tag))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .with_context(|| format!("Failed to remove container {}", container_id))
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_image(image, Some(options), None)
            .await
            .with_context(|| format!("Failed to remove image {}", image))?;
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageMetadata> {
        let inspect = self
            .docker
            .inspect_image(image)
            .await
            .with_context(|| format!("Failed to inspect image {}", image))?;
        let labels = inspect
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default();
        Ok(ImageMetadata {
            name: image.to_string(),
            source: labels.get("org.opencontainers.image.source").cloned(),
            revision: labels.get("org.opencontainers.image.revision").cloned(),
            created: labels.get("org.opencontainers.image.created").cloned(),
        })
    }

    async fn list_managed_containers(&self) -> Result<Vec<String>> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: HashMap::from([("label".to_string(), vec![format!("{}=1", MANAGED_LABEL)])]),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;
        let ids: Vec<String> = containers.into_iter().filter_map(|c| c.id).collect();
        if ids.is_empty() {
            warn!("No managed containers running");
        }
        Ok(ids)
    }
}
