//! Docker container substrate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::{BootConfig, Driver, Endpoint, Provisioned, SubstrateState};
use crate::error::{DriverError, DriverResult};
use crate::image::ImageRef;
use crate::spec::{BackendKind, ResourceSpec};

const SSH_PORT: &str = "22/tcp";
const LOGIN_USER: &str = "root";
const PORT_POLL_ATTEMPTS: u32 = 20;
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STOP_TIMEOUT_SECS: i64 = 10;

/// Installs and runs sshd, authorizing the key passed in the environment.
const BOOT_SCRIPT: &str = r#"set -e
if command -v apt-get >/dev/null 2>&1; then
    export DEBIAN_FRONTEND=noninteractive
    apt-get update -q && apt-get install -y -q openssh-server
else
    dnf install -y -q openssh-server
fi
mkdir -p /run/sshd /root/.ssh
chmod 700 /root/.ssh
printf '%s\n' "$RENTD_AUTHORIZED_KEY" > /root/.ssh/authorized_keys
chmod 600 /root/.ssh/authorized_keys
ssh-keygen -A
exec /usr/sbin/sshd -D -e
"#;

pub struct ContainerDriver {
    docker: Docker,
    volumes_dir: PathBuf,
    public_host: String,
}

impl ContainerDriver {
    /// Connect to the Docker daemon at `socket`, or the platform default.
    pub fn connect(
        socket: Option<&str>,
        volumes_dir: PathBuf,
        public_host: String,
    ) -> anyhow::Result<Self> {
        let docker = match socket {
            Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker daemon at {}", path))?,
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
        };
        Ok(Self {
            docker,
            volumes_dir,
            public_host,
        })
    }

    /// Check the daemon answers.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon is not reachable")?;
        Ok(())
    }

    async fn pull_if_missing(&self, reference: &str) -> DriverResult<()> {
        if self.docker.inspect_image(reference).await.is_ok() {
            debug!(image = %reference, "Image already present");
            return Ok(());
        }

        info!(image = %reference, "Pulling image");
        let options = CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        info!(image = %reference, "Image pulled");
        Ok(())
    }

    async fn inspect_raw(&self, id: &str) -> DriverResult<ContainerInspectResponse> {
        self.docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(e, id))
    }

    /// Host port currently published for the container's sshd.
    fn published_port(container: &ContainerInspectResponse) -> Option<u16> {
        container
            .network_settings
            .as_ref()?
            .ports
            .as_ref()?
            .get(SSH_PORT)?
            .as_ref()?
            .iter()
            .filter_map(|b| b.host_port.as_deref())
            .find_map(|p| p.parse().ok())
    }

    fn is_running(container: &ContainerInspectResponse) -> bool {
        container
            .state
            .as_ref()
            .and_then(|s| s.status)
            .is_some_and(|s| s == ContainerStateStatusEnum::RUNNING)
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            host: self.public_host.clone(),
            port,
            user: LOGIN_USER.to_string(),
        }
    }
}

fn is_status(e: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

fn engine_error(e: bollard::errors::Error, id: &str) -> DriverError {
    if is_status(&e, 404) {
        DriverError::NotFound(id.to_string())
    } else {
        DriverError::Engine(e)
    }
}

#[async_trait]
impl Driver for ContainerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn provision(
        &self,
        name: &str,
        spec: &ResourceSpec,
        image: &ImageRef,
        boot: &BootConfig,
    ) -> DriverResult<Provisioned> {
        let reference = image
            .reference()
            .ok_or_else(|| DriverError::Other("container needs a registry image".into()))?;

        if self.inspect_raw(name).await.is_ok() {
            return Err(DriverError::AlreadyExists(name.to_string()));
        }

        self.pull_if_missing(reference).await?;

        let volume = self.volumes_dir.join(name);
        tokio::fs::create_dir_all(&volume).await?;

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            SSH_PORT.to_string(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );

        let host_config = HostConfig {
            nano_cpus: Some(i64::from(spec.cpu_cores) * 1_000_000_000),
            memory: Some(i64::from(spec.memory_gb) * 1024 * 1024 * 1024),
            binds: Some(vec![format!("{}:/data", volume.display())]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(SSH_PORT.to_string(), HashMap::new());

        let config = Config {
            image: Some(reference.to_string()),
            hostname: Some(boot.hostname.clone()),
            env: Some(vec![format!("RENTD_AUTHORIZED_KEY={}", boot.authorized_key)]),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                BOOT_SCRIPT.to_string(),
            ]),
            tty: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let created = match self.docker.create_container(Some(options), config).await {
            Ok(created) => created,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&volume).await;
                if is_status(&e, 409) {
                    return Err(DriverError::AlreadyExists(name.to_string()));
                }
                return Err(DriverError::Engine(e));
            }
        };

        for warning in &created.warnings {
            warn!(container = %name, warning = %warning, "Docker warning");
        }
        info!(container = %name, id = %created.id, image = %reference, "Container created");

        Ok(Provisioned {
            substrate_id: name.to_string(),
            endpoint: None,
        })
    }

    async fn start(&self, substrate_id: &str) -> DriverResult<Endpoint> {
        match self
            .docker
            .start_container(substrate_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => info!(container = %substrate_id, "Container started"),
            Err(e) if is_status(&e, 304) => {
                debug!(container = %substrate_id, "Container already running")
            }
            Err(e) => return Err(engine_error(e, substrate_id)),
        }

        // Docker assigns the ephemeral host port asynchronously.
        for _ in 0..PORT_POLL_ATTEMPTS {
            let container = self.inspect_raw(substrate_id).await?;
            if let Some(port) = Self::published_port(&container) {
                return Ok(self.endpoint(port));
            }
            if !Self::is_running(&container) {
                return Err(DriverError::Other(format!(
                    "container {} exited during start",
                    substrate_id
                )));
            }
            tokio::time::sleep(PORT_POLL_INTERVAL).await;
        }

        Err(DriverError::Other(format!(
            "no host port published for {} on {}",
            SSH_PORT, substrate_id
        )))
    }

    async fn stop(&self, substrate_id: &str) -> DriverResult<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.docker.stop_container(substrate_id, Some(options)).await {
            Ok(()) => {
                info!(container = %substrate_id, "Container stopped");
                Ok(())
            }
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(engine_error(e, substrate_id)),
        }
    }

    async fn delete(&self, substrate_id: &str) -> DriverResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(substrate_id, Some(options))
            .await
        {
            Ok(()) => info!(container = %substrate_id, "Container removed"),
            Err(e) if is_status(&e, 404) => {
                debug!(container = %substrate_id, "Container already gone")
            }
            Err(e) => return Err(DriverError::Engine(e)),
        }

        let volume = self.volumes_dir.join(substrate_id);
        if tokio::fs::try_exists(&volume).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&volume).await?;
        }
        Ok(())
    }

    async fn inspect(&self, substrate_id: &str) -> DriverResult<SubstrateState> {
        let container = match self.inspect_raw(substrate_id).await {
            Ok(c) => c,
            Err(DriverError::NotFound(_)) => return Ok(SubstrateState::Missing),
            Err(e) => return Err(e),
        };

        let status = container.state.and_then(|s| s.status);
        Ok(match status {
            Some(ContainerStateStatusEnum::RUNNING)
            | Some(ContainerStateStatusEnum::RESTARTING)
            | Some(ContainerStateStatusEnum::PAUSED) => SubstrateState::Running,
            Some(ContainerStateStatusEnum::EXITED)
            | Some(ContainerStateStatusEnum::DEAD)
            | Some(ContainerStateStatusEnum::REMOVING) => SubstrateState::Stopped,
            Some(ContainerStateStatusEnum::CREATED)
            | Some(ContainerStateStatusEnum::EMPTY)
            | None => SubstrateState::Created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::NetworkSettings;

    fn inspected(ports: Option<Vec<PortBinding>>) -> ContainerInspectResponse {
        let mut map = HashMap::new();
        map.insert(SSH_PORT.to_string(), ports);
        ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ports: Some(map),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_published_port() {
        let c = inspected(Some(vec![
            PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some("49153".to_string()),
            },
            PortBinding {
                host_ip: Some("::".to_string()),
                host_port: Some("49153".to_string()),
            },
        ]));
        assert_eq!(ContainerDriver::published_port(&c), Some(49153));
    }

    #[test]
    fn test_published_port_missing() {
        assert_eq!(ContainerDriver::published_port(&inspected(None)), None);
        assert_eq!(
            ContainerDriver::published_port(&ContainerInspectResponse::default()),
            None
        );
    }

    #[test]
    fn test_not_found_mapping() {
        let e = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(matches!(engine_error(e, "c1"), DriverError::NotFound(id) if id == "c1"));
    }
}
