use portable_pty::CommandBuilder;

use super::local::{apply_environment, spawn_on_pty};
use super::{Backend, BackendError, LaunchSettings, ProcessHandle, SpawnRequest};
use crate::environment::{Environment, EnvironmentKind};

/// Working directory of the assistant inside the container; the session's
/// worktree is mounted here.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Execs the assistant inside an already running container.
///
/// The `docker exec -it` client runs on a local pty, so output, input and
/// resizing flow exactly as they do for a host process.
pub struct ContainerExecBackend {
    settings: LaunchSettings,
    docker: String,
    container: String,
    image: String,
}

impl ContainerExecBackend {
    pub fn from_environment(
        environment: &Environment,
        settings: LaunchSettings,
    ) -> Result<Self, BackendError> {
        if environment.kind != EnvironmentKind::Docker {
            return Err(BackendError::Misconfigured {
                id: environment.id.clone(),
                reason: format!("expected docker environment, got {}", environment.kind),
            });
        }
        if environment.auth_dir.is_none() {
            return Err(BackendError::Misconfigured {
                id: environment.id.clone(),
                reason: "auth_dir is required".to_string(),
            });
        }
        Ok(Self {
            settings,
            docker: "docker".to_string(),
            container: environment.container_name(),
            image: environment.image_ref(),
        })
    }

    /// Override the docker client binary.
    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Arguments passed to the docker client, excluding the binary itself.
    pub fn exec_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "exec",
            "-it",
            "-w",
            CONTAINER_WORKDIR,
            "-e",
            "TERM=xterm-256color",
            "-e",
            "COLORTERM=truecolor",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        // Values travel through the client's environment, never argv.
        for (key, _) in request.custom_env() {
            args.push("-e".to_string());
            args.push(key.to_string());
        }
        args.push(self.container.clone());
        args.extend(self.settings.sandboxed_argv(request));
        args
    }
}

impl Backend for ContainerExecBackend {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, BackendError> {
        let mut cmd = CommandBuilder::new(&self.docker);
        cmd.args(self.exec_args(request));
        cmd.cwd(&request.working_dir);
        apply_environment(&mut cmd);
        for (key, value) in request.custom_env() {
            cmd.env(key, value);
        }

        tracing::debug!(container = %self.container, image = %self.image, "exec into container");
        spawn_on_pty(cmd, request)
    }
}
