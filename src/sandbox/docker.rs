//! Docker-backed sandbox.
//!
//! One long-lived container per session with the project at `/workspace`.
//! Files go in as tar uploads; every other operation is a `docker exec`.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{MountTree, OutputStream, Process, ReadyAnnouncer, Sandbox, SandboxError, ServerReady};
use crate::config::{NetworkPolicy, SandboxConfig};

const WORKSPACE: &str = "/workspace";

/// Runs projects inside a Docker container.
pub struct DockerSandbox {
    docker: Docker,
    container: String,
    ready_tx: broadcast::Sender<ServerReady>,
}

impl DockerSandbox {
    /// Connects to the daemon, checks the image and starts the container.
    pub async fn boot(config: &SandboxConfig) -> Result<Self, SandboxError> {
        info!("Booting Docker sandbox from {}", config.image);

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::unavailable(format!("cannot connect to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::unavailable(format!("cannot ping Docker daemon: {e}")))?;

        docker
            .inspect_image(&config.image)
            .await
            .map_err(|_| SandboxError::image_not_found(&config.image))?;

        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let container = format!("sandsync-{}", &short_id[..8]);

        let container_config = build_container_config(config)?;

        debug!("Creating container: {}", container);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::boot_failed(format!("failed to create container: {e}")))?;

        debug!("Starting container");
        if let Err(e) = docker.start_container::<String>(&container, None).await {
            let _ = remove_container(&docker, &container).await;
            return Err(SandboxError::boot_failed(format!(
                "failed to start container: {e}"
            )));
        }

        let (ready_tx, _) = broadcast::channel(16);
        Ok(Self {
            docker,
            container,
            ready_tx,
        })
    }

    /// Runs a short command and returns its exit code and stdout.
    async fn exec_capture(&self, cmd: Vec<String>) -> Result<(i64, String), SandboxError> {
        let command_line = cmd.join(" ");
        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(WORKSPACE.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached {
            output: mut stream, ..
        } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?
        {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;
        let code = inspect.exit_code.unwrap_or(-1);
        if code != 0 && !stderr.is_empty() {
            debug!("'{}' stderr: {}", command_line, stderr.trim());
        }
        Ok((code, stdout))
    }

    /// Runs a filesystem command, mapping a non-zero exit to an error.
    async fn fs_command(&self, op: &'static str, path: &str, cmd: &[&str]) -> Result<String, SandboxError> {
        let cmd = cmd.iter().map(|s| (*s).to_string()).collect();
        let (code, stdout) = self.exec_capture(cmd).await?;
        match code {
            0 => Ok(stdout),
            // test/ls/cat exit with 1 or 2 on missing paths
            1 | 2 => Err(SandboxError::not_found(path)),
            _ => Err(SandboxError::io(op, path, format!("exit code {code}"))),
        }
    }

    async fn upload(&self, files: &BTreeMap<String, String>) -> Result<(), SandboxError> {
        let archive = tar_archive(files)?;
        self.docker
            .upload_to_container(
                &self.container,
                Some(UploadToContainerOptions {
                    path: WORKSPACE.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| SandboxError::io("upload", WORKSPACE, e.to_string()))
    }
}

fn build_container_config(config: &SandboxConfig) -> Result<ContainerConfig<String>, SandboxError> {
    let memory = parse_memory_limit(&config.resources.memory)?;
    let cpus = config.resources.cpus.parse::<f64>().unwrap_or(2.0);

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in &config.ports {
        let key = format!("{port}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(port.to_string()),
            }]),
        );
    }

    let network_mode = match config.network.policy {
        NetworkPolicy::Deny => Some("none".to_string()),
        NetworkPolicy::AllowAll => None,
    };

    #[allow(clippy::cast_possible_truncation)]
    let nano_cpus = (cpus * 1_000_000_000.0) as i64;

    Ok(ContainerConfig {
        image: Some(config.image.clone()),
        working_dir: Some(WORKSPACE.to_string()),
        // Keep the container alive; work happens through exec.
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            memory: Some(memory),
            nano_cpus: Some(nano_cpus),
            port_bindings: Some(port_bindings),
            network_mode,
            ..Default::default()
        }),
        ..Default::default()
    })
}

async fn remove_container(docker: &Docker, container: &str) -> Result<(), bollard::errors::Error> {
    docker
        .remove_container(
            container,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn mount(&self, tree: &MountTree) -> Result<(), SandboxError> {
        self.upload(&tree.flatten()).await
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.fs_command("read", path, &["cat", "--", path]).await
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), SandboxError> {
        let files = BTreeMap::from([(path.to_string(), contents.to_string())]);
        self.upload(&files).await
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, SandboxError> {
        let dir = if path.is_empty() { "." } else { path };
        let stdout = self.fs_command("readdir", path, &["ls", "-A1", "--", dir]).await?;
        Ok(stdout.lines().map(str::to_string).collect())
    }

    async fn mkdir(&self, path: &str) -> Result<(), SandboxError> {
        self.fs_command("mkdir", path, &["mkdir", "-p", "--", path])
            .await
            .map(|_| ())
    }

    async fn rm(&self, path: &str) -> Result<(), SandboxError> {
        self.fs_command("rm", path, &["sh", "-c", "test -e \"$1\" && rm -rf -- \"$1\"", "rm", path])
            .await
            .map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SandboxError> {
        self.fs_command(
            "rename",
            from,
            &[
                "sh",
                "-c",
                "test -e \"$1\" && mkdir -p \"$(dirname \"$2\")\" && mv -- \"$1\" \"$2\"",
                "mv",
                from,
                to,
            ],
        )
        .await
        .map(|_| ())
    }

    async fn spawn(&self, program: &str, args: &[String]) -> Result<Process, SandboxError> {
        let command_line = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        // Record the shell PID so the process can be signalled later.
        let pid_file = format!(
            "/tmp/sandsync-{}.pid",
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo $$ > {pid_file}; exec \"$@\""),
            "sh".to_string(),
            program.to_string(),
        ];
        cmd.extend(args.iter().cloned());

        debug!("Spawning in container {}: {}", self.container, command_line);
        let exec = self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(WORKSPACE.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::spawn(&command_line, e.to_string()))?;
        let StartExecResults::Attached {
            output: mut stream, ..
        } = started
        else {
            return Err(SandboxError::spawn(&command_line, "exec started detached"));
        };

        let (process, io) = Process::channel();
        let mut kill = io.kill;
        let output = io.output;
        let exit = io.exit;
        let docker = self.docker.clone();
        let container = self.container.clone();
        let announcer = ReadyAnnouncer::new(io.id, self.ready_tx.clone());
        let exec_id = exec.id;

        tokio::spawn(async move {
            let mut stdout = OutputStream::new(Arc::clone(&announcer));
            let mut stderr = OutputStream::new(announcer);
            let mut killed = false;
            loop {
                tokio::select! {
                    chunk = stream.next() => match chunk {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            forward(&output, stdout.feed(&message));
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            forward(&output, stderr.feed(&message));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Error reading exec output: {}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = &mut kill, if !killed => {
                        killed = true;
                        debug!("Killing '{}'", command_line);
                        let signal = format!("kill -TERM \"$(cat {pid_file})\"");
                        if let Err(e) = signal_exec(&docker, &container, &signal).await {
                            warn!("Failed to kill '{}': {}", command_line, e);
                        }
                    }
                }
            }
            for rest in [stdout.finish(), stderr.finish()].into_iter().flatten() {
                forward(&output, rest);
            }
            drop(output);

            let code = match docker.inspect_exec(&exec_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to inspect exec for '{}': {}", command_line, e);
                    -1
                }
            };
            let _ = signal_exec(&docker, &container, &format!("rm -f {pid_file}")).await;
            #[allow(clippy::cast_possible_truncation)]
            let _ = exit.send(code as i32);
        });

        Ok(process)
    }

    fn server_ready(&self) -> broadcast::Receiver<ServerReady> {
        self.ready_tx.subscribe()
    }

    async fn dispose(&self) -> Result<(), SandboxError> {
        debug!("Removing container {}", self.container);
        remove_container(&self.docker, &self.container)
            .await
            .map_err(|e| SandboxError::io("dispose", &self.container, e.to_string()))
    }
}

fn forward(output: &tokio::sync::mpsc::UnboundedSender<String>, text: String) {
    if !text.is_empty() {
        let _ = output.send(text);
    }
}

/// Fire-and-forget shell command inside the container.
async fn signal_exec(docker: &Docker, container: &str, script: &str) -> Result<(), bollard::errors::Error> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
                ..Default::default()
            },
        )
        .await?;
    docker.start_exec(&exec.id, None).await?;
    Ok(())
}

/// Packs files into an uncompressed tar archive with relative paths.
fn tar_archive(files: &BTreeMap<String, String>) -> Result<Vec<u8>, SandboxError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .map_err(|e| SandboxError::io("archive", path, e.to_string()))?;
    }
    builder
        .into_inner()
        .map_err(|e| SandboxError::io("archive", WORKSPACE, e.to_string()))
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.to_lowercase();
    let invalid = |_| SandboxError::boot_failed(format!("invalid memory limit: {limit}"));

    if let Some(num) = limit.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(invalid)?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(invalid)?;
        Ok(megs * 1024 * 1024)
    } else {
        limit.parse().map_err(invalid)
    }
}
