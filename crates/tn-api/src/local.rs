//! Local-mode deployments on the host's Docker engine.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tn_infra::exec::run_command;
use tn_infra::types::ExecOutput;
use tracing::info;

const COMPOSE_TIMEOUT: Duration = Duration::from_secs(600);

/// Brings a manifest up or down without any machines.
#[async_trait]
pub trait LocalEngine: Send + Sync + 'static {
    async fn up(&self, manifest: &Path, project: &str) -> tn_infra::Result<()>;
    async fn down(&self, manifest: &Path, project: &str) -> tn_infra::Result<()>;
}

/// `docker compose` against the local daemon.
#[derive(Debug, Clone)]
pub struct DockerCompose {
    binary: String,
}

impl Default for DockerCompose {
    fn default() -> Self {
        Self {
            binary: "docker".into(),
        }
    }
}

impl DockerCompose {
    fn args(manifest: &Path, project: &str, action: &[&str]) -> Vec<String> {
        let mut args = vec![
            "compose".to_string(),
            "-f".into(),
            manifest.display().to_string(),
            "-p".into(),
            project.to_string(),
        ];
        args.extend(action.iter().map(|a| a.to_string()));
        args
    }

    async fn compose(&self, manifest: &Path, project: &str, action: &[&str]) -> tn_infra::Result<()> {
        let args = Self::args(manifest, project, action);
        let out = run_command(&self.binary, &args, COMPOSE_TIMEOUT).await?;
        check(project, &args, out)
    }
}

fn check(project: &str, args: &[String], out: ExecOutput) -> tn_infra::Result<()> {
    if out.success() {
        return Ok(());
    }
    Err(tn_infra::Error::RemoteExec {
        machine: "localhost".into(),
        reason: format!(
            "{project}: docker {} exited {}: {}",
            args.join(" "),
            out.exit_code,
            out.stderr.trim()
        ),
    })
}

#[async_trait]
impl LocalEngine for DockerCompose {
    async fn up(&self, manifest: &Path, project: &str) -> tn_infra::Result<()> {
        info!(project, manifest = %manifest.display(), "starting local deployment");
        self.compose(manifest, project, &["up", "-d"]).await
    }

    async fn down(&self, manifest: &Path, project: &str) -> tn_infra::Result<()> {
        info!(project, "stopping local deployment");
        self.compose(manifest, project, &["down", "--volumes"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_args_name_the_project() {
        let args = DockerCompose::args(Path::new("/out/exp/docker-compose.yml"), "exp", &["up", "-d"]);
        assert_eq!(
            args,
            vec!["compose", "-f", "/out/exp/docker-compose.yml", "-p", "exp", "up", "-d"]
        );
    }

    #[test]
    fn failed_compose_reports_stderr() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "no such image\n".into(),
        };
        let err = check("exp", &["compose".into()], out).unwrap_err();
        assert!(err.to_string().contains("no such image"));
        assert!(matches!(err, tn_infra::Error::RemoteExec { .. }));
    }
}
