//! Collaborators the runtime drives but does not own: package-manager
//! installs, external service resolution and per-service build commands.
//!
//! Each collaborator is a trait so the runtime and the CLI can be tested
//! without touching the network or a real package manager.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backends::WorkerExit;
use crate::backends::log_forwarder::{StreamKind, spawn_stream_forwarder};
use crate::descriptor::{CommandSpec, PackageManager, ServiceDescriptor, ServiceId};

/// Run `command` in `dir`, forwarding its output into the log as `service`.
async fn run_command(service: &ServiceId, command: &CommandSpec, dir: &Path) -> io::Result<WorkerExit> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let cancel = CancellationToken::new();
    let mut forwarders = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        forwarders.push(spawn_stream_forwarder(
            stdout,
            service.clone(),
            Uuid::nil(),
            cancel.clone(),
            StreamKind::Stdout,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        forwarders.push(spawn_stream_forwarder(
            stderr,
            service.clone(),
            Uuid::nil(),
            cancel.clone(),
            StreamKind::Stderr,
        ));
    }

    let status = child.wait().await?;
    for forwarder in forwarders {
        _ = forwarder.await;
    }
    Ok(status.into())
}

// ---------------------------------------------------------------------------
// Dependency installation
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DependencyInstallError {
    #[error("failed to run '{command}' in {}: {source}", .dir.display())]
    Spawn {
        command: String,
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("'{command}' in {} failed with {exit}", .dir.display())]
    Failed {
        command: String,
        dir: PathBuf,
        exit: WorkerExit,
    },
}

/// Install command of `manager`, optionally limited to production dependencies.
#[must_use]
pub fn install_command(manager: PackageManager, production: bool) -> CommandSpec {
    let mut args = vec!["install".to_owned()];
    if production {
        let flag = match manager {
            PackageManager::Npm => "--omit=dev",
            PackageManager::Pnpm => "--prod",
            PackageManager::Yarn => "--production",
        };
        args.push(flag.to_owned());
    }
    CommandSpec::new(manager.program()).with_args(args)
}

#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    /// # Errors
    /// `DependencyInstallError` when the package manager cannot be run or fails.
    async fn install(
        &self,
        label: &ServiceId,
        dir: &Path,
        manager: PackageManager,
        production: bool,
    ) -> Result<(), DependencyInstallError>;
}

/// Installs dependencies by running the package manager binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackageManagerInstaller;

#[async_trait]
impl DependencyInstaller for PackageManagerInstaller {
    async fn install(
        &self,
        label: &ServiceId,
        dir: &Path,
        manager: PackageManager,
        production: bool,
    ) -> Result<(), DependencyInstallError> {
        let command = install_command(manager, production);
        tracing::info!(
            service = %label,
            dir = %dir.display(),
            manager = %manager,
            production,
            "Installing dependencies"
        );
        let exit = run_command(label, &command, dir)
            .await
            .map_err(|source| DependencyInstallError::Spawn {
                command: command.to_string(),
                dir: dir.to_path_buf(),
                source,
            })?;
        if exit.success() {
            Ok(())
        } else {
            Err(DependencyInstallError::Failed {
                command: command.to_string(),
                dir: dir.to_path_buf(),
                exit,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// External service resolution
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("directory {} of service '{service}' does not exist and is outside the project", .path.display())]
    OutsideProject { service: ServiceId, path: PathBuf },
    #[error("directory {} of service '{service}' does not exist and the service has no repository url", .path.display())]
    MissingDirectory { service: ServiceId, path: PathBuf },
    #[error("unable to clone repository of service '{service}': {detail}")]
    Clone { service: ServiceId, detail: String },
    #[error(transparent)]
    Install(#[from] DependencyInstallError),
}

/// What resolving a service will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionPlan {
    /// The service directory already exists; nothing to do.
    Existing(PathBuf),
    Clone {
        url: String,
        branch: Option<String>,
        destination: PathBuf,
    },
}

/// Environment variable overriding where an external service lives.
#[must_use]
pub fn service_path_env(service: &ServiceId) -> String {
    let id: String = service
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("WEFT_SERVICE_{id}_PATH")
}

/// Decide how to resolve `descriptor` inside the project at `root`.
///
/// `path_override` (relative paths are taken from `root`) replaces the
/// descriptor's own path.
///
/// # Errors
/// `OutsideProject` when a missing destination lies outside `root`,
/// `MissingDirectory` when the directory is missing and there is nothing to clone.
pub fn plan_resolution(
    root: &Path,
    descriptor: &ServiceDescriptor,
    path_override: Option<&str>,
) -> Result<ResolutionPlan, ResolutionError> {
    let destination = match path_override.filter(|p| !p.is_empty()) {
        Some(path) => root.join(path),
        None => root.join(&descriptor.path),
    };

    if destination.is_dir() {
        return Ok(ResolutionPlan::Existing(destination));
    }
    if !destination.starts_with(root) {
        return Err(ResolutionError::OutsideProject {
            service: descriptor.id.clone(),
            path: destination,
        });
    }
    let Some(source) = &descriptor.source else {
        return Err(ResolutionError::MissingDirectory {
            service: descriptor.id.clone(),
            path: destination,
        });
    };
    Ok(ResolutionPlan::Clone {
        url: source.url.clone(),
        branch: source.branch.clone(),
        destination,
    })
}

#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Make the service's directory available and return where it is.
    ///
    /// # Errors
    /// `ResolutionError` when the directory cannot be found or produced.
    async fn resolve(&self, descriptor: &ServiceDescriptor) -> Result<PathBuf, ResolutionError>;
}

/// Resolves external services by cloning their git repository and installing
/// their dependencies.
pub struct GitServiceResolver {
    root: PathBuf,
    installer: Arc<dyn DependencyInstaller>,
    production: bool,
}

impl GitServiceResolver {
    #[must_use]
    pub fn new(root: PathBuf, installer: Arc<dyn DependencyInstaller>, production: bool) -> Self {
        Self {
            root,
            installer,
            production,
        }
    }
}

#[async_trait]
impl ServiceResolver for GitServiceResolver {
    async fn resolve(&self, descriptor: &ServiceDescriptor) -> Result<PathBuf, ResolutionError> {
        let service = &descriptor.id;
        let path_override = std::env::var(service_path_env(service)).ok();
        let plan = plan_resolution(&self.root, descriptor, path_override.as_deref())?;

        let (url, branch, destination) = match plan {
            ResolutionPlan::Existing(path) => {
                tracing::info!(service = %service, path = %path.display(), "Service directory exists, skipping");
                return Ok(path);
            }
            ResolutionPlan::Clone {
                url,
                branch,
                destination,
            } => (url, branch, destination),
        };

        let clone_error = |detail: String| ResolutionError::Clone {
            service: service.clone(),
            detail,
        };
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| clone_error(format!("cannot create {}: {e}", parent.display())))?;
        }

        let mut args = vec!["clone".to_owned()];
        if let Some(branch) = &branch {
            args.push("--branch".to_owned());
            args.push(branch.clone());
        }
        args.push(url.clone());
        args.push(destination.display().to_string());
        let command = CommandSpec::new("git").with_args(args);

        tracing::info!(service = %service, url = %url, destination = %destination.display(), "Cloning service repository");
        let exit = run_command(service, &command, &self.root)
            .await
            .map_err(|e| clone_error(e.to_string()))?;
        if !exit.success() {
            return Err(clone_error(format!("git clone failed with {exit}")));
        }

        self.installer
            .install(service, &destination, descriptor.package_manager, self.production)
            .await?;
        Ok(destination)
    }
}

// ---------------------------------------------------------------------------
// Builds
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to run build command '{command}' of service '{service}': {source}")]
    Spawn {
        service: ServiceId,
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("building service '{service}' failed with {exit}")]
    Failed { service: ServiceId, exit: WorkerExit },
}

#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Build the service. `Ok(false)` when it has no build step.
    ///
    /// # Errors
    /// `BuildError` when the build cannot be run or fails.
    async fn build(&self, descriptor: &ServiceDescriptor) -> Result<bool, BuildError>;
}

/// Runs the descriptor's `build` command in the service directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandBuildRunner;

#[async_trait]
impl BuildRunner for CommandBuildRunner {
    async fn build(&self, descriptor: &ServiceDescriptor) -> Result<bool, BuildError> {
        let Some(command) = &descriptor.build else {
            return Ok(false);
        };
        let service = &descriptor.id;
        tracing::info!(service = %service, command = %command, "Building service");
        let exit = run_command(service, command, &descriptor.path)
            .await
            .map_err(|source| BuildError::Spawn {
                service: service.clone(),
                command: command.to_string(),
                source,
            })?;
        if exit.success() {
            Ok(true)
        } else {
            Err(BuildError::Failed {
                service: service.clone(),
                exit,
            })
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::descriptor::ExternalSource;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").with_args(["-c", script])
    }

    #[test]
    fn install_flags_per_manager() {
        assert_eq!(install_command(PackageManager::Npm, false).to_string(), "npm install");
        assert_eq!(
            install_command(PackageManager::Npm, true).to_string(),
            "npm install --omit=dev"
        );
        assert_eq!(
            install_command(PackageManager::Pnpm, true).to_string(),
            "pnpm install --prod"
        );
        assert_eq!(
            install_command(PackageManager::Yarn, true).to_string(),
            "yarn install --production"
        );
    }

    #[test]
    fn path_env_is_upper_snake_case() {
        assert_eq!(service_path_env(&"my-service".into()), "WEFT_SERVICE_MY_SERVICE_PATH");
    }

    #[test]
    fn existing_directory_is_reused() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("external/docs")).unwrap();
        let descriptor = ServiceDescriptor::new("docs", "external/docs");

        let plan = plan_resolution(root.path(), &descriptor, None).unwrap();
        assert_eq!(plan, ResolutionPlan::Existing(root.path().join("external/docs")));
    }

    #[test]
    fn override_outside_project_must_exist() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let missing = outside.path().join("nope");
        let descriptor = ServiceDescriptor::new("docs", "external/docs");

        let err = plan_resolution(root.path(), &descriptor, missing.to_str()).unwrap_err();
        assert!(matches!(err, ResolutionError::OutsideProject { .. }));

        let plan = plan_resolution(root.path(), &descriptor, outside.path().to_str()).unwrap();
        assert_eq!(plan, ResolutionPlan::Existing(outside.path().to_path_buf()));
    }

    #[test]
    fn missing_directory_with_url_is_cloned() {
        let root = tempfile::tempdir().unwrap();
        let mut descriptor = ServiceDescriptor::new("docs", "external/docs");
        descriptor.source = Some(ExternalSource {
            url: "https://example.invalid/docs.git".into(),
            branch: Some("next".into()),
        });

        let plan = plan_resolution(root.path(), &descriptor, Some("web/docs")).unwrap();
        assert_eq!(
            plan,
            ResolutionPlan::Clone {
                url: "https://example.invalid/docs.git".into(),
                branch: Some("next".into()),
                destination: root.path().join("web/docs"),
            }
        );

        descriptor.source = None;
        assert!(matches!(
            plan_resolution(root.path(), &descriptor, None),
            Err(ResolutionError::MissingDirectory { .. })
        ));
    }

    #[tokio::test]
    async fn resolver_skips_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("web/main")).unwrap();
        let resolver = GitServiceResolver::new(
            root.path().to_path_buf(),
            Arc::new(PackageManagerInstaller),
            false,
        );
        let path = resolver
            .resolve(&ServiceDescriptor::new("main", "web/main"))
            .await
            .unwrap();
        assert_eq!(path, root.path().join("web/main"));
    }

    #[tokio::test]
    async fn build_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ServiceDescriptor::new("main", dir.path()).with_build(sh("echo building; exit 3"));

        let err = CommandBuildRunner.build(&descriptor).await.unwrap_err();
        match &err {
            BuildError::Failed { service, exit } => {
                assert_eq!(service.as_str(), "main");
                assert_eq!(exit.code, Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn build_without_command_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ServiceDescriptor::new("main", dir.path());
        assert!(!CommandBuildRunner.build(&descriptor).await.unwrap());

        let descriptor = descriptor.with_build(sh("true"));
        assert!(CommandBuildRunner.build(&descriptor).await.unwrap());
    }

    #[tokio::test]
    async fn install_in_missing_directory_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let err = PackageManagerInstaller
            .install(&"main".into(), &dir.path().join("missing"), PackageManager::Npm, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DependencyInstallError::Spawn { .. }));
    }
}
