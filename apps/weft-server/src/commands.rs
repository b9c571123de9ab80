//! One-shot project commands: install, resolve, build.

use anyhow::{Context, Result, bail};
use std::sync::Arc;

use weft_bootstrap::ValidatedConfig;
use weft_runtime::collaborators::{
    BuildRunner, CommandBuildRunner, DependencyInstaller, GitServiceResolver, PackageManagerInstaller,
    ServiceResolver,
};
use weft_runtime::{PackageManager, ServiceId};

/// Marker file of a directory with installable dependencies.
const MANIFEST: &str = "package.json";

/// Install the project's own dependencies, then every service's.
///
/// A service's declared package manager wins over `preferred`.
pub async fn install(
    config: &ValidatedConfig,
    production: bool,
    preferred: Option<PackageManager>,
) -> Result<()> {
    let installer = PackageManagerInstaller;
    let fallback = preferred.unwrap_or_default();

    if config.root.join(MANIFEST).is_file() {
        installer
            .install(&ServiceId::from("project"), &config.root, fallback, production)
            .await?;
    }

    for id in config.store.start_order() {
        let Some(descriptor) = config.store.get(&id) else {
            continue;
        };
        if !descriptor.path.is_dir() {
            tracing::warn!(service = %id, path = %descriptor.path.display(), "Service is not resolved, skipping");
            continue;
        }
        let manager = declared_manager(config, &id).unwrap_or(fallback);
        installer
            .install(&id, &descriptor.path, manager, production)
            .await
            .with_context(|| format!("installing dependencies of service '{id}'"))?;
    }
    tracing::info!("Dependencies installed");
    Ok(())
}

fn declared_manager(config: &ValidatedConfig, id: &ServiceId) -> Option<PackageManager> {
    config
        .config
        .services
        .iter()
        .find(|s| s.id.trim() == id.as_str())
        .and_then(|s| s.package_manager)
}

/// Clone every external service that is not present yet.
pub async fn resolve(config: &ValidatedConfig, production: bool) -> Result<()> {
    let resolver = GitServiceResolver::new(
        config.root.clone(),
        Arc::new(PackageManagerInstaller),
        production,
    );
    let mut resolved = 0_usize;
    for descriptor in config.store.iter().filter(|d| d.source.is_some()) {
        let path = resolver.resolve(descriptor).await?;
        tracing::info!(service = %descriptor.id, path = %path.display(), "Service resolved");
        resolved += 1;
    }
    tracing::info!(resolved, "Resolution complete");
    Ok(())
}

/// Build every service in dependency order, stopping at the first failure.
pub async fn build(config: &ValidatedConfig) -> Result<()> {
    config.ensure_resolved()?;
    let runner = CommandBuildRunner;
    let mut built = 0_usize;
    for id in config.store.start_order() {
        let Some(descriptor) = config.store.get(&id) else {
            bail!("service '{id}' vanished from the descriptor store");
        };
        if runner.build(descriptor).await? {
            built += 1;
        }
    }
    tracing::info!(built, "Build complete");
    Ok(())
}
