//! Service Descriptor Store
//!
//! Resolved, validated configuration for every service the runtime supervises.
//! Descriptors are immutable once the runtime starts; the store validates the
//! whole set (unique ids, known dependencies, acyclic `depends_on`, well-formed
//! and non-colliding prefixes) before any worker is launched.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RouteConflictError;

/// Unique identifier of a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ServiceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ServiceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Package manager used to install a service's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
}

impl PackageManager {
    /// Executable name of the package manager.
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

impl FromStr for PackageManager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "npm" => Ok(PackageManager::Npm),
            "pnpm" => Ok(PackageManager::Pnpm),
            "yarn" => Ok(PackageManager::Yarn),
            other => Err(format!("unsupported package manager '{other}'")),
        }
    }
}

/// How the delay between consecutive restarts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded-retry-with-backoff configuration governing crash recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Crashes tolerated before the service is given up on.
    pub max_restarts: u32,
    /// How long a worker must stay `Ready` before its crash count resets.
    pub window: Duration,
    /// Delay before the first restart.
    pub backoff: Duration,
    pub strategy: BackoffStrategy,
    /// Upper bound for exponential backoff.
    pub max_backoff: Duration,
    /// Surface a runtime-level failure when restarts are exhausted.
    pub fatal_after_exceeded: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(5000),
            strategy: BackoffStrategy::Fixed,
            max_backoff: Duration::from_secs(60),
            fatal_after_exceeded: false,
        }
    }
}

impl RestartPolicy {
    /// A policy that never restarts.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Delay before the `attempt`-th restart (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.backoff,
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.backoff
                    .saturating_mul(1_u32 << shift)
                    .min(self.max_backoff)
            }
        }
    }
}

/// Program plus arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Build from an argv-style list; `None` when the list is empty.
    #[must_use]
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Git location of a service that lives outside the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSource {
    pub url: String,
    pub branch: Option<String>,
}

/// Resolved configuration of a single service.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub path: PathBuf,
    pub entrypoint: CommandSpec,
    pub prefix: Option<String>,
    pub depends_on: BTreeSet<ServiceId>,
    pub package_manager: PackageManager,
    pub watch_enabled: bool,
    pub env: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub startup_timeout: Option<Duration>,
    pub build: Option<CommandSpec>,
    pub source: Option<ExternalSource>,
}

impl ServiceDescriptor {
    /// Descriptor with defaults: `<package manager> start` as entrypoint, no prefix,
    /// no dependencies, default restart policy.
    pub fn new(id: impl Into<ServiceId>, path: impl Into<PathBuf>) -> Self {
        let package_manager = PackageManager::default();
        Self {
            id: id.into(),
            path: path.into(),
            entrypoint: CommandSpec::new(package_manager.program()).with_args(["start"]),
            prefix: None,
            depends_on: BTreeSet::new(),
            package_manager,
            watch_enabled: false,
            env: BTreeMap::new(),
            restart_policy: RestartPolicy::default(),
            startup_timeout: None,
            build: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_entrypoint(mut self, command: CommandSpec) -> Self {
        self.entrypoint = command;
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, id: impl Into<ServiceId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    #[must_use]
    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    #[must_use]
    pub fn with_watch(mut self, enabled: bool) -> Self {
        self.watch_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_build(mut self, command: CommandSpec) -> Self {
        self.build = Some(command);
        self
    }
}

/// Descriptor validation failures. All of them are fatal before any worker starts.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("duplicate service id '{0}'")]
    DuplicateService(ServiceId),
    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        service: ServiceId,
        dependency: ServiceId,
    },
    #[error("dependency cycle detected: {}", format_cycle(.0))]
    DependencyCycle(Vec<ServiceId>),
    #[error("service '{service}' has invalid prefix '{prefix}': {reason}")]
    InvalidPrefix {
        service: ServiceId,
        prefix: String,
        reason: &'static str,
    },
    #[error("entrypoint '{0}' is not a configured service")]
    UnknownEntrypoint(ServiceId),
    #[error(transparent)]
    RouteConflict(#[from] RouteConflictError),
}

fn format_cycle(cycle: &[ServiceId]) -> String {
    cycle
        .iter()
        .map(ServiceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Normalize a URL prefix: leading slash, no trailing slash (except root),
/// no empty segments, no query or fragment.
///
/// # Errors
/// Returns the reason the prefix is rejected.
pub fn normalize_prefix(raw: &str) -> Result<String, &'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("prefix is empty");
    }
    if trimmed.contains(['?', '#']) {
        return Err("prefix must not contain a query or fragment");
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err("prefix must not contain whitespace");
    }

    let body = trimmed.trim_matches('/');
    if body.is_empty() {
        return Ok("/".to_owned());
    }
    if body.split('/').any(str::is_empty) {
        return Err("prefix must not contain empty path segments");
    }
    Ok(format!("/{body}"))
}

/// Validated set of service descriptors.
#[derive(Debug, Clone, Default)]
pub struct DescriptorStore {
    services: HashMap<ServiceId, Arc<ServiceDescriptor>>,
    /// Declaration order; used for deterministic start order and route tie-breaks.
    order: Vec<ServiceId>,
    entrypoint: Option<ServiceId>,
}

impl DescriptorStore {
    /// Build and validate a store.
    ///
    /// # Errors
    /// Returns `DescriptorError` when ids collide, dependencies are unknown or cyclic,
    /// prefixes are malformed or collide, or the entrypoint is unknown.
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        entrypoint: Option<ServiceId>,
    ) -> Result<Self, DescriptorError> {
        let mut store = Self {
            services: HashMap::new(),
            order: Vec::new(),
            entrypoint: None,
        };
        for descriptor in descriptors {
            store.insert(descriptor)?;
        }
        if let Some(ep) = entrypoint {
            if !store.services.contains_key(&ep) {
                return Err(DescriptorError::UnknownEntrypoint(ep));
            }
            store.entrypoint = Some(ep);
        }
        store.validate()?;
        Ok(store)
    }

    /// Add a service discovered after initial loading (e.g. a resolved external service).
    ///
    /// # Errors
    /// Returns `DescriptorError` if the resulting set is invalid; the store is left unchanged.
    pub fn add_service(&mut self, descriptor: ServiceDescriptor) -> Result<(), DescriptorError> {
        let mut next = self.clone();
        next.insert(descriptor)?;
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn insert(&mut self, mut descriptor: ServiceDescriptor) -> Result<(), DescriptorError> {
        if self.services.contains_key(&descriptor.id) {
            return Err(DescriptorError::DuplicateService(descriptor.id));
        }
        if let Some(raw) = descriptor.prefix.take() {
            let normalized =
                normalize_prefix(&raw).map_err(|reason| DescriptorError::InvalidPrefix {
                    service: descriptor.id.clone(),
                    prefix: raw.clone(),
                    reason,
                })?;
            descriptor.prefix = Some(normalized);
        }
        self.order.push(descriptor.id.clone());
        self.services
            .insert(descriptor.id.clone(), Arc::new(descriptor));
        Ok(())
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        for id in &self.order {
            let descriptor = &self.services[id];
            for dep in &descriptor.depends_on {
                if !self.services.contains_key(dep) {
                    return Err(DescriptorError::UnknownDependency {
                        service: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        if let Some(cycle) = self.find_cycle() {
            return Err(DescriptorError::DependencyCycle(cycle));
        }

        let mut claimed: HashMap<String, &ServiceId> = HashMap::new();
        for id in &self.order {
            let mount = self.mount_for(id).unwrap_or_else(|| "/".to_owned());
            if let Some(first) = claimed.get(&mount) {
                return Err(RouteConflictError {
                    prefix: mount,
                    first: (*first).clone(),
                    second: id.clone(),
                }
                .into());
            }
            claimed.insert(mount, id);
        }
        Ok(())
    }

    /// Depth-first search returning the first cycle found, closed on its first node.
    fn find_cycle(&self) -> Option<Vec<ServiceId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            store: &DescriptorStore,
            id: &ServiceId,
            marks: &mut HashMap<ServiceId, Mark>,
            path: &mut Vec<ServiceId>,
        ) -> Option<Vec<ServiceId>> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| p == id).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(id.clone());
                    return Some(cycle);
                }
                None => {}
            }
            marks.insert(id.clone(), Mark::Visiting);
            path.push(id.clone());
            if let Some(descriptor) = store.services.get(id) {
                for dep in &descriptor.depends_on {
                    if let Some(cycle) = visit(store, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(id.clone(), Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        let mut path = Vec::new();
        self.order
            .iter()
            .find_map(|id| visit(self, id, &mut marks, &mut path))
    }

    #[must_use]
    pub fn get(&self, id: &ServiceId) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ServiceId) -> bool {
        self.services.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Descriptors in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.order.iter().map(|id| &self.services[id])
    }

    /// Service ids in declaration order.
    #[must_use]
    pub fn ids(&self) -> &[ServiceId] {
        &self.order
    }

    #[must_use]
    pub fn entrypoint(&self) -> Option<&ServiceId> {
        self.entrypoint.as_ref()
    }

    #[must_use]
    pub fn is_entrypoint(&self, id: &ServiceId) -> bool {
        self.entrypoint.as_ref() == Some(id)
    }

    /// Externally exposed mount of a service: its configured prefix, `/` for the
    /// entrypoint, `/<id>` otherwise.
    #[must_use]
    pub fn mount_for(&self, id: &ServiceId) -> Option<String> {
        let descriptor = self.services.get(id)?;
        if let Some(prefix) = &descriptor.prefix {
            return Some(prefix.clone());
        }
        if self.is_entrypoint(id) {
            return Some("/".to_owned());
        }
        Some(format!("/{id}"))
    }

    /// Services that list `id` in their `depends_on`.
    #[must_use]
    pub fn dependents_of(&self, id: &ServiceId) -> Vec<ServiceId> {
        self.iter()
            .filter(|d| d.depends_on.contains(id))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Topological start order: every dependency precedes its dependents; otherwise
    /// declaration order is preserved.
    #[must_use]
    pub fn start_order(&self) -> Vec<ServiceId> {
        let mut remaining: HashMap<&ServiceId, usize> = self
            .order
            .iter()
            .map(|id| (id, self.services[id].depends_on.len()))
            .collect();
        let mut ordered = Vec::with_capacity(self.order.len());

        while ordered.len() < self.order.len() {
            let next = self
                .order
                .iter()
                .find(|id| remaining.get(id) == Some(&0));
            let Some(next) = next else {
                // Unreachable for a validated store; cycles are rejected up front.
                break;
            };
            remaining.remove(next);
            for dependent in self.dependents_of(next) {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                }
            }
            ordered.push(next.clone());
        }
        ordered
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn svc(id: &str) -> ServiceDescriptor {
        ServiceDescriptor::new(id, format!("web/{id}"))
    }

    #[test]
    fn normalize_prefix_rules() {
        assert_eq!(normalize_prefix("/api").unwrap(), "/api");
        assert_eq!(normalize_prefix("api/").unwrap(), "/api");
        assert_eq!(normalize_prefix("/").unwrap(), "/");
        assert_eq!(normalize_prefix("/a/b/").unwrap(), "/a/b");
        assert!(normalize_prefix("").is_err());
        assert!(normalize_prefix("/a//b").is_err());
        assert!(normalize_prefix("/a?x=1").is_err());
        assert!(normalize_prefix("/a b").is_err());
    }

    #[test]
    fn start_order_respects_dependencies() {
        let store = DescriptorStore::new(
            vec![
                svc("frontend").depends_on("api"),
                svc("api").depends_on("db"),
                svc("db"),
                svc("metrics"),
            ],
            None,
        )
        .unwrap();

        let order: Vec<String> = store
            .start_order()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        let pos = |name: &str| order.iter().position(|o| o == name).unwrap();
        assert!(pos("db") < pos("api"));
        assert!(pos("api") < pos("frontend"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn start_order_keeps_declaration_order_without_dependencies() {
        let store = DescriptorStore::new(vec![svc("c"), svc("a"), svc("b")], None).unwrap();
        assert_eq!(
            store.start_order(),
            vec![ServiceId::from("c"), ServiceId::from("a"), ServiceId::from("b")]
        );
    }

    #[test]
    fn cycle_is_rejected_before_start() {
        let err = DescriptorStore::new(
            vec![
                svc("a").depends_on("b"),
                svc("b").depends_on("c"),
                svc("c").depends_on("a"),
            ],
            None,
        )
        .unwrap_err();

        match err {
            DescriptorError::DependencyCycle(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = DescriptorStore::new(vec![svc("a").depends_on("ghost")], None).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownDependency { .. }));
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = DescriptorStore::new(vec![svc("a"), svc("a")], None).unwrap_err();
        assert!(matches!(err, DescriptorError::DuplicateService(_)));
    }

    #[test]
    fn prefix_collision_is_a_route_conflict() {
        let err = DescriptorStore::new(
            vec![svc("main").with_prefix("/"), svc("api").with_prefix("/")],
            Some(ServiceId::from("main")),
        )
        .unwrap_err();

        match err {
            DescriptorError::RouteConflict(conflict) => {
                assert_eq!(conflict.prefix, "/");
                assert_eq!(conflict.first.as_str(), "main");
                assert_eq!(conflict.second.as_str(), "api");
            }
            other => panic!("expected route conflict, got {other:?}"),
        }
    }

    #[test]
    fn entrypoint_defaults_to_root_mount() {
        let store = DescriptorStore::new(
            vec![svc("main"), svc("api").with_prefix("api")],
            Some(ServiceId::from("main")),
        )
        .unwrap();
        assert_eq!(store.mount_for(&"main".into()).unwrap(), "/");
        assert_eq!(store.mount_for(&"api".into()).unwrap(), "/api");
    }

    #[test]
    fn non_entrypoint_defaults_to_id_mount() {
        let store = DescriptorStore::new(vec![svc("worker")], None).unwrap();
        assert_eq!(store.mount_for(&"worker".into()).unwrap(), "/worker");
    }

    #[test]
    fn unknown_entrypoint_is_rejected() {
        let err = DescriptorStore::new(vec![svc("a")], Some("b".into())).unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownEntrypoint(_)));
    }

    #[test]
    fn add_service_leaves_store_unchanged_on_error() {
        let mut store = DescriptorStore::new(vec![svc("a")], None).unwrap();
        let err = store.add_service(svc("b").depends_on("missing"));
        assert!(err.is_err());
        assert_eq!(store.len(), 1);

        store.add_service(svc("b").depends_on("a")).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.dependents_of(&"a".into()), vec![ServiceId::from("b")]);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RestartPolicy {
            backoff: Duration::from_millis(100),
            strategy: BackoffStrategy::Exponential,
            max_backoff: Duration::from_millis(350),
            ..RestartPolicy::default()
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_for(30), Duration::from_millis(350));
    }

    #[test]
    fn package_manager_parsing() {
        assert_eq!("PNPM".parse::<PackageManager>().unwrap(), PackageManager::Pnpm);
        assert!("bun".parse::<PackageManager>().is_err());
        assert_eq!(PackageManager::Yarn.program(), "yarn");
    }
}
