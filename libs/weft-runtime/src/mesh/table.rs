//! Immutable routing snapshots.
//!
//! A [`RouteTable`] holds the ordered prefix entries together with the dispatch
//! endpoint of every routed worker, so one snapshot never mixes workers.

use http::Method;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::dispatch::Dispatch;
use crate::descriptor::ServiceId;
use crate::error::RouteConflictError;
use crate::worker::WorkerState;

/// One prefix mapped to one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    pub prefix: String,
    pub service_id: ServiceId,
    /// Upper-case method names; empty means every method.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    pub is_fallback: bool,
    /// Leading path removed before forwarding (the service's mount).
    pub strip_prefix: String,
}

impl RouteEntry {
    fn allows(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method.as_str())
    }
}

/// Dispatch target of the worker currently serving a service.
#[derive(Clone)]
pub struct WorkerEndpoint {
    pub service_id: ServiceId,
    pub worker_id: Uuid,
    pub dispatch: Arc<dyn Dispatch>,
    pub state: watch::Receiver<WorkerState>,
}

impl WorkerEndpoint {
    #[must_use]
    pub fn current_state(&self) -> WorkerState {
        *self.state.borrow()
    }
}

impl fmt::Debug for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEndpoint")
            .field("service_id", &self.service_id)
            .field("worker_id", &self.worker_id)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

/// Committed routes of one service, in announcement order.
#[derive(Debug, Clone)]
pub struct ServiceRoutes {
    pub endpoint: WorkerEndpoint,
    pub entries: Vec<RouteEntry>,
}

/// Result of matching a request against a table.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteMatch<'a> {
    Found {
        entry: &'a RouteEntry,
        forwarded_path: String,
    },
    MethodNotAllowed,
    NotFound,
}

/// Remainder of `path` under `prefix`, honoring segment boundaries.
fn strip_segment_prefix<'p>(prefix: &str, path: &'p str) -> Option<&'p str> {
    if prefix == "/" {
        return Some(path);
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Join a mount and a mount-relative route path into an absolute prefix.
#[must_use]
pub fn join_prefix(mount: &str, path: &str) -> String {
    let path = path.trim_matches('/');
    match (mount == "/", path.is_empty()) {
        (_, true) => mount.to_owned(),
        (true, false) => format!("/{path}"),
        (false, false) => format!("{mount}/{path}"),
    }
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
    endpoints: HashMap<ServiceId, WorkerEndpoint>,
    generation: u64,
}

impl RouteTable {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from per-service routes listed in declaration order.
    ///
    /// Entries are ordered longest prefix first; ties keep declaration order and
    /// fallback entries come after every regular entry.
    ///
    /// # Errors
    /// `RouteConflictError` when two services claim an identical prefix.
    pub fn build(services: &[ServiceRoutes], generation: u64) -> Result<Self, RouteConflictError> {
        let mut owners: HashMap<(&str, bool), &ServiceId> = HashMap::new();
        let mut entries = Vec::new();
        let mut endpoints = HashMap::new();

        for routes in services {
            for entry in &routes.entries {
                let key = (entry.prefix.as_str(), entry.is_fallback);
                match owners.get(&key) {
                    Some(owner) if **owner != entry.service_id => {
                        return Err(RouteConflictError {
                            prefix: entry.prefix.clone(),
                            first: (*owner).clone(),
                            second: entry.service_id.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        owners.insert(key, &entry.service_id);
                    }
                }
                entries.push(entry.clone());
            }
            endpoints.insert(
                routes.endpoint.service_id.clone(),
                routes.endpoint.clone(),
            );
        }

        entries.sort_by(|a, b| {
            a.is_fallback
                .cmp(&b.is_fallback)
                .then_with(|| b.prefix.len().cmp(&a.prefix.len()))
        });

        Ok(Self {
            entries,
            endpoints,
            generation,
        })
    }

    #[must_use]
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    #[must_use]
    pub fn endpoint(&self, service: &ServiceId) -> Option<&WorkerEndpoint> {
        self.endpoints.get(service)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First entry whose prefix covers `path` and accepts `method`.
    #[must_use]
    pub fn lookup(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let mut path_matched = false;
        for entry in &self.entries {
            if strip_segment_prefix(&entry.prefix, path).is_none() {
                continue;
            }
            if !entry.allows(method) {
                path_matched = true;
                continue;
            }
            let rest = strip_segment_prefix(&entry.strip_prefix, path).unwrap_or(path);
            let forwarded_path = if rest.is_empty() {
                "/".to_owned()
            } else {
                rest.to_owned()
            };
            return RouteMatch::Found {
                entry,
                forwarded_path,
            };
        }
        if path_matched {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::mesh::RouterDispatch;

    fn endpoint(service: &str) -> WorkerEndpoint {
        let (_tx, rx) = watch::channel(WorkerState::Ready);
        WorkerEndpoint {
            service_id: service.into(),
            worker_id: Uuid::now_v7(),
            dispatch: Arc::new(RouterDispatch::new()),
            state: rx,
        }
    }

    fn entry(service: &str, prefix: &str) -> RouteEntry {
        RouteEntry {
            prefix: prefix.to_owned(),
            service_id: service.into(),
            methods: Vec::new(),
            is_fallback: false,
            strip_prefix: prefix.to_owned(),
        }
    }

    fn routes(service: &str, entries: Vec<RouteEntry>) -> ServiceRoutes {
        ServiceRoutes {
            endpoint: endpoint(service),
            entries,
        }
    }

    fn found(table: &RouteTable, method: &Method, path: &str) -> (String, String) {
        match table.lookup(method, path) {
            RouteMatch::Found {
                entry,
                forwarded_path,
            } => (entry.service_id.to_string(), forwarded_path),
            other => panic!("expected a match for {path}, got {other:?}"),
        }
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::build(
            &[
                routes("main", vec![entry("main", "/")]),
                routes("api", vec![entry("api", "/api")]),
            ],
            1,
        )
        .unwrap();

        assert_eq!(found(&table, &Method::GET, "/api/users"), ("api".into(), "/users".into()));
        assert_eq!(found(&table, &Method::GET, "/api"), ("api".into(), "/".into()));
        assert_eq!(found(&table, &Method::GET, "/about"), ("main".into(), "/about".into()));
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let table = RouteTable::build(&[routes("api", vec![entry("api", "/api")])], 1).unwrap();
        assert_eq!(table.lookup(&Method::GET, "/apiary"), RouteMatch::NotFound);
        assert_eq!(table.lookup(&Method::GET, "/"), RouteMatch::NotFound);
    }

    #[test]
    fn identical_prefix_for_two_services_conflicts() {
        let err = RouteTable::build(
            &[
                routes("main", vec![entry("main", "/")]),
                routes("api", vec![entry("api", "/")]),
            ],
            1,
        )
        .unwrap_err();
        assert_eq!(err.prefix, "/");
        assert_eq!(err.first.as_str(), "main");
        assert_eq!(err.second.as_str(), "api");
    }

    #[test]
    fn method_filters_and_405() {
        let mut get_only = entry("api", "/api");
        get_only.methods = vec!["GET".into()];
        let table = RouteTable::build(&[routes("api", vec![get_only])], 1).unwrap();

        assert!(matches!(table.lookup(&Method::GET, "/api/x"), RouteMatch::Found { .. }));
        assert_eq!(table.lookup(&Method::POST, "/api/x"), RouteMatch::MethodNotAllowed);
    }

    #[test]
    fn fallback_only_when_nothing_else_matches() {
        let mut fallback = entry("spa", "/");
        fallback.is_fallback = true;
        let table = RouteTable::build(
            &[
                routes("spa", vec![fallback]),
                routes("api", vec![entry("api", "/api")]),
            ],
            1,
        )
        .unwrap();

        assert_eq!(found(&table, &Method::GET, "/api/v1").0, "api");
        assert_eq!(found(&table, &Method::GET, "/dashboard").0, "spa");
        assert!(table.entries().last().unwrap().is_fallback);
    }

    #[test]
    fn equal_length_prefixes_keep_declaration_order() {
        let table = RouteTable::build(
            &[
                routes("b", vec![entry("b", "/bbb")]),
                routes("a", vec![entry("a", "/aaa")]),
            ],
            3,
        )
        .unwrap();
        let order: Vec<&str> = table.entries().iter().map(|e| e.service_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(table.generation(), 3);
        assert!(table.endpoint(&"a".into()).is_some());
    }

    #[test]
    fn route_paths_below_mount_strip_only_the_mount() {
        let mut users = entry("api", "/api/users");
        users.strip_prefix = "/api".into();
        let table = RouteTable::build(&[routes("api", vec![users])], 1).unwrap();
        assert_eq!(
            found(&table, &Method::GET, "/api/users/7"),
            ("api".into(), "/users/7".into())
        );
        assert_eq!(table.lookup(&Method::GET, "/api/orders"), RouteMatch::NotFound);
    }

    #[test]
    fn join_prefix_cases() {
        assert_eq!(join_prefix("/", "/"), "/");
        assert_eq!(join_prefix("/", "/users"), "/users");
        assert_eq!(join_prefix("/api", "/"), "/api");
        assert_eq!(join_prefix("/api", "users/"), "/api/users");
    }
}
