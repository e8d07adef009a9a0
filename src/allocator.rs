//! Per-Service allocation transaction with rollback
//!
//! A Service's ports are allocated all-or-nothing: any failure after a
//! partial allocation releases every port granted so far, in reverse order,
//! before the error is surfaced. Release on deletion is deliberately
//! forgiving, bookkeeping problems must never block a deletion.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::manager::Manager;
use crate::policy;
use crate::{Error, Result, DEFAULT_NAMESPACE};

/// Outcome of allocating one port entry of a Service
///
/// Doubles as the rollback journal during the transaction and as the source
/// of admission warnings afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationResult {
    /// Position within the Service's port list
    pub port_index: usize,
    /// The port entry's name, if set
    pub port_name: String,
    /// The NodePort granted (or confirmed) for this entry
    pub allocated_port: i32,
    /// Range the port was taken from
    pub range_name: String,
    /// Human-readable summary, surfaced as an admission warning
    pub message: String,
    /// Whether a bit in the range bitmap backs this result
    ///
    /// Outside-range ports admitted under the gate are journaled for
    /// warnings but hold no bit, so rollback skips them.
    #[serde(skip)]
    tracked: bool,
}

/// Port allocation engine bound to a [`Manager`]
pub struct Allocator {
    manager: Arc<Manager>,
}

impl Allocator {
    /// Create an allocator over the manager's ranges
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Allocate or validate every port of `svc`, all-or-nothing
    ///
    /// Entries are processed in declared order; the first failure rolls back
    /// all earlier grants and is returned unchanged.
    pub async fn allocate_for_service(&self, svc: &Service) -> Result<Vec<AllocationResult>> {
        let namespace = service_namespace(svc);
        let labels = service_labels(svc);
        let config = self.manager.config();

        let (range_name, range_config) = policy::resolve(config, namespace, &labels)?;
        let range = self
            .manager
            .range(range_name)
            .ok_or_else(|| Error::config(format!("port range {} is not managed", range_name)))?;

        let mut results: Vec<AllocationResult> = Vec::new();

        for (index, port) in ports(svc).iter().enumerate() {
            let port_name = port.name.clone().unwrap_or_default();
            let requested = port.node_port.unwrap_or(0);

            if requested == 0 {
                let allocated = match range.allocate(0).await {
                    Ok(p) => p,
                    Err(e) => {
                        self.rollback(&results).await;
                        return Err(e);
                    }
                };
                results.push(AllocationResult {
                    port_index: index,
                    port_name,
                    allocated_port: allocated,
                    range_name: range_name.to_string(),
                    message: format!("auto-allocated NodePort {} (range {})", allocated, range_name),
                    tracked: true,
                });
                continue;
            }

            if !range_config.contains(requested) {
                if !config.allow_outside_range_ports {
                    self.rollback(&results).await;
                    return Err(Error::OutOfRange {
                        port: requested,
                        start: range_config.start,
                        end: range_config.end,
                    });
                }

                // Admitted but untracked: the bitmap only covers the range
                // interval, so this port is invisible to future occupancy
                // checks.
                warn!(
                    service = %service_key(svc),
                    port = requested,
                    range = range_name,
                    "admitting NodePort outside the matched range, port is not tracked"
                );
                results.push(AllocationResult {
                    port_index: index,
                    port_name,
                    allocated_port: requested,
                    range_name: range_name.to_string(),
                    message: format!(
                        "NodePort {} is outside range {} [{}, {}] and is not tracked",
                        requested, range_name, range_config.start, range_config.end
                    ),
                    tracked: false,
                });
                continue;
            }

            if range.is_used(requested).await {
                self.rollback(&results).await;
                return Err(Error::PortInUse(requested));
            }

            if let Err(e) = range.allocate(requested).await {
                self.rollback(&results).await;
                return Err(e);
            }
            results.push(AllocationResult {
                port_index: index,
                port_name,
                allocated_port: requested,
                range_name: range_name.to_string(),
                message: format!(
                    "using requested NodePort {} (range {})",
                    requested, range_name
                ),
                tracked: true,
            });
        }

        info!(
            service = %service_key(svc),
            range = range_name,
            allocated = results.len(),
            "ports allocated"
        );
        Ok(results)
    }

    /// Release every NodePort of a deleted Service
    ///
    /// Errors are logged and folded into a non-fatal aggregate so deletion
    /// is never blocked by bookkeeping.
    pub async fn release_for_service(&self, svc: &Service) -> Result<()> {
        let namespace = service_namespace(svc);
        let labels = service_labels(svc);

        let (range_name, _) = match policy::resolve(self.manager.config(), namespace, &labels) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(service = %service_key(svc), error = %e, "cannot resolve range for release");
                return Ok(());
            }
        };
        let range = match self.manager.range(range_name) {
            Some(range) => range,
            None => {
                error!(service = %service_key(svc), range = range_name, "range not managed");
                return Ok(());
            }
        };

        let mut failed = 0usize;
        for port in ports(svc) {
            let node_port = port.node_port.unwrap_or(0);
            if node_port == 0 {
                continue;
            }
            if let Err(e) = range.release(node_port).await {
                // Out-of-range here just means the port was never tracked
                if matches!(e, Error::OutOfRange { .. }) {
                    continue;
                }
                error!(
                    service = %service_key(svc),
                    port = node_port,
                    error = %e,
                    "failed to release port"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(Error::ReleaseIncomplete(failed));
        }

        info!(service = %service_key(svc), range = range_name, "ports released");
        Ok(())
    }

    /// Fold a pre-existing Service's ports into the bitmap at startup
    ///
    /// Idempotent. Problems are logged, never propagated: the scan must not
    /// abort because one Service is in a bad state.
    pub async fn mark_for_existing_service(&self, svc: &Service) {
        let namespace = service_namespace(svc);
        let labels = service_labels(svc);
        let config = self.manager.config();

        let (range_name, range_config) = match policy::resolve(config, namespace, &labels) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(service = %service_key(svc), error = %e, "cannot resolve range for scan");
                return;
            }
        };
        let range = match self.manager.range(range_name) {
            Some(range) => range,
            None => {
                error!(service = %service_key(svc), range = range_name, "range not managed");
                return;
            }
        };

        for port in ports(svc) {
            let node_port = port.node_port.unwrap_or(0);
            if node_port == 0 {
                continue;
            }

            if !range_config.contains(node_port) {
                if !config.allow_outside_range_ports {
                    warn!(
                        service = %service_key(svc),
                        port = node_port,
                        range = range_name,
                        "existing NodePort outside the matched range, skipping"
                    );
                    continue;
                }
                // The bitmap rejects out-of-domain writes, so an allowed
                // outside-range port stays untracked either way.
                warn!(
                    service = %service_key(svc),
                    port = node_port,
                    range = range_name,
                    "existing NodePort outside the matched range is admitted but not tracked"
                );
                continue;
            }

            if let Err(e) = range.mark_used(node_port).await {
                error!(
                    service = %service_key(svc),
                    port = node_port,
                    error = %e,
                    "failed to mark port as used"
                );
            }
        }
    }

    /// Undo a partial transaction, newest grant first
    async fn rollback(&self, results: &[AllocationResult]) {
        for result in results.iter().rev() {
            if !result.tracked {
                continue;
            }
            let range = match self.manager.range(&result.range_name) {
                Some(range) => range,
                None => continue,
            };
            if let Err(e) = range.release(result.allocated_port).await {
                error!(
                    port = result.allocated_port,
                    range = %result.range_name,
                    error = %e,
                    "failed to roll back allocation"
                );
            }
        }
    }
}

/// Namespace the Service lives in, empty normalized to `"default"`
pub fn service_namespace(svc: &Service) -> &str {
    match svc.metadata.namespace.as_deref() {
        Some("") | None => DEFAULT_NAMESPACE,
        Some(ns) => ns,
    }
}

/// The Service's labels, or an empty map
pub fn service_labels(svc: &Service) -> BTreeMap<String, String> {
    svc.metadata.labels.clone().unwrap_or_default()
}

/// Whether the Service is of type NodePort
pub fn is_node_port(svc: &Service) -> bool {
    svc.spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == "NodePort")
}

/// `namespace/name` for logging
pub fn service_key(svc: &Service) -> String {
    format!(
        "{}/{}",
        service_namespace(svc),
        svc.metadata.name.as_deref().unwrap_or("unknown")
    )
}

fn ports(svc: &Service) -> &[k8s_openapi::api::core::v1::ServicePort] {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfig;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const CONFIG: &str = r#"
portRanges:
  dev:
    start: 31500
    end: 31999
    namespaces: ["dev"]
defaultRange: dev
"#;

    fn service(namespace: &str, name: &str, node_ports: &[i32]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("NodePort".to_string()),
                ports: Some(
                    node_ports
                        .iter()
                        .enumerate()
                        .map(|(i, p)| ServicePort {
                            name: Some(format!("port-{}", i)),
                            node_port: (*p != 0).then_some(*p),
                            port: 80,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn setup(yaml: &str) -> (Arc<Manager>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(Manager::new(
            GlobalConfig::from_yaml(yaml).unwrap(),
            store.clone(),
        ));
        manager.initialize().await.unwrap();
        (manager, store)
    }

    #[tokio::test]
    async fn test_auto_allocation_starts_at_range_floor() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        let results = allocator
            .allocate_for_service(&service("dev", "s1", &[0]))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].allocated_port, 31500);
        assert_eq!(results[0].port_index, 0);
        assert_eq!(results[0].range_name, "dev");
        assert!(results[0].message.contains("31500"));
        assert!(results[0].message.contains("dev"));
    }

    #[tokio::test]
    async fn test_requested_port_conflict_is_denied() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        allocator
            .allocate_for_service(&service("dev", "s1", &[0]))
            .await
            .unwrap();

        let err = allocator
            .allocate_for_service(&service("dev", "s2", &[31500]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortInUse(31500)));
    }

    #[tokio::test]
    async fn test_outside_range_denied_by_default() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        let err = allocator
            .allocate_for_service(&service("dev", "s1", &[32000]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutOfRange { port: 32000, .. }));
    }

    #[tokio::test]
    async fn test_outside_range_admitted_untracked_when_allowed() {
        let yaml = format!("{}allowOutsideRangePorts: true\n", CONFIG);
        let (manager, _) = setup(&yaml).await;
        let allocator = manager.allocator();

        let results = allocator
            .allocate_for_service(&service("dev", "s1", &[32000]))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].message.contains("outside"));
        // the port holds no bit: a second Service may claim it again
        assert!(!manager.range("dev").unwrap().is_used(32000).await);
        assert!(allocator
            .allocate_for_service(&service("dev", "s2", &[32000]))
            .await
            .is_ok());
    }

    /// Atomic transaction: a failure after partial allocation restores the
    /// pre-state, the port that would have been granted for an earlier
    /// entry is not held.
    #[tokio::test]
    async fn test_failed_transaction_rolls_back_partial_grants() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        allocator
            .allocate_for_service(&service("dev", "s1", &[31600]))
            .await
            .unwrap();

        // first entry would auto-allocate 31500, second collides with 31600
        let err = allocator
            .allocate_for_service(&service("dev", "s2", &[0, 31600, 0]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortInUse(31600)));

        let range = manager.range("dev").unwrap();
        assert!(!range.is_used(31500).await);
        assert_eq!(range.stats().await.used, 1);
    }

    #[tokio::test]
    async fn test_persist_failure_rolls_back_earlier_grants() {
        let (manager, store) = setup(CONFIG).await;
        let allocator = manager.allocator();

        // first entry's save succeeds, second entry's save fails; the
        // rollback release of the first entry is allowed to persist
        store.fail_saves_after(1, 1);
        let err = allocator
            .allocate_for_service(&service("dev", "s1", &[0, 0]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let range = manager.range("dev").unwrap();
        assert!(!range.is_used(31500).await);
        assert!(!range.is_used(31501).await);
        assert_eq!(range.stats().await.used, 0);
    }

    #[tokio::test]
    async fn test_range_exhaustion_sequence() {
        let yaml = r#"
portRanges:
  tiny:
    start: 31500
    end: 31501
    namespaces: ["dev"]
defaultRange: tiny
"#;
        let (manager, _) = setup(yaml).await;
        let allocator = manager.allocator();

        let first = allocator
            .allocate_for_service(&service("dev", "s1", &[0]))
            .await
            .unwrap();
        assert_eq!(first[0].allocated_port, 31500);

        let second = allocator
            .allocate_for_service(&service("dev", "s2", &[0]))
            .await
            .unwrap();
        assert_eq!(second[0].allocated_port, 31501);

        let err = allocator
            .allocate_for_service(&service("dev", "s3", &[0]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RangeFull(_)));
    }

    #[tokio::test]
    async fn test_release_frees_all_ports() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        allocator
            .allocate_for_service(&service("dev", "s1", &[31600, 31601]))
            .await
            .unwrap();

        allocator
            .release_for_service(&service("dev", "s1", &[31600, 31601]))
            .await
            .unwrap();

        let range = manager.range("dev").unwrap();
        assert!(!range.is_used(31600).await);
        assert!(!range.is_used(31601).await);
    }

    #[tokio::test]
    async fn test_release_never_blocks_on_errors() {
        let (manager, store) = setup(CONFIG).await;
        let allocator = manager.allocator();

        allocator
            .allocate_for_service(&service("dev", "s1", &[31600]))
            .await
            .unwrap();

        store.fail_next_saves(1);
        let err = allocator
            .release_for_service(&service("dev", "s1", &[31600]))
            .await
            .unwrap_err();
        // aggregate error is observability only
        assert!(matches!(err, Error::ReleaseIncomplete(1)));
    }

    #[tokio::test]
    async fn test_release_of_untracked_port_is_silent() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        // 32000 was never tracked (outside range); release must not fail
        allocator
            .release_for_service(&service("dev", "s1", &[32000]))
            .await
            .unwrap();
        assert_eq!(manager.range("dev").unwrap().stats().await.used, 0);
    }

    #[tokio::test]
    async fn test_mark_for_existing_service_skips_outside_ports() {
        let (manager, _) = setup(CONFIG).await;
        let allocator = manager.allocator();

        allocator
            .mark_for_existing_service(&service("dev", "s1", &[31700, 32100]))
            .await;

        let range = manager.range("dev").unwrap();
        assert!(range.is_used(31700).await);
        assert!(!range.is_used(32100).await);
    }

    #[tokio::test]
    async fn test_empty_namespace_uses_default_namespace() {
        let yaml = r#"
portRanges:
  base:
    start: 31500
    end: 31999
    namespaces: ["default"]
defaultRange: base
"#;
        let (manager, _) = setup(yaml).await;
        let allocator = manager.allocator();

        let mut svc = service("", "s1", &[0]);
        svc.metadata.namespace = None;
        let results = allocator.allocate_for_service(&svc).await.unwrap();
        assert_eq!(results[0].range_name, "base");
    }

    #[test]
    fn test_service_helpers() {
        let svc = service("dev", "web", &[31500]);
        assert_eq!(service_namespace(&svc), "dev");
        assert_eq!(service_key(&svc), "dev/web");
        assert!(is_node_port(&svc));

        let mut cluster_ip = service("dev", "web", &[]);
        cluster_ip.spec.as_mut().unwrap().type_ = Some("ClusterIP".to_string());
        assert!(!is_node_port(&cluster_ip));
    }
}
