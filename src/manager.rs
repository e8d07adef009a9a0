//! Range map construction, startup scan, and per-port validation
//!
//! The manager owns one [`PortRange`] per configured range. The map is built
//! once at startup and never mutated afterwards, so lookups need no lock
//! beyond the `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::{Api, Client};
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::allocator::Allocator;
use crate::config::GlobalConfig;
use crate::policy;
use crate::range::{PortRange, RangeStats};
use crate::store::RangeStore;
use crate::{Error, Result};

/// Source of the cluster's live Service set, abstracted for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceLister: Send + Sync {
    /// List every Service in the cluster
    async fn list_all(&self) -> Result<Vec<Service>>;
}

/// Lister backed by the Kubernetes API
pub struct KubeServiceLister {
    client: Client,
}

impl KubeServiceLister {
    /// Create a lister using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceLister for KubeServiceLister {
    async fn list_all(&self) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}

/// Owner of the per-range allocation state
pub struct Manager {
    config: Arc<GlobalConfig>,
    ranges: BTreeMap<String, Arc<PortRange>>,
}

impl Manager {
    /// Build one [`PortRange`] per configured range, all sharing `store`
    pub fn new(config: GlobalConfig, store: Arc<dyn RangeStore>) -> Self {
        let ranges = config
            .port_ranges
            .iter()
            .map(|(name, range_config)| {
                (
                    name.clone(),
                    Arc::new(PortRange::new(
                        name.as_str(),
                        range_config.clone(),
                        store.clone(),
                    )),
                )
            })
            .collect();

        Self {
            config: Arc::new(config),
            ranges,
        }
    }

    /// Load every range's bitmap from storage; fatal on failure
    pub async fn initialize(&self) -> Result<()> {
        for range in self.ranges.values() {
            range.initialize().await?;
        }
        info!(ranges = self.ranges.len(), "port manager initialized");
        Ok(())
    }

    /// The loaded configuration
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Look up a range by name
    pub fn range(&self, name: &str) -> Option<Arc<PortRange>> {
        self.ranges.get(name).cloned()
    }

    /// The allocator bound to this manager
    pub fn allocator(self: &Arc<Self>) -> Allocator {
        Allocator::new(self.clone())
    }

    /// Usage snapshot of every range, in name order
    pub async fn stats(&self) -> Vec<RangeStats> {
        let mut stats = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.values() {
            stats.push(range.stats().await);
        }
        stats
    }

    /// Validate an explicitly requested port for the update path
    ///
    /// Checks the range bounds and the outside-range gate without touching
    /// the bitmap: updates with all ports already set only need to be
    /// plausible, occupancy was arbitrated when the ports were allocated.
    pub fn validate_port_for_service(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        port: i32,
    ) -> Result<()> {
        let (_, range_config) = policy::resolve(&self.config, namespace, labels)?;

        if !range_config.contains(port) && !self.config.allow_outside_range_ports {
            return Err(Error::OutOfRange {
                port,
                start: range_config.start,
                end: range_config.end,
            });
        }

        Ok(())
    }

    /// Reconstruct bitmap state from the live Service set
    ///
    /// Runs once at startup, before admission opens. A listing failure is
    /// fatal; per-Service marking problems are logged by the allocator and
    /// do not abort the scan (the operation is idempotent and a later scan
    /// can repair).
    pub async fn scan_existing_services(
        self: &Arc<Self>,
        lister: &dyn ServiceLister,
    ) -> Result<()> {
        info!("scanning existing NodePort services");
        let services = lister.list_all().await?;
        info!(count = services.len(), "listed services");

        let allocator = self.allocator();
        let mut marked = 0usize;
        for service in &services {
            if !crate::allocator::is_node_port(service) {
                continue;
            }
            allocator.mark_for_existing_service(service).await;
            marked += 1;
        }

        info!(services = marked, "startup scan complete");
        Ok(())
    }
}
