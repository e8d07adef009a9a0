//! Persistence for range bitmaps
//!
//! All ranges share a single authoritative ConfigMap whose `data` maps range
//! name to serialized bitmap JSON. Saves are read-modify-write under the
//! object's resourceVersion, so concurrent replicas arbitrate through 409
//! conflicts rather than locks. The allocator is the sole writer; operators
//! may read the object for diagnostics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::bitset::BitSet;
use crate::config::StorageConfig;
use crate::retry::{retry_on_conflict, RetryConfig};
#[allow(unused_imports)]
use crate::Error;
use crate::Result;

/// Annotation prefix on the backing ConfigMap
const ANNOTATION_PREFIX: &str = "nodeport-allocator.example.com";

/// Persistent key-to-bitmap mapping for port ranges
///
/// Implementations must treat a missing object or entry as an empty bitmap
/// and must keep entries for other ranges intact when saving one.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Load the bitmap for `range`, or a fresh empty one covering
    /// `[start, end]` when nothing usable is stored
    async fn load(&self, range: &str, start: i32, end: i32) -> Result<BitSet>;

    /// Persist the bitmap for `range`, replacing that entry wholesale
    async fn save(&self, range: &str, bits: &BitSet) -> Result<()>;
}

/// ConfigMap-backed store with optimistic-concurrency saves
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
    retry: RetryConfig,
}

impl ConfigMapStore {
    /// Create a store against the ConfigMap named by `config`
    pub fn new(client: Client, config: &StorageConfig) -> Result<Self> {
        let retry = RetryConfig::new(config.retry_attempts, config.retry_delay()?);
        Ok(Self {
            api: Api::namespaced(client, &config.config_map_namespace),
            name: config.config_map_name.clone(),
            retry,
        })
    }

    async fn get(&self) -> Result<Option<ConfigMap>> {
        match self.api.get(&self.name).await {
            Ok(cm) => Ok(Some(cm)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, range: &str, data: String) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "nodeport-allocator".to_string()),
                    ("component".to_string(), "storage".to_string()),
                ])),
                annotations: Some(BTreeMap::from([
                    (
                        format!("{}/description", ANNOTATION_PREFIX),
                        "NodePort allocation state".to_string(),
                    ),
                    (format!("{}/version", ANNOTATION_PREFIX), "v1".to_string()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(range.to_string(), data)])),
            ..Default::default()
        };

        self.api.create(&PostParams::default(), &cm).await?;
        info!(configmap = %self.name, "created state ConfigMap");
        Ok(())
    }

    async fn save_once(&self, range: &str, data: &str) -> Result<()> {
        let mut cm = match self.get().await? {
            Some(cm) => cm,
            None => return self.create(range, data.to_string()).await,
        };

        cm.data
            .get_or_insert_with(BTreeMap::new)
            .insert(range.to_string(), data.to_string());

        // replace carries the read resourceVersion: a concurrent writer
        // turns this into a 409 that the retry loop resolves
        self.api
            .replace(&self.name, &PostParams::default(), &cm)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RangeStore for ConfigMapStore {
    async fn load(&self, range: &str, start: i32, end: i32) -> Result<BitSet> {
        let cm = match self.get().await? {
            Some(cm) => cm,
            None => {
                debug!(range, "state ConfigMap absent, starting empty");
                return Ok(BitSet::new(start, end));
            }
        };

        let data = match cm.data.as_ref().and_then(|d| d.get(range)) {
            Some(data) => data,
            None => {
                debug!(range, "no stored bitmap for range, starting empty");
                return Ok(BitSet::new(start, end));
            }
        };

        let bits = match BitSet::from_json(data) {
            Ok(bits) => bits,
            Err(e) => {
                warn!(range, error = %e, "stored bitmap is undecodable, starting empty");
                return Ok(BitSet::new(start, end));
            }
        };

        // A resized or moved range invalidates the stored bitmap: positions
        // would no longer map to the same ports.
        let size = (end - start + 1) as usize;
        if bits.offset() != start || bits.size() != size {
            warn!(
                range,
                stored_offset = bits.offset(),
                stored_size = bits.size(),
                configured_start = start,
                configured_size = size,
                "stored bitmap does not match configured range, discarding"
            );
            return Ok(BitSet::new(start, end));
        }

        debug!(range, used = bits.count(), "loaded stored bitmap");
        Ok(bits)
    }

    async fn save(&self, range: &str, bits: &BitSet) -> Result<()> {
        let data = bits.to_json()?;
        retry_on_conflict(&self.retry, "save bitmap", || self.save_once(range, &data)).await?;
        debug!(range, used = bits.count(), "persisted bitmap");
        Ok(())
    }
}
