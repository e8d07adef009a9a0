//! One port range: bitmap plus write-through persistence
//!
//! Every mutation holds the range's write lock across the storage round-trip
//! and rolls the in-memory bit back when the save fails, so the bitmap and
//! the persisted blob agree whenever a public call returns success.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::bitset::BitSet;
use crate::config::PortRangeConfig;
use crate::store::RangeStore;
use crate::{Error, Result};

/// A named, persisted port range
pub struct PortRange {
    name: String,
    config: PortRangeConfig,
    store: Arc<dyn RangeStore>,
    bits: RwLock<Option<BitSet>>,
}

/// Point-in-time usage snapshot of a range
#[derive(Debug, Clone, Serialize)]
pub struct RangeStats {
    /// Range name
    pub name: String,
    /// First port, inclusive
    pub start: i32,
    /// Last port, inclusive
    pub end: i32,
    /// Number of ports the range covers
    pub total: i32,
    /// Currently allocated ports
    pub used: i32,
    /// Free ports
    pub available: i32,
    /// Used share in percent
    pub usage_rate: f64,
    /// Operator-facing description from configuration
    pub description: String,
}

impl PortRange {
    /// Create a range backed by `store`; call [`PortRange::initialize`]
    /// before any other operation
    pub fn new(name: impl Into<String>, config: PortRangeConfig, store: Arc<dyn RangeStore>) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            bits: RwLock::new(None),
        }
    }

    /// Range name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Range configuration
    pub fn config(&self) -> &PortRangeConfig {
        &self.config
    }

    /// Load the bitmap from storage, or start empty when nothing is stored
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.bits.write().await;
        let loaded = self
            .store
            .load(&self.name, self.config.start, self.config.end)
            .await?;

        info!(
            range = %self.name,
            start = self.config.start,
            end = self.config.end,
            used = loaded.count(),
            total = self.config.capacity(),
            "port range initialized"
        );

        *guard = Some(loaded);
        Ok(())
    }

    /// Allocate a port: `0` picks the smallest free port, a concrete value
    /// claims exactly that port
    ///
    /// The new bit is persisted before the call returns; a failed save is
    /// rolled back in memory and surfaced.
    pub async fn allocate(&self, requested: i32) -> Result<i32> {
        let mut guard = self.bits.write().await;
        let bits = guard
            .as_mut()
            .ok_or_else(|| Error::Uninitialized(self.name.clone()))?;

        let port = if requested != 0 {
            if !self.config.contains(requested) {
                return Err(Error::OutOfRange {
                    port: requested,
                    start: self.config.start,
                    end: self.config.end,
                });
            }
            if bits.test(requested) {
                return Err(Error::PortInUse(requested));
            }
            requested
        } else {
            bits.first_clear()
                .ok_or_else(|| Error::RangeFull(self.name.clone()))?
        };

        bits.set(port)?;
        if let Err(e) = self.store.save(&self.name, bits).await {
            bits.clear(port)?;
            return Err(e);
        }

        debug!(range = %self.name, port, "port allocated");
        Ok(port)
    }

    /// Return a port to the range; releasing a free port is a no-op
    pub async fn release(&self, port: i32) -> Result<()> {
        let mut guard = self.bits.write().await;
        let bits = guard
            .as_mut()
            .ok_or_else(|| Error::Uninitialized(self.name.clone()))?;

        if !self.config.contains(port) {
            return Err(Error::OutOfRange {
                port,
                start: self.config.start,
                end: self.config.end,
            });
        }

        if !bits.test(port) {
            debug!(range = %self.name, port, "port already free, skipping release");
            return Ok(());
        }

        bits.clear(port)?;
        if let Err(e) = self.store.save(&self.name, bits).await {
            bits.set(port)?;
            return Err(e);
        }

        debug!(range = %self.name, port, "port released");
        Ok(())
    }

    /// Mark a port used if it is not already; idempotent
    ///
    /// Used by the startup scan to fold live Services into the bitmap.
    pub async fn mark_used(&self, port: i32) -> Result<()> {
        let mut guard = self.bits.write().await;
        let bits = guard
            .as_mut()
            .ok_or_else(|| Error::Uninitialized(self.name.clone()))?;

        if !self.config.contains(port) {
            return Err(Error::OutOfRange {
                port,
                start: self.config.start,
                end: self.config.end,
            });
        }

        if bits.test(port) {
            debug!(range = %self.name, port, "port already marked used");
            return Ok(());
        }

        bits.set(port)?;
        if let Err(e) = self.store.save(&self.name, bits).await {
            bits.clear(port)?;
            return Err(e);
        }

        debug!(range = %self.name, port, "port marked used");
        Ok(())
    }

    /// Whether `port` is currently allocated; out-of-range ports are not
    pub async fn is_used(&self, port: i32) -> bool {
        match self.bits.read().await.as_ref() {
            Some(bits) => bits.test(port),
            None => {
                warn!(range = %self.name, "is_used called before initialization");
                false
            }
        }
    }

    /// Usage snapshot
    pub async fn stats(&self) -> RangeStats {
        let used = self
            .bits
            .read()
            .await
            .as_ref()
            .map(|b| b.count() as i32)
            .unwrap_or(0);
        let total = self.config.capacity();

        RangeStats {
            name: self.name.clone(),
            start: self.config.start,
            end: self.config.end,
            total,
            used,
            available: total - used,
            usage_rate: f64::from(used) / f64::from(total) * 100.0,
            description: self.config.description.clone(),
        }
    }
}
