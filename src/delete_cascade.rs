//! Delete cascade (C8): coordinated deletion across topology, hot cache,
//! history tables, hidden-items and properties, in the fixed order the
//! spec requires. An error partway through is surfaced to the caller;
//! earlier side effects are not rolled back — a stale cache entry is
//! harmless since the next BIRTH repopulates it.

use std::sync::Arc;

use crate::error::MantleResult;
use crate::hot_cache::HotCache;
use crate::identity::Identity;
use crate::storage::Storage;
use crate::topology::Topology;

pub struct DeleteCascade {
    pub topology: Arc<Topology>,
    pub storage: Arc<Storage>,
    pub hot_cache: Option<Arc<HotCache>>,
}

impl DeleteCascade {
    pub async fn delete_node(&self, group: &str, node: &str) -> MantleResult<()> {
        self.topology.delete_node(group, node);
        if let Some(cache) = &self.hot_cache {
            cache.delete_matching_identity(&Identity::new(group, node, "", "")).await;
        }
        self.storage.delete_by_node(group, node).await
    }

    pub async fn delete_device(&self, group: &str, node: &str, device: &str) -> MantleResult<()> {
        self.topology.delete_device(group, node, device);
        if let Some(cache) = &self.hot_cache {
            cache.delete_matching_identity(&Identity::new(group, node, device, "")).await;
        }
        self.storage.delete_by_device(group, node, device).await
    }

    pub async fn delete_metric(&self, identity: &Identity) -> MantleResult<()> {
        self.topology
            .delete_metric(&identity.group, &identity.node, &identity.device, &identity.metric);
        if let Some(cache) = &self.hot_cache {
            cache.delete_matching_identity(identity).await;
        }
        self.storage.delete_by_metric(identity).await
    }
}
