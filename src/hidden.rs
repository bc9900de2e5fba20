//! Hidden-item filter (C7): declarative hiding at node/device/metric
//! granularity with cascading application over a topology snapshot.

use std::collections::HashSet;

use sqlx::PgPool;

use crate::error::MantleResult;
use crate::topology::Host;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HiddenItem {
    pub group: String,
    pub node: String,
    pub device: String,
    pub metric: String,
}

impl HiddenItem {
    fn key(&self) -> String {
        if self.metric.is_empty() && self.device.is_empty() {
            format!("node:{}/{}", self.group, self.node)
        } else if self.metric.is_empty() {
            format!("device:{}/{}/{}", self.group, self.node, self.device)
        } else {
            format!("{}/{}/{}/{}", self.group, self.node, self.device, self.metric)
        }
    }
}

/// Precomputed hidden-key set built from the `hidden_items` table. Building
/// this once per query (rather than scanning the table per node) keeps
/// filtering O(1) per topology entry.
#[derive(Debug, Clone, Default)]
pub struct HiddenFilter {
    keys: HashSet<String>,
}

impl HiddenFilter {
    pub fn build(items: &[HiddenItem]) -> Self {
        Self {
            keys: items.iter().map(HiddenItem::key).collect(),
        }
    }

    fn node_hidden(&self, group: &str, node: &str) -> bool {
        self.keys.contains(&format!("node:{group}/{node}"))
    }

    fn device_hidden(&self, group: &str, node: &str, device: &str) -> bool {
        self.keys.contains(&format!("device:{group}/{node}/{device}"))
    }

    fn metric_hidden(&self, group: &str, node: &str, device: &str, metric: &str) -> bool {
        self.keys.contains(&format!("{group}/{node}/{device}/{metric}"))
    }

    /// Applies the filter to a topology snapshot, pruning hidden nodes,
    /// devices and metrics, and dropping groups left with no nodes.
    /// `include_hidden=true` returns the snapshot untouched.
    pub fn apply(&self, host: &Host, include_hidden: bool) -> Host {
        if include_hidden {
            return host.clone();
        }
        let mut out = Host::default();
        for (gname, group) in &host.groups {
            let mut kept_nodes = std::collections::HashMap::new();
            for (nname, node) in &group.nodes {
                if self.node_hidden(gname, nname) {
                    continue;
                }
                let mut kept = node.clone();
                kept.metrics.retain(|mname, _| {
                    !self.metric_hidden(gname, nname, "", mname)
                });
                kept.devices.retain(|dname, _| !self.device_hidden(gname, nname, dname));
                for (dname, device) in kept.devices.iter_mut() {
                    device
                        .metrics
                        .retain(|mname, _| !self.metric_hidden(gname, nname, dname, mname));
                }
                kept_nodes.insert(nname.clone(), kept);
            }
            if !kept_nodes.is_empty() {
                out.groups.insert(
                    gname.clone(),
                    crate::topology::TopologyGroup { nodes: kept_nodes },
                );
            }
        }
        out
    }
}

/// Persistent hidden-item table, backing [`HiddenFilter::build`].
pub struct HiddenStore {
    pool: PgPool,
}

impl HiddenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> MantleResult<Vec<HiddenItem>> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT group_id, node_id, device_id, metric_id FROM hidden_items",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(group, node, device, metric)| HiddenItem { group, node, device, metric })
            .collect())
    }

    pub async fn hide(&self, item: &HiddenItem) -> MantleResult<()> {
        sqlx::query(
            "INSERT INTO hidden_items (group_id, node_id, device_id, metric_id, hidden_at)
             VALUES ($1,$2,$3,$4, now())
             ON CONFLICT (group_id, node_id, device_id, metric_id) DO NOTHING",
        )
        .bind(&item.group)
        .bind(&item.node)
        .bind(&item.device)
        .bind(&item.metric)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unhide(&self, item: &HiddenItem) -> MantleResult<()> {
        sqlx::query(
            "DELETE FROM hidden_items WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&item.group)
        .bind(&item.node)
        .bind(&item.device)
        .bind(&item.metric)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{TopologyDevice, TopologyGroup, TopologyNode};
    use std::collections::HashMap;

    fn host_with_node_and_device() -> Host {
        let mut node = TopologyNode::default();
        node.devices.insert("D1".into(), TopologyDevice::default());
        let mut nodes = HashMap::new();
        nodes.insert("N1".into(), node);
        let mut groups = HashMap::new();
        groups.insert("G1".into(), TopologyGroup { nodes });
        Host { groups }
    }

    #[test]
    fn hiding_node_removes_it_and_prunes_empty_group() {
        let host = host_with_node_and_device();
        let filter = HiddenFilter::build(&[HiddenItem {
            group: "G1".into(),
            node: "N1".into(),
            device: "".into(),
            metric: "".into(),
        }]);
        let filtered = filter.apply(&host, false);
        assert!(!filtered.groups.contains_key("G1"));
    }

    #[test]
    fn include_hidden_bypasses_filter() {
        let host = host_with_node_and_device();
        let filter = HiddenFilter::build(&[HiddenItem {
            group: "G1".into(),
            node: "N1".into(),
            device: "".into(),
            metric: "".into(),
        }]);
        let filtered = filter.apply(&host, true);
        assert!(filtered.groups.contains_key("G1"));
    }

    #[test]
    fn hiding_device_leaves_node_visible() {
        let host = host_with_node_and_device();
        let filter = HiddenFilter::build(&[HiddenItem {
            group: "G1".into(),
            node: "N1".into(),
            device: "D1".into(),
            metric: "".into(),
        }]);
        let filtered = filter.apply(&host, false);
        assert!(filtered.groups["G1"].nodes.contains_key("N1"));
        assert!(!filtered.groups["G1"].nodes["N1"].devices.contains_key("D1"));
    }
}
