//! In-memory Sparkplug topology model (C2): Host -> Group -> Node ->
//! {metrics, Device -> metrics}, with per-metric properties and template
//! definitions. Owned exclusively by the ingress task; readers take a
//! cloned snapshot so no partial update is ever observed mid-mutation.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::value::MetricValue;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyMetric {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: MetricValue,
    pub timestamp: i64,
    pub scan_rate: Option<i64>,
    pub properties: HashMap<String, serde_json::Value>,
    pub template_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyDevice {
    pub metrics: HashMap<String, TopologyMetric>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyNode {
    pub metrics: HashMap<String, TopologyMetric>,
    pub devices: HashMap<String, TopologyDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologyGroup {
    pub nodes: HashMap<String, TopologyNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Host {
    pub groups: HashMap<String, TopologyGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDef {
    pub name: String,
    pub version: Option<String>,
    pub members: Vec<TemplateMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMember {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Single-writer-plus-snapshot topology store. The ingress task is the only
/// writer; every other consumer calls `snapshot()` and works off an owned
/// clone so no reader ever observes a node half-updated.
pub struct Topology {
    inner: RwLock<Host>,
    templates: RwLock<HashMap<String, TemplateDef>>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Host::default()),
            templates: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot(&self) -> Host {
        self.inner.read().expect("topology lock poisoned").clone()
    }

    pub fn template_definitions(&self) -> Vec<TemplateDef> {
        self.templates
            .read()
            .expect("template lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn register_template(&self, def: TemplateDef) {
        self.templates
            .write()
            .expect("template lock poisoned")
            .insert(def.name.clone(), def);
    }

    /// Create or update a node-level metric.
    pub fn upsert_node_metric(&self, group: &str, node: &str, metric: TopologyMetric) {
        let mut host = self.inner.write().expect("topology lock poisoned");
        let g = host.groups.entry(group.to_string()).or_default();
        let n = g.nodes.entry(node.to_string()).or_default();
        n.metrics.insert(metric.name.clone(), metric);
    }

    /// Create or update a device-level metric, creating the device entry
    /// on first sight (implicit from the first DBIRTH/DDATA for it).
    pub fn upsert_device_metric(
        &self,
        group: &str,
        node: &str,
        device: &str,
        metric: TopologyMetric,
    ) {
        let mut host = self.inner.write().expect("topology lock poisoned");
        let g = host.groups.entry(group.to_string()).or_default();
        let n = g.nodes.entry(node.to_string()).or_default();
        let d = n.devices.entry(device.to_string()).or_default();
        d.metrics.insert(metric.name.clone(), metric);
    }

    pub fn delete_node(&self, group: &str, node: &str) {
        let mut host = self.inner.write().expect("topology lock poisoned");
        if let Some(g) = host.groups.get_mut(group) {
            g.nodes.remove(node);
            if g.nodes.is_empty() {
                host.groups.remove(group);
            }
        }
    }

    pub fn delete_device(&self, group: &str, node: &str, device: &str) {
        let mut host = self.inner.write().expect("topology lock poisoned");
        if let Some(g) = host.groups.get_mut(group)
            && let Some(n) = g.nodes.get_mut(node)
        {
            n.devices.remove(device);
        }
    }

    pub fn delete_metric(&self, group: &str, node: &str, device: &str, metric: &str) {
        let mut host = self.inner.write().expect("topology lock poisoned");
        if let Some(g) = host.groups.get_mut(group)
            && let Some(n) = g.nodes.get_mut(node)
        {
            if device.is_empty() {
                n.metrics.remove(metric);
            } else if let Some(d) = n.devices.get_mut(device) {
                d.metrics.remove(metric);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, v: i64) -> TopologyMetric {
        TopologyMetric {
            name: name.to_string(),
            type_name: "Int32".to_string(),
            value: MetricValue::Int(v),
            timestamp: 0,
            scan_rate: None,
            properties: HashMap::new(),
            template_ref: None,
        }
    }

    #[test]
    fn upsert_creates_intermediate_nodes() {
        let t = Topology::new();
        t.upsert_node_metric("G1", "N1", metric("Temp", 72));
        let snap = t.snapshot();
        assert_eq!(
            snap.groups["G1"].nodes["N1"].metrics["Temp"].value,
            MetricValue::Int(72)
        );
    }

    #[test]
    fn device_metric_creates_device_entry() {
        let t = Topology::new();
        t.upsert_device_metric("G1", "N1", "D1", metric("Speed", 5));
        let snap = t.snapshot();
        assert!(snap.groups["G1"].nodes["N1"].devices.contains_key("D1"));
    }

    #[test]
    fn delete_node_prunes_empty_group() {
        let t = Topology::new();
        t.upsert_node_metric("G1", "N1", metric("Temp", 72));
        t.delete_node("G1", "N1");
        let snap = t.snapshot();
        assert!(!snap.groups.contains_key("G1"));
    }

    #[test]
    fn delete_device_leaves_node_in_place() {
        let t = Topology::new();
        t.upsert_device_metric("G1", "N1", "D1", metric("Speed", 5));
        t.delete_device("G1", "N1", "D1");
        let snap = t.snapshot();
        assert!(snap.groups["G1"].nodes.contains_key("N1"));
        assert!(!snap.groups["G1"].nodes["N1"].devices.contains_key("D1"));
    }
}
