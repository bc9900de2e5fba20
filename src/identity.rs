use serde::{Deserialize, Serialize};
use std::fmt;

/// The 4-tuple join key shared by storage, cache, alarms, hidden-items and
/// property rows. `device` is empty for node-level metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub group: String,
    pub node: String,
    #[serde(default)]
    pub device: String,
    pub metric: String,
}

impl Identity {
    pub fn new(
        group: impl Into<String>,
        node: impl Into<String>,
        device: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            node: node.into(),
            device: device.into(),
            metric: metric.into(),
        }
    }

    /// Pipe-joined cache key, matching the rule-cache and hot-cache key shape.
    pub fn cache_key(&self) -> String {
        format!("{}|{}|{}|{}", self.group, self.node, self.device, self.metric)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.node, self.device, self.metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_pipe_joined_and_stable() {
        let id = Identity::new("G1", "N1", "", "Temp");
        assert_eq!(id.cache_key(), "G1|N1||Temp");
    }

    #[test]
    fn display_uses_slash_path() {
        let id = Identity::new("G1", "N1", "D1", "Temp");
        assert_eq!(id.to_string(), "G1/N1/D1/Temp");
    }
}
