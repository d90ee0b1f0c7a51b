//! Node metadata resolution
//!
//! Identity packets (`NODEINFO_APP`) carry a node's display names, hardware
//! model and licence flag. The [`NodeResolver`] persists them per node id in
//! the shared [`ExpiringStore`] and resolves them again when labelling
//! metrics for later packets. Records expire (72 hours by default) unless a
//! fresh identity packet refreshes them.
//!
//! Anything that cannot be resolved comes back as [`UNKNOWN`], which is also
//! what the dispatcher uses to decide whether a source node is known.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::MetadataConfig;
use crate::error::{ExporterError, Result};
use crate::packet::User;
use crate::store::ExpiringStore;

/// Sentinel for unresolved names and attributes
pub const UNKNOWN: &str = "unknown";

/// Store key for a node's metadata record
pub fn node_key(node_id: u32) -> String {
    format!("node:{}", node_id)
}

/// Fields held in a node metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeField {
    /// Long display name
    LongName,
    /// Short display name
    ShortName,
    /// Hardware model
    HwModel,
    /// Licensed operator flag (`"true"`/`"false"`)
    IsLicensed,
}

impl NodeField {
    /// All fields, in storage order
    pub const ALL: [NodeField; 4] = [
        NodeField::LongName,
        NodeField::ShortName,
        NodeField::HwModel,
        NodeField::IsLicensed,
    ];

    /// Hash field name in the store
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeField::LongName => "long_name",
            NodeField::ShortName => "short_name",
            NodeField::HwModel => "hw_model",
            NodeField::IsLicensed => "is_licensed",
        }
    }
}

/// Persisted description of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Long display name
    pub long_name: String,
    /// Short display name
    pub short_name: String,
    /// Hardware model enum name
    pub hw_model: String,
    /// Licensed amateur radio operator
    pub is_licensed: bool,
}

impl NodeMetadata {
    /// Create a metadata record
    pub fn new(
        long_name: impl Into<String>,
        short_name: impl Into<String>,
        hw_model: impl Into<String>,
        is_licensed: bool,
    ) -> Self {
        Self {
            long_name: long_name.into(),
            short_name: short_name.into(),
            hw_model: hw_model.into(),
            is_licensed,
        }
    }

    fn fields(&self) -> [(&'static str, String); 4] {
        [
            (NodeField::LongName.as_str(), self.long_name.clone()),
            (NodeField::ShortName.as_str(), self.short_name.clone()),
            (NodeField::HwModel.as_str(), self.hw_model.clone()),
            (NodeField::IsLicensed.as_str(), self.is_licensed.to_string()),
        ]
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self::new(UNKNOWN, UNKNOWN, UNKNOWN, false)
    }
}

impl From<&User> for NodeMetadata {
    fn from(user: &User) -> Self {
        let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            long_name: or_unknown(&user.long_name),
            short_name: or_unknown(&user.short_name),
            hw_model: or_unknown(&user.hw_model),
            is_licensed: user.is_licensed.unwrap_or(false),
        }
    }
}

/// Long and short display names of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayNames {
    /// Long display name
    pub long_name: String,
    /// Short display name
    pub short_name: String,
}

impl DisplayNames {
    /// Names used when the node id itself is unknown
    pub fn unknown() -> Self {
        Self {
            long_name: UNKNOWN.to_string(),
            short_name: UNKNOWN.to_string(),
        }
    }

    /// Check if the long name resolved
    pub fn is_known(&self) -> bool {
        self.long_name != UNKNOWN
    }
}

/// Resolves and persists node metadata in an [`ExpiringStore`]
#[derive(Clone)]
pub struct NodeResolver {
    store: Arc<dyn ExpiringStore>,
    ttl: Duration,
}

impl NodeResolver {
    /// Create a resolver whose records expire after `ttl`
    pub fn new(store: Arc<dyn ExpiringStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Create from metadata configuration
    pub fn from_config(store: Arc<dyn ExpiringStore>, config: &MetadataConfig) -> Self {
        Self::new(store, config.ttl)
    }

    /// Resolve one field of a node's record
    ///
    /// Returns [`UNKNOWN`] if the node or the field is absent, or if the
    /// stored bytes are not valid UTF-8.
    pub async fn get(&self, node_id: u32, field: NodeField) -> Result<String> {
        let raw = self
            .store
            .hash_get(&node_key(node_id), field.as_str())
            .await?;

        Ok(match raw {
            Some(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| {
                debug!(node_id, field = field.as_str(), "Stored value is not UTF-8");
                UNKNOWN.to_string()
            }),
            None => UNKNOWN.to_string(),
        })
    }

    /// Resolve long and short names
    pub async fn names(&self, node_id: u32) -> Result<DisplayNames> {
        Ok(DisplayNames {
            long_name: self.get(node_id, NodeField::LongName).await?,
            short_name: self.get(node_id, NodeField::ShortName).await?,
        })
    }

    /// Check if the node's long name resolves
    pub async fn is_known(&self, node_id: u32) -> Result<bool> {
        Ok(self.get(node_id, NodeField::LongName).await? != UNKNOWN)
    }

    /// Upsert a node's record and reset its expiry
    ///
    /// Node id 0 is not a real node and is ignored.
    pub async fn save(&self, node_id: u32, metadata: &NodeMetadata) -> Result<()> {
        if node_id == 0 {
            trace!("Ignoring metadata for node 0");
            return Ok(());
        }

        let owned = metadata.fields();
        let fields: Vec<(&str, String)> = owned
            .iter()
            .map(|(name, value)| (*name, value.clone()))
            .collect();

        self.store
            .hash_set(&node_key(node_id), &fields, self.ttl)
            .await?;

        debug!(
            node_id,
            long_name = %metadata.long_name,
            short_name = %metadata.short_name,
            "Saved node metadata"
        );
        Ok(())
    }

    /// Pre-seed records from a device NodeDB
    ///
    /// Returns the number of records saved.
    pub async fn import_node_db<I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (u32, NodeMetadata)>,
    {
        let mut saved = 0;
        for (node_id, metadata) in entries {
            if node_id == 0 {
                continue;
            }
            self.save(node_id, &metadata).await?;
            saved += 1;
        }

        if saved == 0 {
            warn!("NodeDB import contained no nodes");
        } else {
            info!(nodes = saved, "Imported NodeDB");
        }
        Ok(saved)
    }

    /// Record expiry
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for NodeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeResolver")
            .field("backend", &self.store.backend())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct NodeDbEntry {
    num: u32,
    #[serde(default)]
    user: Option<User>,
}

/// Parse a NodeDB dump
///
/// Accepts either an array of node entries or an object keyed by user id
/// (the shape Meshtastic clients expose), where each entry has a numeric
/// `num` and an optional `user`. Entries without a user are skipped.
pub fn parse_node_db(text: &str) -> Result<Vec<(u32, NodeMetadata)>> {
    let value: Value = serde_json::from_str(text)?;
    let raw_entries: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        _ => {
            return Err(ExporterError::Decode(
                "NodeDB must be a JSON array or object".to_string(),
            ))
        }
    };

    let mut nodes = Vec::with_capacity(raw_entries.len());
    for raw in raw_entries {
        let entry: NodeDbEntry = serde_json::from_value(raw)?;
        match entry.user {
            Some(user) => nodes.push((entry.num, NodeMetadata::from(&user))),
            None => trace!(node_id = entry.num, "NodeDB entry has no user"),
        }
    }
    Ok(nodes)
}
