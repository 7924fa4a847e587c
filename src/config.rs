//! Connection and tree configuration.
//!
//! Configuration arrives through a [`ConfigReader`], a typed lookup over an
//! ordered set of layers (later layers override earlier ones). The resulting
//! [`ConnectionConfig`] and [`TreeConfig`] values are validated once and then
//! treated as read-only. A tree's configuration is persisted alongside the
//! tree's metadata so a reopened file keeps its page geometry.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PAGE_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;

const ALLOCATION_SIZE_MIN: u32 = 512;
const ALLOCATION_SIZE_MAX: u32 = 128 * MB as u32;
const PAGE_SIZE_MAX: u32 = 512 * MB as u32;

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    Int(u64),
    Bool(bool),
    Str(String),
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Str(v.to_string())
    }
}

/// Typed key lookups over layered configuration.
pub trait ConfigReader {
    fn get(&self, key: &str) -> Option<&ConfigValue>;

    fn get_u64(&self, key: &str) -> StorageResult<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Int(v)) => Ok(Some(*v)),
            Some(other) => Err(StorageError::InvalidConfig(format!(
                "{key}: expected an integer, found {other:?}"
            ))),
        }
    }

    fn get_bool(&self, key: &str) -> StorageResult<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Bool(v)) => Ok(Some(*v)),
            Some(ConfigValue::Int(v)) => Ok(Some(*v != 0)),
            Some(other) => Err(StorageError::InvalidConfig(format!(
                "{key}: expected a boolean, found {other:?}"
            ))),
        }
    }

    fn get_str(&self, key: &str) -> StorageResult<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(StorageError::InvalidConfig(format!(
                "{key}: expected a string, found {other:?}"
            ))),
        }
    }
}

/// Ordered configuration layers; lookups search from the last layer back.
#[derive(Debug, Default, Clone)]
pub struct ConfigLayers {
    layers: Vec<HashMap<String, ConfigValue>>,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_layer<I, K, V>(&mut self, entries: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.layers.push(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Set a value on the top layer, creating one if there are none.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> &mut Self {
        if self.layers.is_empty() {
            self.layers.push(HashMap::new());
        }
        if let Some(top) = self.layers.last_mut() {
            top.insert(key.into(), value.into());
        }
        self
    }
}

impl ConfigReader for ConfigLayers {
    fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.layers.iter().rev().find_map(|layer| layer.get(key))
    }
}

fn read_u32(reader: &dyn ConfigReader, key: &str, target: &mut u32) -> StorageResult<()> {
    if let Some(v) = reader.get_u64(key)? {
        *target = u32::try_from(v)
            .map_err(|_| StorageError::InvalidConfig(format!("{key}: {v} is out of range")))?;
    }
    Ok(())
}

fn read_usize(reader: &dyn ConfigReader, key: &str, target: &mut usize) -> StorageResult<()> {
    if let Some(v) = reader.get_u64(key)? {
        *target = v as usize;
    }
    Ok(())
}

/// Connection-wide cache, session and server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Cache budget in bytes.
    pub cache_size: u64,
    /// Hazard reference slots per session.
    pub hazard_max: usize,
    pub session_max: usize,
    /// First session allocation chunk.
    pub data_update_min: usize,
    /// Largest session allocation chunk.
    pub data_update_max: usize,
    pub read_request_slots: usize,
    pub evict_request_slots: usize,
    pub evict_walk_per_tree: usize,
    pub evict_walk_base: usize,
    pub evict_group: usize,
    pub evict_retry_max: u32,
    pub evict_retry_backoff: Duration,
    /// Wake the eviction server at this share of the cache budget.
    pub evict_trigger_pct: u32,
    /// Evict until usage falls below this share.
    pub evict_target_pct: u32,
    /// Stop page reads at this share.
    pub read_lockout_pct: u32,
    /// Resume page reads once usage falls below this share.
    pub read_lockout_clear_pct: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cache_size: 20 * MB,
            hazard_max: 15,
            session_max: 50,
            data_update_min: 8 * KB as usize,
            data_update_max: 8 * MB as usize,
            read_request_slots: 40,
            evict_request_slots: 20,
            evict_walk_per_tree: 20,
            evict_walk_base: 100,
            evict_group: 50,
            evict_retry_max: 5,
            evict_retry_backoff: Duration::from_millis(10),
            evict_trigger_pct: 95,
            evict_target_pct: 90,
            read_lockout_pct: 110,
            read_lockout_clear_pct: 85,
        }
    }
}

impl ConnectionConfig {
    pub fn from_reader(reader: &dyn ConfigReader) -> StorageResult<Self> {
        let mut config = Self::default();
        if let Some(v) = reader.get_u64("cache_size")? {
            config.cache_size = v;
        }
        read_usize(reader, "hazard_max", &mut config.hazard_max)?;
        read_usize(reader, "session_max", &mut config.session_max)?;
        read_usize(reader, "data_update_min", &mut config.data_update_min)?;
        read_usize(reader, "data_update_max", &mut config.data_update_max)?;
        read_usize(reader, "read_request_slots", &mut config.read_request_slots)?;
        read_usize(reader, "evict_request_slots", &mut config.evict_request_slots)?;
        read_usize(reader, "evict_walk_per_tree", &mut config.evict_walk_per_tree)?;
        read_usize(reader, "evict_walk_base", &mut config.evict_walk_base)?;
        read_usize(reader, "evict_group", &mut config.evict_group)?;
        read_u32(reader, "evict_retry_max", &mut config.evict_retry_max)?;
        if let Some(ms) = reader.get_u64("evict_retry_backoff_ms")? {
            config.evict_retry_backoff = Duration::from_millis(ms);
        }
        read_u32(reader, "evict_trigger_pct", &mut config.evict_trigger_pct)?;
        read_u32(reader, "evict_target_pct", &mut config.evict_target_pct)?;
        read_u32(reader, "read_lockout_pct", &mut config.read_lockout_pct)?;
        read_u32(
            reader,
            "read_lockout_clear_pct",
            &mut config.read_lockout_clear_pct,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.cache_size < MB / 4 {
            return Err(StorageError::InvalidConfig(format!(
                "cache_size {} is smaller than the minimum of {}",
                self.cache_size,
                MB / 4
            )));
        }
        if self.hazard_max == 0 || self.session_max == 0 {
            return Err(StorageError::InvalidConfig(
                "hazard_max and session_max must be non-zero".to_string(),
            ));
        }
        if self.read_request_slots == 0 || self.evict_request_slots == 0 {
            return Err(StorageError::InvalidConfig(
                "request tables must have at least one slot".to_string(),
            ));
        }
        if self.data_update_min == 0 || self.data_update_min > self.data_update_max {
            return Err(StorageError::InvalidConfig(format!(
                "data_update_min {} must be non-zero and no larger than data_update_max {}",
                self.data_update_min, self.data_update_max
            )));
        }
        if self.evict_target_pct > self.evict_trigger_pct
            || self.read_lockout_clear_pct > self.read_lockout_pct
            || self.read_lockout_clear_pct > self.evict_trigger_pct
        {
            return Err(StorageError::InvalidConfig(
                "eviction thresholds must satisfy target <= trigger and lockout clear <= lockout"
                    .to_string(),
            ));
        }
        if self.evict_group == 0 || self.evict_walk_per_tree == 0 {
            return Err(StorageError::InvalidConfig(
                "eviction batch sizes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn bytes_at_pct(&self, pct: u32) -> u64 {
        self.cache_size / 100 * pct as u64
    }
}

/// The physical layout of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeType {
    Row,
    ColumnFixed { bitcnt: u8 },
    ColumnVariable,
}

impl TreeType {
    pub fn is_column(&self) -> bool {
        !matches!(self, TreeType::Row)
    }
}

/// Per-tree page geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    pub tree_type: TreeType,
    pub allocation_size: u32,
    pub internal_page_max: u32,
    pub leaf_page_max: u32,
    /// Largest item stored on an internal page; 0 derives it from the split size.
    pub internal_item_max: u32,
    /// Largest item stored on a leaf page; 0 derives it from the split size.
    pub leaf_item_max: u32,
    pub split_pct: u32,
    pub runlength_encoding: bool,
    pub verify_on_read: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            tree_type: TreeType::Row,
            allocation_size: 512,
            internal_page_max: 2 * KB as u32,
            leaf_page_max: 32 * KB as u32,
            internal_item_max: 0,
            leaf_item_max: 0,
            split_pct: 75,
            runlength_encoding: true,
            verify_on_read: false,
        }
    }
}

impl TreeConfig {
    pub fn row() -> Self {
        Self::default()
    }

    pub fn column_fixed(bitcnt: u8) -> Self {
        Self {
            tree_type: TreeType::ColumnFixed { bitcnt },
            ..Self::default()
        }
    }

    pub fn column_variable() -> Self {
        Self {
            tree_type: TreeType::ColumnVariable,
            ..Self::default()
        }
    }

    pub fn from_reader(reader: &dyn ConfigReader) -> StorageResult<Self> {
        let mut config = Self::default();
        if let Some(kind) = reader.get_str("key_format")? {
            config.tree_type = match kind {
                "u" => TreeType::Row,
                "r" => match reader.get_u64("bitcnt")? {
                    Some(bits) => TreeType::ColumnFixed {
                        bitcnt: u8::try_from(bits).map_err(|_| {
                            StorageError::InvalidConfig(format!("bitcnt {bits} is out of range"))
                        })?,
                    },
                    None => TreeType::ColumnVariable,
                },
                other => {
                    return Err(StorageError::InvalidConfig(format!(
                        "unknown key_format {other:?}"
                    )))
                }
            };
        }
        read_u32(reader, "allocation_size", &mut config.allocation_size)?;
        read_u32(reader, "internal_page_max", &mut config.internal_page_max)?;
        read_u32(reader, "leaf_page_max", &mut config.leaf_page_max)?;
        read_u32(reader, "internal_item_max", &mut config.internal_item_max)?;
        read_u32(reader, "leaf_item_max", &mut config.leaf_item_max)?;
        read_u32(reader, "split_pct", &mut config.split_pct)?;
        if let Some(v) = reader.get_bool("runlength_encoding")? {
            config.runlength_encoding = v;
        }
        if let Some(v) = reader.get_bool("verify_on_read")? {
            config.verify_on_read = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StorageResult<()> {
        let alloc = self.allocation_size;
        if !alloc.is_power_of_two() || !(ALLOCATION_SIZE_MIN..=ALLOCATION_SIZE_MAX).contains(&alloc)
        {
            return Err(StorageError::InvalidConfig(format!(
                "allocation_size {alloc} must be a power of two between {ALLOCATION_SIZE_MIN} and {ALLOCATION_SIZE_MAX}"
            )));
        }
        for (name, size) in [
            ("internal_page_max", self.internal_page_max),
            ("leaf_page_max", self.leaf_page_max),
        ] {
            if size == 0 || size % alloc != 0 || size > PAGE_SIZE_MAX {
                return Err(StorageError::InvalidConfig(format!(
                    "{name} {size} must be a non-zero multiple of the allocation size {alloc}, at most {PAGE_SIZE_MAX}"
                )));
            }
        }
        if !(25..=100).contains(&self.split_pct) {
            return Err(StorageError::InvalidConfig(format!(
                "split_pct {} must be between 25 and 100",
                self.split_pct
            )));
        }
        if let TreeType::ColumnFixed { bitcnt } = self.tree_type {
            if !(1..=8).contains(&bitcnt) {
                return Err(StorageError::InvalidConfig(format!(
                    "bitcnt {bitcnt} must be between 1 and 8"
                )));
            }
        }

        // Two items have to fit on a page, and on a split page.
        for (name, item_max, split) in [
            (
                "internal_item_max",
                self.internal_item_max(),
                self.internal_split_size(),
            ),
            ("leaf_item_max", self.leaf_item_max(), self.leaf_split_size()),
        ] {
            let usable = split.saturating_sub(PAGE_HEADER_SIZE as u32);
            if item_max == 0 || item_max > usable / 2 {
                return Err(StorageError::InvalidConfig(format!(
                    "{name} {item_max} is too large: two items must fit in {usable} bytes"
                )));
            }
        }
        Ok(())
    }

    /// Target size of a chunk when a page splits.
    pub fn split_size(&self, page_max: u32) -> u32 {
        let alloc = self.allocation_size as u64;
        let target = page_max as u64 * self.split_pct as u64 / 100;
        let aligned = target.div_ceil(alloc) * alloc;
        aligned.clamp(alloc, page_max as u64) as u32
    }

    pub fn internal_split_size(&self) -> u32 {
        self.split_size(self.internal_page_max)
    }

    pub fn leaf_split_size(&self) -> u32 {
        self.split_size(self.leaf_page_max)
    }

    pub fn internal_item_max(&self) -> u32 {
        match self.internal_item_max {
            0 => self.internal_split_size() / 8,
            n => n,
        }
    }

    pub fn leaf_item_max(&self) -> u32 {
        match self.leaf_item_max {
            0 => self.leaf_split_size() / 8,
            n => n,
        }
    }

    /// Round a byte length up to a whole number of allocation units.
    pub fn align(&self, len: usize) -> usize {
        let alloc = self.allocation_size as usize;
        len.div_ceil(alloc) * alloc
    }
}
