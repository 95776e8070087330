//! Runtime version ranges and block grouping
//!
//! Each runtime version decodes events for a contiguous range of block
//! numbers. The ranges are loaded from a JSON file of the form:
//!
//! ```json
//! { "149": { "block_number_min": 3014341, "block_number_max": 3290000, "block_hash_min": "0x…" } }
//! ```

use crate::types::{BlockHash, BlockNumber, BlockRef, RuntimeVersion};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Block range covered by one runtime version (both ends inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VersionRange {
    pub block_number_min: BlockNumber,
    pub block_number_max: BlockNumber,
    /// Hash of the first block of the range; the decode context is anchored here.
    pub block_hash_min: BlockHash,
}

impl VersionRange {
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.block_number_min <= block && block <= self.block_number_max
    }
}

/// All known runtime versions, ordered by version number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeVersions {
    ranges: BTreeMap<RuntimeVersion, VersionRange>,
}

impl RuntimeVersions {
    /// Build from explicit ranges, rejecting overlaps.
    pub fn new(ranges: BTreeMap<RuntimeVersion, VersionRange>) -> Result<Self> {
        if let Some((version, _)) = ranges
            .iter()
            .find(|(_, r)| r.block_number_min > r.block_number_max)
        {
            anyhow::bail!("Runtime version {} has an empty block range", version);
        }

        let mut sorted: Vec<(&RuntimeVersion, &VersionRange)> = ranges.iter().collect();
        sorted.sort_by_key(|(_, r)| r.block_number_min);
        for pair in sorted.windows(2) {
            let (va, a) = pair[0];
            let (vb, b) = pair[1];
            if b.block_number_min <= a.block_number_max {
                anyhow::bail!(
                    "Runtime versions {} and {} overlap at block {}",
                    va,
                    vb,
                    b.block_number_min
                );
            }
        }
        Ok(Self { ranges })
    }

    pub fn get(&self, version: RuntimeVersion) -> Option<&VersionRange> {
        self.ranges.get(&version)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RuntimeVersion, &VersionRange)> {
        self.ranges.iter().map(|(v, r)| (*v, r))
    }

    pub fn versions(&self) -> impl Iterator<Item = RuntimeVersion> + '_ {
        self.ranges.keys().copied()
    }

    pub fn latest(&self) -> Option<RuntimeVersion> {
        self.ranges.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Find the runtime version that decodes `block`.
    ///
    /// Blocks past the highest known range but not past the chain head
    /// belong to the version with the highest range.
    pub fn version_for_block(
        &self,
        block: BlockNumber,
        current_block: BlockNumber,
    ) -> Option<RuntimeVersion> {
        let lowest_min = self.ranges.values().map(|r| r.block_number_min).min()?;
        if block < lowest_min {
            return None;
        }

        if let Some((version, _)) = self.ranges.iter().find(|(_, r)| r.contains(block)) {
            return Some(*version);
        }

        if block > current_block {
            return None;
        }

        let (highest_version, highest_range) = self
            .ranges
            .iter()
            .max_by_key(|(_, r)| r.block_number_max)?;
        if block > highest_range.block_number_max {
            return Some(*highest_version);
        }

        // Falls in a gap between two known ranges
        None
    }
}

#[derive(Deserialize)]
struct VersionFileEntry {
    block_number_min: BlockNumber,
    block_number_max: BlockNumber,
    block_hash_min: BlockHash,
}

/// Load runtime version ranges from a JSON file.
pub fn load_versions(path: &Path) -> Result<RuntimeVersions> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read runtime versions file: {:?}", path))?;
    parse_versions(&contents)
        .with_context(|| format!("Invalid runtime versions file: {:?}", path))
}

/// Parse runtime version ranges from JSON text.
pub fn parse_versions(contents: &str) -> Result<RuntimeVersions> {
    let raw: HashMap<String, VersionFileEntry> =
        serde_json::from_str(contents).context("Failed to parse runtime versions JSON")?;

    let mut ranges = BTreeMap::new();
    for (key, entry) in raw {
        let version: RuntimeVersion = key
            .trim()
            .parse()
            .with_context(|| format!("Runtime version key is not an integer: {}", key))?;
        ranges.insert(
            version,
            VersionRange {
                block_number_min: entry.block_number_min,
                block_number_max: entry.block_number_max,
                block_hash_min: entry.block_hash_min,
            },
        );
    }

    if ranges.is_empty() {
        anyhow::bail!("Runtime versions file is empty");
    }
    RuntimeVersions::new(ranges)
}

/// Group resolved blocks by runtime version and split each group into batches.
///
/// Blocks that fall outside every known range are dropped with a warning.
pub fn group_blocks(
    blocks: &[BlockRef],
    current_block: BlockNumber,
    versions: &RuntimeVersions,
    batch_size: usize,
) -> BTreeMap<RuntimeVersion, Vec<Vec<BlockRef>>> {
    let batch_size = batch_size.max(1);
    let mut grouped: BTreeMap<RuntimeVersion, Vec<BlockRef>> = BTreeMap::new();

    for block in blocks {
        match versions.version_for_block(block.number, current_block) {
            Some(version) => grouped.entry(version).or_default().push(*block),
            None => warn!("Block {} is outside current groupings.", block.number),
        }
    }

    grouped
        .into_iter()
        .map(|(version, list)| {
            let batches = list.chunks(batch_size).map(|c| c.to_vec()).collect();
            (version, batches)
        })
        .collect()
}
