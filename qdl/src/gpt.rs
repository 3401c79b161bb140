// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! GPT partition table codec built atop `gptman`.
//!
//! `gptman` already parses/validates the header and entry array; this module
//! adds the Qualcomm-specific layer on top: the logical `Partition` view,
//! A/B slot aggregation, attribute patch-offset math, and `rawprogram.xml`/
//! `partition.xml` emission.

use std::io::{Read, Seek, SeekFrom};

use gptman::{GPT, GPTPartitionEntry};
use indexmap::IndexMap;
use thiserror::Error;
use xmltree::{Element, EmitterConfig, XMLNode};

#[derive(Debug, Error)]
pub enum GptError {
    #[error("I/O error reading GPT: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed GPT: {0}")]
    Malformed(String),
    #[error("gptman error: {0}")]
    GptMan(String),
}

impl From<gptman::Error> for GptError {
    fn from(e: gptman::Error) -> Self {
        GptError::GptMan(e.to_string())
    }
}

/// Logical view of a GPT entry.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub start_lba: u64,
    pub end_lba: u64,
    pub attributes: u64,
    pub lun: u8,
    pub entry_index: u32,
    pub sector_size: u64,
}

impl Partition {
    pub fn size_sectors(&self) -> u64 {
        self.end_lba - self.start_lba + 1
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_sectors() * self.sector_size
    }

    pub fn slot_info(&self) -> SlotInfo {
        SlotInfo::from_attributes(self.attributes)
    }
}

/// A/B slot state packed into bits 48-55 of the attribute word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub priority: u8,
    pub active: bool,
    pub successful: bool,
    pub unbootable: bool,
}

impl SlotInfo {
    pub fn from_attributes(attrs: u64) -> SlotInfo {
        SlotInfo {
            priority: ((attrs >> 48) & 0b11) as u8,
            active: (attrs >> 50) & 1 != 0,
            successful: (attrs >> 51) & 1 != 0,
            unbootable: (attrs >> 52) & 1 != 0,
        }
    }
}

/// Apply the set-flags helper: update priority/active/successful/unbootable
/// without disturbing any other bit.
pub fn set_flags(attrs: u64, active: bool, priority: u8, successful: bool, unbootable: bool) -> u64 {
    const FIELD_MASK: u64 = 0b1_1111 << 48; // bits 48..=52
    let mut v = attrs & !FIELD_MASK;
    v |= (priority as u64 & 0b11) << 48;
    if active {
        v |= 1 << 50;
    }
    if successful {
        v |= 1 << 51;
    }
    if unbootable {
        v |= 1 << 52;
    }
    v
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateSlot {
    A,
    B,
    /// A/B partitions exist but none is active.
    Undefined,
    /// Conflicting votes across LUNs/partitions.
    Unknown,
    /// No A/B partitions at all.
    Nonexistent,
}

/// Scan partition names for `_a`/`_b` suffixes and tally active votes per
/// LUN; the aggregate is the majority vote, `Unknown` on a tie.
pub fn aggregate_slot(partitions: &[Partition]) -> (AggregateSlot, (u32, u32)) {
    let mut votes_a = 0u32;
    let mut votes_b = 0u32;
    let mut has_ab = false;

    for p in partitions {
        let is_a = p.name.ends_with("_a");
        let is_b = p.name.ends_with("_b");
        if !is_a && !is_b {
            continue;
        }
        has_ab = true;
        if p.slot_info().active {
            if is_a {
                votes_a += 1;
            } else {
                votes_b += 1;
            }
        }
    }

    if !has_ab {
        return (AggregateSlot::Nonexistent, (0, 0));
    }

    let slot = match votes_a.cmp(&votes_b) {
        std::cmp::Ordering::Greater => AggregateSlot::A,
        std::cmp::Ordering::Less => AggregateSlot::B,
        std::cmp::Ordering::Equal if votes_a == 0 => AggregateSlot::Undefined,
        std::cmp::Ordering::Equal => AggregateSlot::Unknown,
    };
    (slot, (votes_a, votes_b))
}

/// A parsed GPT plus the geometry needed for patch-offset math.
#[derive(Debug, Clone)]
pub struct GptTable {
    pub sector_size: u64,
    pub partition_entry_lba: u64,
    pub partitions: Vec<Partition>,
}

impl GptTable {
    /// Byte offset of partition `entry_index`'s attribute field.
    pub fn attribute_byte_offset(&self, entry_index: u32) -> u64 {
        (self.partition_entry_lba * self.sector_size) + (entry_index as u64 * 128) + 48
    }

    /// Generate a `<patch>`-ready (start_sector, byte_offset_within_sector,
    /// little-endian value) triple for a new attribute word.
    pub fn attribute_patch(&self, entry_index: u32, new_attrs: u64) -> (u64, u64, [u8; 8]) {
        let abs = self.attribute_byte_offset(entry_index);
        (
            abs / self.sector_size,
            abs % self.sector_size,
            new_attrs.to_le_bytes(),
        )
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn aggregate_slot(&self) -> (AggregateSlot, (u32, u32)) {
        aggregate_slot(&self.partitions)
    }
}

/// Parse the primary GPT off `reader`. Tries 512 then 4096 byte sectors
/// since the signature position alone doesn't disambiguate.
pub fn parse<R: Read + Seek>(reader: &mut R, lun: u8) -> Result<GptTable, GptError> {
    for sector_size in [512u64, 4096u64] {
        reader.seek(SeekFrom::Start(0))?;
        match GPT::read_from(reader, sector_size) {
            Ok(gpt) => {
                let mut partitions = Vec::new();
                for (idx, entry) in gpt.iter() {
                    if !is_used(entry) {
                        continue;
                    }
                    partitions.push(Partition {
                        name: entry.partition_name.to_string(),
                        type_guid: entry.partition_type_guid,
                        unique_guid: entry.unique_partition_guid,
                        start_lba: entry.starting_lba,
                        end_lba: entry.ending_lba,
                        attributes: entry.attribute_bits,
                        lun,
                        entry_index: idx,
                        sector_size,
                    });
                }
                return Ok(GptTable {
                    sector_size,
                    partition_entry_lba: gpt.header.partition_entry_lba,
                    partitions,
                });
            }
            Err(_) => continue,
        }
    }
    Err(GptError::Malformed(
        "couldn't locate a valid GPT header at 512 or 4096 byte sectors".into(),
    ))
}

fn is_used(entry: &GPTPartitionEntry) -> bool {
    entry.partition_type_guid != [0u8; 16]
}

/// Emit a `rawprogram.xml`-shaped document: one `<program>` per partition.
pub fn emit_rawprogram_xml(table: &GptTable, phys_part_idx: u8) -> String {
    let mut root = Element::new("data");
    for p in &table.partitions {
        let mut attrs = IndexMap::new();
        attrs.insert("SECTOR_SIZE_IN_BYTES".into(), table.sector_size.to_string());
        attrs.insert("file_sector_offset".into(), "0".into());
        attrs.insert("filename".into(), String::new());
        attrs.insert("label".into(), p.name.clone());
        attrs.insert(
            "num_partition_sectors".into(),
            p.size_sectors().to_string(),
        );
        attrs.insert(
            "physical_partition_number".into(),
            phys_part_idx.to_string(),
        );
        attrs.insert("size_in_KB".into(), (p.size_bytes() / 1024).to_string());
        attrs.insert("start_sector".into(), p.start_lba.to_string());

        let mut el = Element::new("program");
        el.attributes = attrs;
        root.children.push(XMLNode::Element(el));
    }
    serialize(&root)
}

/// Emit a `partition.xml`-shaped geometry listing.
pub fn emit_partition_xml(table: &GptTable, phys_part_idx: u8) -> String {
    let mut root = Element::new("data");
    for p in &table.partitions {
        let mut attrs = IndexMap::new();
        attrs.insert("label".into(), p.name.clone());
        attrs.insert("size_in_KB".into(), (p.size_bytes() / 1024).to_string());
        attrs.insert(
            "physical_partition_number".into(),
            phys_part_idx.to_string(),
        );
        attrs.insert("start_sector".into(), p.start_lba.to_string());

        let mut el = Element::new("partition");
        el.attributes = attrs;
        root.children.push(XMLNode::Element(el));
    }
    serialize(&root)
}

fn serialize(root: &Element) -> String {
    let mut buf = Vec::new();
    root.write_with_config(
        &mut buf,
        EmitterConfig::new().perform_indent(true),
    )
    .expect("writing to an in-memory buffer cannot fail");
    String::from_utf8(buf).expect("xmltree only emits UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(name: &str, lun: u8, idx: u32, attrs: u64) -> Partition {
        Partition {
            name: name.to_string(),
            type_guid: [1; 16],
            unique_guid: [2; 16],
            start_lba: 100,
            end_lba: 199,
            attributes: attrs,
            lun,
            entry_index: idx,
            sector_size: 4096,
        }
    }

    #[test]
    fn set_flags_only_touches_its_bits() {
        let original: u64 = 0xFFFF_0000_0000_00FF;
        let patched = set_flags(original, true, 3, false, false);

        assert_eq!(patched & 0x0000_FFFF_FFFF_FFFF, original & 0x0000_FFFF_FFFF_FFFF);
        assert_eq!(patched & 0xFFE0_0000_0000_0000, original & 0xFFE0_0000_0000_0000);
        assert_eq!((patched >> 48) & 0b11, 3);
        assert_eq!((patched >> 50) & 1, 1);
        assert_eq!((patched >> 51) & 1, 0);
        assert_eq!((patched >> 52) & 1, 0);
    }

    #[test]
    fn scenario_gpt_parse_with_ab() {
        let boot_a = partition("boot_a", 0, 10, set_flags(0, true, 3, false, false));
        let boot_b = partition("boot_b", 0, 11, set_flags(0, false, 1, false, false));
        let (slot, tally) = aggregate_slot(&[boot_a, boot_b]);
        assert_eq!(slot, AggregateSlot::A);
        assert_eq!(tally, (1, 0));
    }

    #[test]
    fn aggregate_slot_tie_is_unknown_empty_is_nonexistent() {
        let a = partition("boot_a", 0, 0, set_flags(0, true, 3, false, false));
        let b = partition("boot_b", 0, 1, set_flags(0, true, 3, false, false));
        assert_eq!(aggregate_slot(&[a, b]).0, AggregateSlot::Unknown);

        let no_ab = partition("modem", 0, 0, 0);
        assert_eq!(aggregate_slot(&[no_ab]).0, AggregateSlot::Nonexistent);
    }

    #[test]
    fn attribute_patch_offset_math() {
        let table = GptTable {
            sector_size: 512,
            partition_entry_lba: 2,
            partitions: vec![],
        };
        // offset = (2 * 512) + (5 * 128) + 48 = 1024 + 640 + 48 = 1712
        let (start_sector, within, _) = table.attribute_patch(5, 0);
        assert_eq!(start_sector, 1712 / 512);
        assert_eq!(within, 1712 % 512);
    }
}
