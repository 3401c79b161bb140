// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android dynamic-partition (LP) metadata codec.

use std::io::{Read, Seek, SeekFrom};

use thiserror::Error;

pub const LP_GEOMETRY_MAGIC: u32 = 0x616C4467;
pub const LP_GEOMETRY_OFFSET: u64 = 4096;
pub const LP_GEOMETRY_SIZE: usize = 4096;

pub const LP_HEADER_MAGIC_STANDARD: u32 = 0x41680530;
pub const LP_HEADER_MAGIC_LENOVO: u32 = 0x414C5030;

/// Offsets tried in order to locate the metadata header.
const CANDIDATE_HEADER_OFFSETS: [u64; 4] = [8192, 12288, 4096, 16384];

const PARTITION_ENTRY_SIZE: usize = 48;
const EXTENT_ENTRY_SIZE: usize = 24;
const EXTENT_KIND_LINEAR: u32 = 0;

#[derive(Debug, Error)]
pub enum LpError {
    #[error("I/O error reading LP metadata: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed LP metadata: {0}")]
    Malformed(String),
    #[error("no recognized LP metadata header found at any candidate offset")]
    HeaderNotFound,
}

#[derive(Debug, Clone, Copy)]
pub struct LpGeometry {
    pub metadata_max_size: u32,
    pub slot_count: u32,
}

impl LpGeometry {
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<LpGeometry, LpError> {
        reader.seek(SeekFrom::Start(LP_GEOMETRY_OFFSET))?;
        let mut buf = [0u8; LP_GEOMETRY_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != LP_GEOMETRY_MAGIC {
            return Err(LpError::Malformed(format!(
                "bad LP geometry magic 0x{magic:x}"
            )));
        }

        Ok(LpGeometry {
            metadata_max_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            slot_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TableDescriptor {
    offset: u32,
    num_entries: u32,
    entry_size: u32,
}

impl TableDescriptor {
    fn parse(buf: &[u8]) -> TableDescriptor {
        TableDescriptor {
            offset: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            num_entries: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            entry_size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// A single LINEAR extent: length and target offset, both in 512-byte units.
#[derive(Debug, Clone, Copy)]
pub struct LpExtent {
    pub num_sectors_512b: u64,
    pub target_data_512b: u64,
}

#[derive(Debug, Clone)]
pub struct LpPartition {
    pub name: String,
    pub attributes: u32,
    pub extents: Vec<LpExtent>,
}

impl LpPartition {
    /// Resolve every extent to an absolute device sector.
    pub fn resolve(&self, super_start_sector: u64, device_sector_size: u64) -> Vec<ResolvedExtent> {
        self.extents
            .iter()
            .map(|e| ResolvedExtent {
                absolute_sector: absolute_sector(super_start_sector, device_sector_size, e.target_data_512b),
                num_sectors: (e.num_sectors_512b * 512) / device_sector_size.max(1),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedExtent {
    pub absolute_sector: u64,
    pub num_sectors: u64,
}

/// `absolute = super_start + (super_offset_512B × 512 / device_sector_size)`.
pub fn absolute_sector(super_start_sector: u64, device_sector_size: u64, super_offset_512b: u64) -> u64 {
    super_start_sector + (super_offset_512b * 512) / device_sector_size.max(1)
}

#[derive(Debug, Clone)]
pub struct LpMetadata {
    pub header_magic: u32,
    pub partitions: Vec<LpPartition>,
}

impl LpMetadata {
    pub fn find(&self, name: &str) -> Option<&LpPartition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Try each candidate offset in turn and return the first that parses.
    pub fn locate_and_parse(blob: &[u8]) -> Result<LpMetadata, LpError> {
        for &offset in &CANDIDATE_HEADER_OFFSETS {
            if (offset as usize) >= blob.len() {
                continue;
            }
            if let Ok(m) = Self::parse_at(blob, offset as usize) {
                return Ok(m);
            }
        }
        Err(LpError::HeaderNotFound)
    }

    fn parse_at(blob: &[u8], offset: usize) -> Result<LpMetadata, LpError> {
        if blob.len() < offset + 12 {
            return Err(LpError::Malformed("truncated header".into()));
        }
        let magic = u32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap());
        if magic != LP_HEADER_MAGIC_STANDARD && magic != LP_HEADER_MAGIC_LENOVO {
            return Err(LpError::Malformed(format!("bad LP header magic 0x{magic:x}")));
        }

        // header_size sits right after the u32 magic and u16/u16 version pair.
        let header_size = u32::from_le_bytes(blob[offset + 8..offset + 12].try_into().unwrap()) as usize;
        let tables_start = offset + header_size;

        // Descriptors (partitions, extents, groups, block_devices) live in
        // the tail of the fixed header, each 12 bytes (offset/count/size).
        // They're found by walking backward from tables_start in 12-byte
        // strides once checksums are skipped; here we read them from a
        // fixed tail region sized to the four descriptors plus the two
        // 32-byte checksums, matching the on-disk liblp-derived layout.
        const DESC_REGION: usize = 4 * 12;
        if header_size < DESC_REGION {
            return Err(LpError::Malformed("header too small for table descriptors".into()));
        }
        let desc_start = offset + header_size - DESC_REGION;
        if blob.len() < desc_start + DESC_REGION {
            return Err(LpError::Malformed("truncated table descriptors".into()));
        }

        let partitions_desc = TableDescriptor::parse(&blob[desc_start..]);
        let extents_desc = TableDescriptor::parse(&blob[desc_start + 12..]);
        let _groups_desc = TableDescriptor::parse(&blob[desc_start + 24..]);
        let _block_devices_desc = TableDescriptor::parse(&blob[desc_start + 36..]);

        if partitions_desc.entry_size as usize != PARTITION_ENTRY_SIZE
            || extents_desc.entry_size as usize != EXTENT_ENTRY_SIZE
        {
            return Err(LpError::Malformed("unexpected table entry size".into()));
        }

        let extents = Self::read_extents(blob, tables_start, &extents_desc)?;
        let partitions = Self::read_partitions(blob, tables_start, &partitions_desc, &extents)?;

        Ok(LpMetadata {
            header_magic: magic,
            partitions,
        })
    }

    fn read_extents(
        blob: &[u8],
        tables_start: usize,
        desc: &TableDescriptor,
    ) -> Result<Vec<LpExtent>, LpError> {
        let base = tables_start + desc.offset as usize;
        let mut out = Vec::with_capacity(desc.num_entries as usize);
        for i in 0..desc.num_entries as usize {
            let off = base + i * EXTENT_ENTRY_SIZE;
            if blob.len() < off + EXTENT_ENTRY_SIZE {
                return Err(LpError::Malformed("truncated extent table".into()));
            }
            let num_sectors_512b = u64::from_le_bytes(blob[off..off + 8].try_into().unwrap());
            let kind = u32::from_le_bytes(blob[off + 8..off + 12].try_into().unwrap());
            let target_data_512b = u64::from_le_bytes(blob[off + 12..off + 20].try_into().unwrap());

            if kind != EXTENT_KIND_LINEAR {
                // Non-LINEAR extents (zero-fill, AB-update-source, …) are
                // out of scope for flashing; record a sentinel the
                // partition reader filters out.
                out.push(LpExtent {
                    num_sectors_512b: 0,
                    target_data_512b: u64::MAX,
                });
                continue;
            }
            out.push(LpExtent {
                num_sectors_512b,
                target_data_512b,
            });
        }
        Ok(out)
    }

    fn read_partitions(
        blob: &[u8],
        tables_start: usize,
        desc: &TableDescriptor,
        all_extents: &[LpExtent],
    ) -> Result<Vec<LpPartition>, LpError> {
        let base = tables_start + desc.offset as usize;
        let mut out = Vec::with_capacity(desc.num_entries as usize);
        for i in 0..desc.num_entries as usize {
            let off = base + i * PARTITION_ENTRY_SIZE;
            if blob.len() < off + PARTITION_ENTRY_SIZE {
                return Err(LpError::Malformed("truncated partition table".into()));
            }
            let name_bytes = &blob[off..off + 36];
            let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(36);
            let name = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

            let attributes = u32::from_le_bytes(blob[off + 36..off + 40].try_into().unwrap());
            let first_extent_index = u32::from_le_bytes(blob[off + 40..off + 44].try_into().unwrap()) as usize;
            let num_extents = u32::from_le_bytes(blob[off + 44..off + 48].try_into().unwrap()) as usize;

            let extents = all_extents
                .get(first_extent_index..first_extent_index + num_extents)
                .unwrap_or(&[])
                .iter()
                .filter(|e| e.target_data_512b != u64::MAX)
                .copied()
                .collect();

            out.push(LpPartition {
                name,
                attributes,
                extents,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_metadata(magic: u32) -> Vec<u8> {
        // Layout: [header_offset_padding][header][desc region][partition table][extent table]
        let header_offset = 8192usize;
        let num_partitions = 1u32;
        let num_extents = 1u32;

        let partitions_off = 0u32; // relative to tables_start
        let extents_off = (num_partitions as usize * PARTITION_ENTRY_SIZE) as u32;

        let mut desc_region = Vec::new();
        desc_region.extend_from_slice(&partitions_off.to_le_bytes());
        desc_region.extend_from_slice(&num_partitions.to_le_bytes());
        desc_region.extend_from_slice(&(PARTITION_ENTRY_SIZE as u32).to_le_bytes());
        desc_region.extend_from_slice(&extents_off.to_le_bytes());
        desc_region.extend_from_slice(&num_extents.to_le_bytes());
        desc_region.extend_from_slice(&(EXTENT_ENTRY_SIZE as u32).to_le_bytes());
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // groups offset
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // groups count
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // groups entry size
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // block devices offset
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // block devices count
        desc_region.extend_from_slice(&0u32.to_le_bytes()); // block devices entry size

        let header_size = 16 + desc_region.len(); // magic+ver+ver+header_size(u32) + desc region

        let mut header = Vec::new();
        header.extend_from_slice(&magic.to_le_bytes());
        header.extend_from_slice(&1u16.to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes());
        header.extend_from_slice(&(header_size as u32).to_le_bytes());
        header.extend_from_slice(&desc_region);

        let mut partition_entry = vec![0u8; PARTITION_ENTRY_SIZE];
        partition_entry[0..6].copy_from_slice(b"system");
        partition_entry[36..40].copy_from_slice(&0u32.to_le_bytes()); // attributes
        partition_entry[40..44].copy_from_slice(&0u32.to_le_bytes()); // first extent idx
        partition_entry[44..48].copy_from_slice(&1u32.to_le_bytes()); // num extents

        let mut extent_entry = vec![0u8; EXTENT_ENTRY_SIZE];
        extent_entry[0..8].copy_from_slice(&2048u64.to_le_bytes()); // num_sectors_512b
        extent_entry[8..12].copy_from_slice(&0u32.to_le_bytes()); // LINEAR
        extent_entry[12..20].copy_from_slice(&16384u64.to_le_bytes()); // target_data_512b

        let mut blob = vec![0u8; header_offset];
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&partition_entry);
        blob.extend_from_slice(&extent_entry);
        blob
    }

    #[test]
    fn locate_and_parse_finds_header_and_partition() {
        let blob = build_minimal_metadata(LP_HEADER_MAGIC_STANDARD);
        let meta = LpMetadata::locate_and_parse(&blob).unwrap();
        assert_eq!(meta.header_magic, LP_HEADER_MAGIC_STANDARD);
        let part = meta.find("system").unwrap();
        assert_eq!(part.extents.len(), 1);
        assert_eq!(part.extents[0].num_sectors_512b, 2048);
        assert_eq!(part.extents[0].target_data_512b, 16384);
    }

    #[test]
    fn lenovo_variant_magic_also_parses() {
        let blob = build_minimal_metadata(LP_HEADER_MAGIC_LENOVO);
        let meta = LpMetadata::locate_and_parse(&blob).unwrap();
        assert_eq!(meta.header_magic, LP_HEADER_MAGIC_LENOVO);
    }

    #[test]
    fn absolute_sector_matches_byte_invariant() {
        let super_start = 1000u64;
        let sector_size = 4096u64;
        let super_offset_512b = 32u64; // 32*512 = 16384 bytes, divisible by 4096

        let abs = absolute_sector(super_start, sector_size, super_offset_512b);
        assert_eq!(
            abs * sector_size,
            super_start * sector_size + super_offset_512b * 512
        );
    }

    #[test]
    fn resolve_extent_to_absolute_sector() {
        let part = LpPartition {
            name: "system".into(),
            attributes: 0,
            extents: vec![LpExtent {
                num_sectors_512b: 2048,
                target_data_512b: 16384,
            }],
        };
        let resolved = part.resolve(1000, 4096);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].absolute_sector, 1000 + (16384 * 512) / 4096);
        assert_eq!(resolved[0].num_sectors, (2048 * 512) / 4096);
    }
}
