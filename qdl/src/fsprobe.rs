// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Read-only filesystem identification and `build.prop` extraction.
//!
//! All traversal failures are non-fatal: callers get back either a property
//! map or "not found", never a hard error that should abort a flashing
//! session.

use indexmap::IndexMap;
use regex::bytes::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsProbeError {
    #[error("{0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext4,
    F2fs,
    Erofs,
    SquashFs,
    AndroidBoot,
    /// A vendor signature header precedes the real filesystem; carries the
    /// byte offset the real superblock was found at.
    Signed(u64),
    Unknown,
}

const EXT4_MAGIC_OFFSET: usize = 1024 + 56;
const EXT4_MAGIC: u16 = 0xEF53;
const F2FS_MAGIC: u32 = 0xF2F52010;
const EROFS_MAGIC: u32 = 0xE0F5E1E2;

const SIGNED_PROBE_OFFSETS: [u64; 6] = [4096, 8192, 65536, 1024 * 1024, 2 * 1024 * 1024, 4 * 1024 * 1024];

/// Inspect a >= 4 KiB head and classify the filesystem.
pub fn identify(head: &[u8]) -> FsKind {
    if let Some(kind) = identify_at_zero(head) {
        return kind;
    }

    // "Signed" heuristic: a short uppercase-letter/underscore prefix (a
    // vendor header) followed by the real filesystem at a known offset.
    let prefix_len = head
        .iter()
        .take_while(|&&b| b.is_ascii_uppercase() || b == b'_')
        .count();
    if prefix_len >= 2 && prefix_len < 16 {
        for &offset in &SIGNED_PROBE_OFFSETS {
            if (offset as usize) + 4 <= head.len() {
                if identify_at_zero(&head[offset as usize..]).is_some() {
                    return FsKind::Signed(offset);
                }
            }
        }
    }

    FsKind::Unknown
}

fn identify_at_zero(head: &[u8]) -> Option<FsKind> {
    if head.len() >= EXT4_MAGIC_OFFSET + 2 {
        let magic = u16::from_le_bytes(head[EXT4_MAGIC_OFFSET..EXT4_MAGIC_OFFSET + 2].try_into().unwrap());
        if magic == EXT4_MAGIC {
            return Some(FsKind::Ext4);
        }
    }
    if head.len() >= 1024 + 4 {
        let word = u32::from_le_bytes(head[1024..1024 + 4].try_into().unwrap());
        if word == F2FS_MAGIC {
            return Some(FsKind::F2fs);
        }
        if word == EROFS_MAGIC {
            return Some(FsKind::Erofs);
        }
    }
    if head.len() >= 4 {
        let word = u32::from_le_bytes(head[0..4].try_into().unwrap());
        if word == EROFS_MAGIC {
            return Some(FsKind::Erofs);
        }
    }
    if head.len() >= 4 && (&head[0..4] == b"hsqs" || &head[0..4] == b"sqsh") {
        return Some(FsKind::SquashFs);
    }
    if head.len() >= 8 && &head[0..8] == b"ANDROID!" {
        return Some(FsKind::AndroidBoot);
    }
    None
}

type PropertyMap = IndexMap<String, String>;

/// `system/etc/build.prop` is the only path this tool ever needs.
const SEARCH_PATH: [&str; 2] = ["system", "etc"];
const TARGET_FILE: &str = "build.prop";

fn parse_props(data: &[u8]) -> PropertyMap {
    let mut map = IndexMap::new();
    for line in data.split(|&b| b == b'\n' || b == 0) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

// ---------------------------------------------------------------------
// EROFS
// ---------------------------------------------------------------------

mod erofs {
    use super::*;

    const SB_OFFSET: usize = 1024;

    pub struct Superblock {
        pub blkszbits: u8,
        pub root_nid: u64,
        pub meta_blkaddr: u32,
    }

    pub fn parse_superblock(blob: &[u8]) -> Option<Superblock> {
        if blob.len() < SB_OFFSET + 80 {
            return None;
        }
        let sb = &blob[SB_OFFSET..];
        let magic = u32::from_le_bytes(sb[0..4].try_into().unwrap());
        if magic != EROFS_MAGIC {
            return None;
        }
        Some(Superblock {
            blkszbits: sb[12],
            root_nid: u16::from_le_bytes(sb[14..16].try_into().unwrap()) as u64,
            meta_blkaddr: u32::from_le_bytes(sb[36..40].try_into().unwrap()),
        })
    }

    pub enum DataLayout {
        FlatPlain,
        FlatComprLegacy,
        FlatInline,
        FlatCompr,
    }

    pub struct Inode {
        pub data_layout: DataLayout,
        pub mode: u16,
        pub size: u64,
        pub raw_blkaddr: u32,
        pub inode_len: usize,
        pub offset: usize,
    }

    const S_IFDIR: u16 = 0x4000;

    pub fn read_inode(blob: &[u8], sb: &Superblock, nid: u64) -> Option<Inode> {
        let block_size = 1u64 << sb.blkszbits;
        let offset = (sb.meta_blkaddr as u64 * block_size + nid * 32) as usize;
        if blob.len() < offset + 32 {
            return None;
        }
        let format = u16::from_le_bytes(blob[offset..offset + 2].try_into().unwrap());
        let extended = format & 1 != 0;
        let layout_bits = (format >> 1) & 0b111;
        let data_layout = match layout_bits {
            0 => DataLayout::FlatPlain,
            1 => DataLayout::FlatComprLegacy,
            2 => DataLayout::FlatInline,
            3 => DataLayout::FlatCompr,
            _ => return None,
        };
        let mode = u16::from_le_bytes(blob[offset + 4..offset + 6].try_into().unwrap());

        if extended {
            if blob.len() < offset + 64 {
                return None;
            }
            let size = u64::from_le_bytes(blob[offset + 8..offset + 16].try_into().unwrap());
            let raw_blkaddr = u32::from_le_bytes(blob[offset + 20..offset + 24].try_into().unwrap());
            Some(Inode { data_layout, mode, size, raw_blkaddr, inode_len: 64, offset })
        } else {
            let size = u32::from_le_bytes(blob[offset + 8..offset + 12].try_into().unwrap()) as u64;
            let raw_blkaddr = u32::from_le_bytes(blob[offset + 16..offset + 20].try_into().unwrap());
            Some(Inode { data_layout, mode, size, raw_blkaddr, inode_len: 32, offset })
        }
    }

    pub fn is_dir(inode: &Inode) -> bool {
        inode.mode & 0xF000 == S_IFDIR
    }

    /// Read an inode's file content. FLAT_PLAIN/FLAT_INLINE only; FLAT_COMPR
    /// is reported unsupported rather than attempting a hand-rolled decoder.
    pub fn read_data(blob: &[u8], sb: &Superblock, inode: &Inode) -> Result<Vec<u8>, FsProbeError> {
        let block_size = 1u64 << sb.blkszbits;
        match inode.data_layout {
            DataLayout::FlatPlain => {
                let start = inode.raw_blkaddr as u64 * block_size;
                let end = start + inode.size;
                if blob.len() < end as usize {
                    return Err(FsProbeError::NotFound("truncated erofs data block".into()));
                }
                Ok(blob[start as usize..end as usize].to_vec())
            }
            DataLayout::FlatInline => {
                // Tail data lives immediately after the inode record, in
                // the same metadata block.
                let start = inode.offset + inode.inode_len;
                let end = start + inode.size as usize;
                if blob.len() < end {
                    return Err(FsProbeError::NotFound("truncated erofs inline tail".into()));
                }
                Ok(blob[start..end].to_vec())
            }
            DataLayout::FlatComprLegacy | DataLayout::FlatCompr => Err(FsProbeError::Unsupported(
                "EROFS FLAT_COMPR traversal is best-effort only and not attempted".into(),
            )),
        }
    }

    /// Directory entries use the "first-name-offset" layout: a dirent array
    /// immediately followed by a names blob; entry count is implied by the
    /// first entry's nameoff.
    pub fn list_dir(data: &[u8]) -> Vec<(String, u64)> {
        if data.len() < 12 {
            return vec![];
        }
        let first_nameoff = u16::from_le_bytes(data[8..10].try_into().unwrap()) as usize;
        let count = first_nameoff / 12;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let base = i * 12;
            if data.len() < base + 12 {
                break;
            }
            let nid = u64::from_le_bytes(data[base..base + 8].try_into().unwrap());
            let nameoff = u16::from_le_bytes(data[base + 8..base + 10].try_into().unwrap()) as usize;
            let next_off = if i + 1 < count {
                u16::from_le_bytes(data[base + 12 + 8..base + 12 + 10].try_into().unwrap()) as usize
            } else {
                data.len()
            };
            if nameoff > data.len() || next_off > data.len() || nameoff > next_off {
                continue;
            }
            let name = String::from_utf8_lossy(&data[nameoff..next_off]).into_owned();
            out.push((name, nid));
        }
        out
    }
}

/// Walk an EROFS image looking for `system/etc/build.prop`.
pub fn traverse_erofs(blob: &[u8]) -> Result<PropertyMap, FsProbeError> {
    let sb = erofs::parse_superblock(blob).ok_or_else(|| FsProbeError::NotFound("no EROFS superblock".into()))?;
    let mut nid = sb.root_nid;

    for component in SEARCH_PATH {
        let inode = erofs::read_inode(blob, &sb, nid)
            .ok_or_else(|| FsProbeError::NotFound(format!("missing inode for {component}")))?;
        if !erofs::is_dir(&inode) {
            return Err(FsProbeError::NotFound(format!("{component} is not a directory")));
        }
        let data = erofs::read_data(blob, &sb, &inode)?;
        let entries = erofs::list_dir(&data);
        nid = entries
            .iter()
            .find(|(name, _)| name == component)
            .map(|(_, nid)| *nid)
            .ok_or_else(|| FsProbeError::NotFound(format!("{component} not found")))?;
    }

    let dir_inode = erofs::read_inode(blob, &sb, nid)
        .ok_or_else(|| FsProbeError::NotFound("missing etc/ inode".into()))?;
    let dir_data = erofs::read_data(blob, &sb, &dir_inode)?;
    let file_nid = erofs::list_dir(&dir_data)
        .iter()
        .find(|(name, _)| name == TARGET_FILE)
        .map(|(_, nid)| *nid)
        .ok_or_else(|| FsProbeError::NotFound("build.prop not found".into()))?;

    let file_inode = erofs::read_inode(blob, &sb, file_nid)
        .ok_or_else(|| FsProbeError::NotFound("missing build.prop inode".into()))?;
    let content = erofs::read_data(blob, &sb, &file_inode)?;
    Ok(parse_props(&content))
}

// ---------------------------------------------------------------------
// EXT4
// ---------------------------------------------------------------------

mod ext4 {
    use super::*;

    const SB_OFFSET: usize = 1024;
    const INCOMPAT_EXTENTS: u32 = 0x40;
    const EXTENTS_FL: u32 = 0x80000;
    const EXT_MAGIC: u16 = 0xF30A;
    const MAX_DEPTH: u8 = 5;

    pub struct Superblock {
        pub block_size: u64,
        pub inode_size: u16,
        pub inodes_per_group: u32,
        pub incompat_extents: bool,
    }

    pub fn parse_superblock(blob: &[u8]) -> Option<Superblock> {
        if blob.len() < SB_OFFSET + 1024 {
            return None;
        }
        let sb = &blob[SB_OFFSET..];
        let magic = u16::from_le_bytes(sb[56..58].try_into().unwrap());
        if magic != EXT4_MAGIC {
            return None;
        }
        let log_block_size = u32::from_le_bytes(sb[24..28].try_into().unwrap());
        let block_size = 1024u64 << log_block_size;
        let inodes_per_group = u32::from_le_bytes(sb[40..44].try_into().unwrap());
        let inode_size = u16::from_le_bytes(sb[88..90].try_into().unwrap());
        let feature_incompat = u32::from_le_bytes(sb[96..100].try_into().unwrap());

        Some(Superblock {
            block_size,
            inode_size,
            inodes_per_group,
            incompat_extents: feature_incompat & INCOMPAT_EXTENTS != 0,
        })
    }

    fn group_desc_table_block(sb: &Superblock) -> u64 {
        if sb.block_size == 1024 {
            2
        } else {
            1
        }
    }

    fn inode_table_block(blob: &[u8], sb: &Superblock, group: u32) -> Option<u64> {
        let gdt_off = group_desc_table_block(sb) * sb.block_size + (group as u64 * 32);
        if blob.len() < gdt_off as usize + 12 {
            return None;
        }
        let lo = u32::from_le_bytes(
            blob[gdt_off as usize + 8..gdt_off as usize + 12]
                .try_into()
                .unwrap(),
        );
        Some(lo as u64)
    }

    pub struct Inode {
        pub mode: u16,
        pub size: u64,
        pub flags: u32,
        pub block_field: [u8; 60],
    }

    pub fn read_inode(blob: &[u8], sb: &Superblock, ino: u32) -> Option<Inode> {
        let group = (ino - 1) / sb.inodes_per_group;
        let index_in_group = (ino - 1) % sb.inodes_per_group;
        let table_block = inode_table_block(blob, sb, group)?;
        let offset = table_block * sb.block_size + index_in_group as u64 * sb.inode_size as u64;
        let offset = offset as usize;
        if blob.len() < offset + sb.inode_size as usize || sb.inode_size < 128 {
            return None;
        }

        let mode = u16::from_le_bytes(blob[offset..offset + 2].try_into().unwrap());
        let size_lo = u32::from_le_bytes(blob[offset + 4..offset + 8].try_into().unwrap());
        let flags = u32::from_le_bytes(blob[offset + 32..offset + 36].try_into().unwrap());
        let mut block_field = [0u8; 60];
        block_field.copy_from_slice(&blob[offset + 40..offset + 100]);

        Some(Inode { mode, size: size_lo as u64, flags, block_field })
    }

    pub fn is_dir(inode: &Inode) -> bool {
        inode.mode & 0xF000 == 0x4000
    }

    /// Resolve logical block 0..n to physical blocks via direct block 0
    /// or, when EXTENTS_FL is set, the extent tree.
    fn resolve_blocks(blob: &[u8], sb: &Superblock, inode: &Inode) -> Result<Vec<u64>, FsProbeError> {
        let needed_blocks = inode.size.div_ceil(sb.block_size).max(1);

        if inode.flags & EXTENTS_FL == 0 {
            let block0 = u32::from_le_bytes(inode.block_field[0..4].try_into().unwrap()) as u64;
            return Ok(vec![block0]);
        }

        if !sb.incompat_extents {
            return Err(FsProbeError::Unsupported("EXTENTS_FL set without INCOMPAT_EXTENTS".into()));
        }

        let mut out = Vec::new();
        walk_extent_node(blob, &inode.block_field, needed_blocks, 0, &mut out)?;
        Ok(out)
    }

    fn walk_extent_node(
        blob: &[u8],
        node: &[u8],
        needed_blocks: u64,
        depth: u8,
        out: &mut Vec<u64>,
    ) -> Result<(), FsProbeError> {
        if depth > MAX_DEPTH {
            return Err(FsProbeError::Unsupported("extent tree exceeds depth cap".into()));
        }
        if node.len() < 12 {
            return Err(FsProbeError::NotFound("truncated extent header".into()));
        }
        let magic = u16::from_le_bytes(node[0..2].try_into().unwrap());
        if magic != EXT_MAGIC {
            return Err(FsProbeError::NotFound("bad extent tree magic".into()));
        }
        let entries = u16::from_le_bytes(node[2..4].try_into().unwrap());
        let tree_depth = u16::from_le_bytes(node[6..8].try_into().unwrap());

        for i in 0..entries as usize {
            let rec = &node[12 + i * 12..];
            if rec.len() < 12 {
                break;
            }
            if tree_depth == 0 {
                let len = u16::from_le_bytes(rec[4..6].try_into().unwrap());
                let start_hi = u16::from_le_bytes(rec[6..8].try_into().unwrap()) as u64;
                let start_lo = u32::from_le_bytes(rec[8..12].try_into().unwrap()) as u64;
                let physical = (start_hi << 32) | start_lo;
                for b in 0..len as u64 {
                    out.push(physical + b);
                    if out.len() as u64 >= needed_blocks {
                        return Ok(());
                    }
                }
            } else {
                let leaf_lo = u32::from_le_bytes(rec[4..8].try_into().unwrap()) as u64;
                let leaf_hi = u16::from_le_bytes(rec[8..10].try_into().unwrap()) as u64;
                let child_block = (leaf_hi << 32) | leaf_lo;
                // block_size is implied by the caller's earlier reads; we
                // only need a conservative 4 KiB header read here since the
                // header is always within the first few dozen bytes.
                let child_off = (child_block * 4096) as usize;
                if blob.len() < child_off + 12 {
                    return Err(FsProbeError::NotFound("truncated extent child block".into()));
                }
                walk_extent_node(blob, &blob[child_off..], needed_blocks, depth + 1, out)?;
            }
            if out.len() as u64 >= needed_blocks {
                return Ok(());
            }
        }
        Ok(())
    }

    pub fn read_data(blob: &[u8], sb: &Superblock, inode: &Inode) -> Result<Vec<u8>, FsProbeError> {
        let blocks = resolve_blocks(blob, sb, inode)?;
        let mut out = Vec::with_capacity(inode.size as usize);
        for block in blocks {
            let start = block * sb.block_size;
            let remaining = inode.size - out.len() as u64;
            let take = remaining.min(sb.block_size);
            let end = start + take;
            if blob.len() < end as usize {
                return Err(FsProbeError::NotFound("truncated ext4 data block".into()));
            }
            out.extend_from_slice(&blob[start as usize..end as usize]);
            if out.len() as u64 >= inode.size {
                break;
            }
        }
        Ok(out)
    }

    pub fn list_dir(data: &[u8]) -> Vec<(String, u32)> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= data.len() {
            let inode = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(data[pos + 4..pos + 6].try_into().unwrap()) as usize;
            let name_len = data[pos + 6] as usize;
            if rec_len < 8 || pos + rec_len > data.len() {
                break;
            }
            if inode != 0 && pos + 8 + name_len <= data.len() {
                let name = String::from_utf8_lossy(&data[pos + 8..pos + 8 + name_len]).into_owned();
                out.push((name, inode));
            }
            pos += rec_len;
        }
        out
    }
}

/// Walk an EXT4 image looking for `system/etc/build.prop`.
pub fn traverse_ext4(blob: &[u8]) -> Result<PropertyMap, FsProbeError> {
    let sb = ext4::parse_superblock(blob).ok_or_else(|| FsProbeError::NotFound("no ext4 superblock".into()))?;
    let mut ino = 2u32; // root inode

    for component in SEARCH_PATH {
        let inode = ext4::read_inode(blob, &sb, ino)
            .ok_or_else(|| FsProbeError::NotFound(format!("missing inode for {component}")))?;
        if !ext4::is_dir(&inode) {
            return Err(FsProbeError::NotFound(format!("{component} is not a directory")));
        }
        let data = ext4::read_data(blob, &sb, &inode)?;
        let entries = ext4::list_dir(&data);
        ino = entries
            .iter()
            .find(|(name, _)| name == component)
            .map(|(_, ino)| *ino)
            .ok_or_else(|| FsProbeError::NotFound(format!("{component} not found")))?;
    }

    let dir_inode = ext4::read_inode(blob, &sb, ino).ok_or_else(|| FsProbeError::NotFound("missing etc/ inode".into()))?;
    let dir_data = ext4::read_data(blob, &sb, &dir_inode)?;
    let file_ino = ext4::list_dir(&dir_data)
        .iter()
        .find(|(name, _)| name == TARGET_FILE)
        .map(|(_, ino)| *ino)
        .ok_or_else(|| FsProbeError::NotFound("build.prop not found".into()))?;

    let file_inode = ext4::read_inode(blob, &sb, file_ino)
        .ok_or_else(|| FsProbeError::NotFound("missing build.prop inode".into()))?;
    let content = ext4::read_data(blob, &sb, &file_inode)?;
    Ok(parse_props(&content))
}

/// Scan up to 16 MiB of a partition in 512 KiB slabs, regex-extracting
/// `ro.product.*`/`ro.build.*`/`ro.miui.*` key=value lines when no
/// recognized filesystem is found.
pub fn brute_force_scan(blob: &[u8]) -> PropertyMap {
    const SLAB: usize = 512 * 1024;
    const MAX_SCAN: usize = 16 * 1024 * 1024;

    let re = Regex::new(r"(?-u)(ro\.(?:product|build|miui)\.[A-Za-z0-9_.]*)=([^\r\n\x00]*)").unwrap();
    let mut map = IndexMap::new();

    let limit = blob.len().min(MAX_SCAN);
    for slab_start in (0..limit).step_by(SLAB) {
        let slab_end = (slab_start + SLAB).min(limit);
        for cap in re.captures_iter(&blob[slab_start..slab_end]) {
            let key = String::from_utf8_lossy(&cap[1]).into_owned();
            let value = String::from_utf8_lossy(&cap[2]).into_owned();
            map.entry(key).or_insert(value);
        }
    }
    map
}

/// Identify `blob`'s filesystem and, for recognized types, walk it to
/// `build.prop`, falling back to a brute-force regex scan otherwise.
pub fn locate_build_prop(blob: &[u8]) -> PropertyMap {
    let head_len = blob.len().min(4096);
    match identify(&blob[..head_len]) {
        FsKind::Ext4 => ext4::parse_superblock(blob)
            .and(traverse_ext4(blob).ok())
            .unwrap_or_else(|| brute_force_scan(blob)),
        FsKind::Erofs => traverse_erofs(blob).unwrap_or_else(|_| brute_force_scan(blob)),
        FsKind::Signed(offset) => {
            let rest = &blob[offset as usize..];
            match identify(&rest[..rest.len().min(4096)]) {
                FsKind::Ext4 => traverse_ext4(rest).unwrap_or_else(|_| brute_force_scan(blob)),
                FsKind::Erofs => traverse_erofs(rest).unwrap_or_else(|_| brute_force_scan(blob)),
                _ => brute_force_scan(blob),
            }
        }
        _ => brute_force_scan(blob),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_ext4_magic() {
        let mut head = vec![0u8; 4096];
        head[EXT4_MAGIC_OFFSET..EXT4_MAGIC_OFFSET + 2].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        assert_eq!(identify(&head), FsKind::Ext4);
    }

    #[test]
    fn identify_erofs_magic() {
        let mut head = vec![0u8; 4096];
        head[1024..1028].copy_from_slice(&EROFS_MAGIC.to_le_bytes());
        assert_eq!(identify(&head), FsKind::Erofs);
    }

    #[test]
    fn identify_squashfs_and_android_boot() {
        let mut head = vec![0u8; 4096];
        head[0..4].copy_from_slice(b"hsqs");
        assert_eq!(identify(&head), FsKind::SquashFs);

        let mut head2 = vec![0u8; 4096];
        head2[0..8].copy_from_slice(b"ANDROID!");
        assert_eq!(identify(&head2), FsKind::AndroidBoot);
    }

    #[test]
    fn brute_force_extracts_known_keys() {
        let blob = b"garbage\x00ro.product.model=Pixel\nro.build.type=user\nro.miui.ui.version.name=V14\n".to_vec();
        let map = brute_force_scan(&blob);
        assert_eq!(map.get("ro.product.model").map(String::as_str), Some("Pixel"));
        assert_eq!(map.get("ro.build.type").map(String::as_str), Some("user"));
        assert_eq!(map.get("ro.miui.ui.version.name").map(String::as_str), Some("V14"));
    }

    #[test]
    fn parse_props_tolerates_embedded_nul_and_comments() {
        let data = b"# comment\nro.a=1\x00ro.b=2\n\nro.c = 3 \n".to_vec();
        let map = parse_props(&data);
        assert_eq!(map.get("ro.a").map(String::as_str), Some("1"));
        assert_eq!(map.get("ro.b").map(String::as_str), Some("2"));
        assert_eq!(map.get("ro.c").map(String::as_str), Some("3"));
    }
}
