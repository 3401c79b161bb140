// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Turn a firmware directory plus LP metadata into an ordered flash-task
//! list.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::{fs, io};

use indexmap::IndexMap;
use thiserror::Error;

use crate::lp::{LpError, LpMetadata};
use crate::sparse::{SparseError, SparseImage};

#[derive(Debug, Error)]
pub enum OplusError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed LP metadata: {0}")]
    Lp(#[from] LpError),
    #[error("malformed sparse image: {0}")]
    Sparse(#[from] SparseError),
    #[error("malformed super_def.json: {0}")]
    MalformedSuperDef(String),
    #[error("no super_meta[.NV_ID].raw found under {0}")]
    SuperMetaNotFound(PathBuf),
}

/// One (partition, source file, destination, size) flash step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashTask {
    pub partition_name: String,
    pub file_path: PathBuf,
    pub absolute_sector: u64,
    pub byte_size: u64,
}

/// Find `IMAGES/super_meta[.NV_ID].raw`, preferring the NV-ID-suffixed
/// variant when `nv_id` is given.
pub fn locate_super_meta(firmware_root: &Path, nv_id: Option<&str>) -> Result<PathBuf, OplusError> {
    let images_dir = firmware_root.join("IMAGES");
    if let Some(nv) = nv_id {
        let candidate = images_dir.join(format!("super_meta.{nv}.raw"));
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    let candidate = images_dir.join("super_meta.raw");
    if candidate.exists() {
        return Ok(candidate);
    }
    Err(OplusError::SuperMetaNotFound(images_dir))
}

/// Load the optional `META/super_def[.NV_ID].json` logical-name-to-file map.
pub fn load_super_def(
    firmware_root: &Path,
    nv_id: Option<&str>,
) -> Result<Option<IndexMap<String, String>>, OplusError> {
    let meta_dir = firmware_root.join("META");
    let mut candidates = Vec::new();
    if let Some(nv) = nv_id {
        candidates.push(meta_dir.join(format!("super_def.{nv}.json")));
    }
    candidates.push(meta_dir.join("super_def.json"));

    for candidate in candidates {
        if candidate.exists() {
            let text = fs::read_to_string(&candidate)?;
            let map: IndexMap<String, String> =
                serde_json::from_str(&text).map_err(|e| OplusError::MalformedSuperDef(e.to_string()))?;
            return Ok(Some(map));
        }
    }
    Ok(None)
}

/// Drop a trailing `_a`/`_b` slot suffix.
fn strip_slot_suffix(name: &str) -> &str {
    name.strip_suffix("_a").or_else(|| name.strip_suffix("_b")).unwrap_or(name)
}

/// `true` for slot-less partitions, or for `{name}_{slot}` ones.
fn matches_active_slot(name: &str, active_slot: &str) -> bool {
    if name.ends_with("_a") || name.ends_with("_b") {
        name.ends_with(&format!("_{active_slot}"))
    } else {
        true
    }
}

/// Resolve a logical volume to a file on disk: map lookup, NV-suffixed
/// filename, base-name with the slot suffix stripped, then glob.
fn resolve_image_file(
    images_dir: &Path,
    firmware_root: &Path,
    super_def: Option<&IndexMap<String, String>>,
    logical_name: &str,
    nv_id: Option<&str>,
) -> Option<PathBuf> {
    if let Some(def) = super_def {
        if let Some(rel) = def.get(logical_name) {
            let candidate = firmware_root.join(rel);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    if let Some(nv) = nv_id {
        let candidate = images_dir.join(format!("{logical_name}.{nv}.img"));
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let base = strip_slot_suffix(logical_name);
    let candidate = images_dir.join(format!("{base}.img"));
    if candidate.exists() {
        return Some(candidate);
    }

    let pattern = images_dir.join(format!("{logical_name}*.img"));
    glob::glob(&pattern.to_string_lossy()).ok()?.find_map(Result::ok)
}

/// The image's real data size: expanded length for a Sparse image, raw
/// file length otherwise.
fn sparse_aware_size<R: Read + Seek>(reader: &mut R, raw_len: u64) -> Result<u64, OplusError> {
    let mut head = [0u8; 4];
    reader.seek(SeekFrom::Start(0))?;
    let n = reader.read(&mut head)?;
    if n == 4 && SparseImage::probe(&head) {
        reader.seek(SeekFrom::Start(0))?;
        let image = SparseImage::parse(reader)?;
        Ok(image.expanded_len())
    } else {
        Ok(raw_len)
    }
}

fn image_byte_size(path: &Path) -> Result<u64, OplusError> {
    let mut file = fs::File::open(path)?;
    let raw_len = file.metadata()?.len();
    sparse_aware_size(&mut file, raw_len)
}

/// Build the full flash-task list: the two prepended LP-metadata writes,
/// then one task per LINEAR, active-slot-matching logical volume whose
/// image file can be resolved.
pub fn plan(
    firmware_root: &Path,
    lp: &LpMetadata,
    active_slot: &str,
    nv_id: Option<&str>,
    super_start_sector: u64,
    device_sector_size: u64,
) -> Result<Vec<FlashTask>, OplusError> {
    let images_dir = firmware_root.join("IMAGES");
    let super_meta_path = locate_super_meta(firmware_root, nv_id)?;
    let super_meta_size = fs::metadata(&super_meta_path)?.len();
    let super_def = load_super_def(firmware_root, nv_id)?;

    let mut tasks = vec![
        FlashTask {
            partition_name: "super_metadata_primary".to_string(),
            file_path: super_meta_path.clone(),
            absolute_sector: super_start_sector + 1,
            byte_size: super_meta_size,
        },
        FlashTask {
            partition_name: "super_metadata_backup".to_string(),
            file_path: super_meta_path,
            absolute_sector: super_start_sector + 2,
            byte_size: super_meta_size,
        },
    ];

    for partition in &lp.partitions {
        if partition.extents.is_empty() || !matches_active_slot(&partition.name, active_slot) {
            continue;
        }
        let Some(extent) = partition.resolve(super_start_sector, device_sector_size).into_iter().next() else {
            continue;
        };
        let Some(file_path) =
            resolve_image_file(&images_dir, firmware_root, super_def.as_ref(), &partition.name, nv_id)
        else {
            continue;
        };
        let byte_size = image_byte_size(&file_path)?;
        tasks.push(FlashTask {
            partition_name: partition.name.clone(),
            file_path,
            absolute_sector: extent.absolute_sector,
            byte_size,
        });
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn strip_slot_suffix_only_touches_known_suffixes() {
        assert_eq!(strip_slot_suffix("system_a"), "system");
        assert_eq!(strip_slot_suffix("system_b"), "system");
        assert_eq!(strip_slot_suffix("modem"), "modem");
    }

    #[test]
    fn matches_active_slot_filters_ab_partitions_only() {
        assert!(matches_active_slot("system_a", "a"));
        assert!(!matches_active_slot("system_b", "a"));
        assert!(matches_active_slot("modem", "a")); // slot-less always matches
    }

    #[test]
    fn non_sparse_blob_reports_raw_length() {
        let mut data = Cursor::new(vec![0u8; 4096]);
        assert_eq!(sparse_aware_size(&mut data, 4096).unwrap(), 4096);
    }

    #[test]
    fn plan_prepends_two_lp_metadata_tasks_at_super_start_plus_one_and_two() {
        let dir = std::env::temp_dir().join("qdl_oplus_test_fixture");
        let images_dir = dir.join("IMAGES");
        fs::create_dir_all(&images_dir).unwrap();
        let meta_path = images_dir.join("super_meta.raw");
        fs::write(&meta_path, vec![0u8; 64]).unwrap();

        let lp = LpMetadata {
            header_magic: crate::lp::LP_HEADER_MAGIC_STANDARD,
            partitions: vec![],
        };
        let tasks = plan(&dir, &lp, "a", None, 1000, 4096).unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].absolute_sector, 1001);
        assert_eq!(tasks[1].absolute_sector, 1002);
        assert_eq!(tasks[0].byte_size, 64);

        fs::remove_dir_all(&dir).ok();
    }
}
