// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Build-property assembly across Super's logical volumes.
//!
//! Reading bytes off a partition is a Transport/Firehose concern the caller
//! already owns (via `firehose_read_storage` plus a GPT/LP lookup), so this
//! module stays storage-agnostic the same way `firehose::vip_masquerade_loop`
//! stays transport-agnostic: the caller hands in a `read_partition` closure
//! keyed by partition name and this module only does the probing and merge.

use indexmap::IndexMap;
use regex::Regex;

use crate::fsprobe;

/// The six logical volumes probed for build.prop, scanned in increasing
/// trust order so later hits win ties.
pub const CANDIDATE_VOLUMES: [&str; 6] =
    ["system", "system_ext", "product", "vendor", "odm", "my_manifest"];

/// Physical partitions tried when Super metadata can't be parsed at all.
pub const FALLBACK_PHYSICAL_PARTITIONS: [&str; 5] =
    ["system", "vendor", "my_manifest", "cust", "persist"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub brand: Option<String>,
    pub product: Option<String>,
    pub model: Option<String>,
    pub marketname: Option<String>,
    pub build_type: Option<String>,
    pub build_display_id: Option<String>,
    pub fingerprint: Option<String>,
    pub android_version: Option<String>,
    pub oplus_ota_version: Option<String>,
    pub is_hyperos: bool,
    pub is_zui: bool,
}

/// Read up to six candidate logical volumes (each tried with, then without,
/// the active-slot suffix) and merge their `build.prop` fields by priority.
/// Falls back to physical partitions if none of the candidates yield
/// anything.
pub fn assemble<F>(active_slot: Option<&str>, mut read_partition: F) -> DeviceInfo
where
    F: FnMut(&str) -> Option<Vec<u8>>,
{
    let mut info = DeviceInfo::default();
    let mut any_found = false;

    for base in CANDIDATE_VOLUMES {
        for name in candidate_names(base, active_slot) {
            let Some(blob) = read_partition(&name) else {
                continue;
            };
            let props = fsprobe::locate_build_prop(&blob);
            if props.is_empty() {
                continue;
            }
            any_found = true;
            merge(&mut info, extract_semantic_fields(&props));
        }
    }

    if !any_found {
        for name in FALLBACK_PHYSICAL_PARTITIONS {
            let Some(blob) = read_partition(name) else {
                continue;
            };
            let props = fsprobe::locate_build_prop(&blob);
            if !props.is_empty() {
                merge(&mut info, extract_semantic_fields(&props));
            }
        }
    }

    info
}

fn candidate_names(base: &str, active_slot: Option<&str>) -> Vec<String> {
    match active_slot {
        Some(slot) => vec![format!("{base}_{slot}"), base.to_string()],
        None => vec![base.to_string()],
    }
}

/// "(CC##)" region tag, e.g. `(CN01)`, used to recognize an OPLUS
/// display-id that should win over other OTA-version sources.
fn region_tag_re() -> Regex {
    Regex::new(r"\([A-Z]{2}\d{2}\)").unwrap()
}

fn extract_semantic_fields(props: &IndexMap<String, String>) -> DeviceInfo {
    let mut info = DeviceInfo::default();

    copy_if_present(&mut info.brand, props, "ro.product.brand");
    copy_if_present(&mut info.product, props, "ro.product.name");
    copy_if_present(&mut info.model, props, "ro.product.model");
    copy_if_present(&mut info.build_type, props, "ro.build.type");
    copy_if_present(&mut info.fingerprint, props, "ro.build.fingerprint");
    copy_if_present(&mut info.build_display_id, props, "ro.build.display.id");

    // OPLUS market name outranks the generic brand/product marketname.
    let oplus_market = non_empty(props, "ro.oplus.market.name");
    let generic_market = non_empty(props, "ro.product.marketname");
    if let Some(name) = oplus_market.or(generic_market) {
        info.marketname = Some(name);
    }

    // An OPLUS display-id carrying a region tag overrides other OTA-version
    // sources.
    let region_tag = region_tag_re();
    if let Some(show) = non_empty(props, "ro.build.display.id.show") {
        if region_tag.is_match(&show) {
            info.oplus_ota_version = Some(show);
        }
    }

    // Xiaomi HyperOS carries its own version string prefixed "V" or "OS",
    // from which the Android major version can be back-inferred.
    if let Some(incremental) = non_empty(props, "ro.build.version.incremental") {
        if incremental.starts_with('V') || incremental.starts_with("OS") {
            info.is_hyperos = true;
            info.android_version = infer_android_major_from_hyperos(&incremental)
                .or_else(|| non_empty(props, "ro.build.version.release"));
        }
    }
    if info.android_version.is_none() {
        info.android_version = non_empty(props, "ro.build.version.release");
    }

    if props.values().any(|v| v.contains("ZUI")) {
        info.is_zui = true;
    }

    info
}

/// HyperOS version strings look like `V816.0.4.0.UNCCNXM` (MIUI-derived);
/// the leading two digits of the numeric run map 1:1 to Android SDK major
/// versions starting at Android 13 for HyperOS 1.0.
fn infer_android_major_from_hyperos(incremental: &str) -> Option<String> {
    let digits: String = incremental
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let major_code: u32 = digits.get(..1)?.parse().ok()?;
    match major_code {
        8 => Some("13".to_string()),
        9 => Some("14".to_string()),
        _ => None,
    }
}

fn copy_if_present(target: &mut Option<String>, props: &IndexMap<String, String>, key: &str) {
    if let Some(v) = non_empty(props, key) {
        *target = Some(v);
    }
}

fn non_empty(props: &IndexMap<String, String>, key: &str) -> Option<String> {
    props.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Last-writer-wins; only non-empty source fields overwrite the target.
fn merge(target: &mut DeviceInfo, source: DeviceInfo) {
    macro_rules! overwrite {
        ($field:ident) => {
            if source.$field.is_some() {
                target.$field = source.$field;
            }
        };
    }
    overwrite!(brand);
    overwrite!(product);
    overwrite!(model);
    overwrite!(marketname);
    overwrite!(build_type);
    overwrite!(build_display_id);
    overwrite!(fingerprint);
    overwrite!(android_version);
    overwrite!(oplus_ota_version);
    target.is_hyperos |= source.is_hyperos;
    target.is_zui |= source.is_zui;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_prop_blob(lines: &[(&str, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (k, v) in lines {
            out.extend_from_slice(format!("{k}={v}\n").as_bytes());
        }
        out
    }

    #[test]
    fn tries_slot_suffixed_name_before_bare_name() {
        let info = assemble(Some("a"), |name| match name {
            "system_a" => Some(build_prop_blob(&[("ro.product.brand", "acme")])),
            "system" => Some(build_prop_blob(&[("ro.product.brand", "wrong")])),
            _ => None,
        });
        assert_eq!(info.brand.as_deref(), Some("acme"));
    }

    #[test]
    fn later_scanned_partition_overwrites_earlier_nonempty_fields() {
        let info = assemble(None, |name| match name {
            "system" => Some(build_prop_blob(&[("ro.product.model", "from_system")])),
            "vendor" => Some(build_prop_blob(&[("ro.product.model", "from_vendor")])),
            _ => None,
        });
        assert_eq!(info.model.as_deref(), Some("from_vendor"));
    }

    #[test]
    fn oplus_market_name_outranks_generic_marketname() {
        let props: IndexMap<String, String> = [
            ("ro.oplus.market.name".to_string(), "Find X8".to_string()),
            ("ro.product.marketname".to_string(), "Generic Phone".to_string()),
        ]
        .into_iter()
        .collect();
        let info = extract_semantic_fields(&props);
        assert_eq!(info.marketname.as_deref(), Some("Find X8"));
    }

    #[test]
    fn region_tagged_display_id_becomes_ota_version() {
        let props: IndexMap<String, String> = [(
            "ro.build.display.id.show".to_string(),
            "RMX3850_11_A.15 (CN01)".to_string(),
        )]
        .into_iter()
        .collect();
        let info = extract_semantic_fields(&props);
        assert_eq!(info.oplus_ota_version.as_deref(), Some("RMX3850_11_A.15 (CN01)"));
    }

    #[test]
    fn untagged_display_id_show_is_ignored() {
        let props: IndexMap<String, String> = [(
            "ro.build.display.id.show".to_string(),
            "RMX3850_11_A.15".to_string(),
        )]
        .into_iter()
        .collect();
        let info = extract_semantic_fields(&props);
        assert_eq!(info.oplus_ota_version, None);
    }

    #[test]
    fn falls_back_to_physical_partitions_when_no_candidate_matches() {
        let info = assemble(None, |name| match name {
            "persist" => Some(build_prop_blob(&[("ro.product.model", "fallback")])),
            _ => None,
        });
        assert_eq!(info.model.as_deref(), Some("fallback"));
    }
}
