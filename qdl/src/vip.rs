// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! VIP (masquerade) strategy list and signed hash-table generation
//! for `qviptblgen`.
//!
//! The masquerade strategy list has no dependency on `sha2` and is used
//! unconditionally by the Firehose engine, so it lives outside the `vip`
//! feature gate; hash-table generation is the part that's actually gated.

/// Strip everything but ASCII alphanumerics and `_`/`-` so a partition name
/// is safe to use verbatim as a filename/label strategy.
fn sanitize_partition_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Build the priority-ordered `(filename, label)` strategy list the
/// Firehose engine walks when talking to a VIP-locked device. `lun` selects which `gpt_backup{lun}.bin`/`gpt_main{lun}.bin`
/// pair the GPT-region strategies target.
pub fn masquerade_strategies(label: &str, is_gpt_region: bool, lun: u8) -> Vec<(String, String)> {
    let mut strategies = Vec::new();

    if is_gpt_region {
        strategies.push((format!("gpt_backup{lun}.bin"), "BackupGPT".to_string()));
        strategies.push((format!("gpt_main{lun}.bin"), "PrimaryGPT".to_string()));
    }

    strategies.push(("gpt_backup0.bin".to_string(), "BackupGPT".to_string()));
    if !label.is_empty() {
        let sanitized = sanitize_partition_name(label);
        strategies.push((sanitized.clone(), sanitized));
    }
    strategies.push(("ssd".to_string(), "ssd".to_string()));
    strategies.push(("gpt_main0.bin".to_string(), String::new()));
    strategies.push(("buffer.bin".to_string(), "buffer".to_string()));
    strategies.push((String::new(), String::new()));

    strategies
}

#[cfg(feature = "vip")]
mod hashtable {
    use anyhow::Result;
    use bincode::serialize;
    use serde::Serialize;
    use sha2::{Digest, Sha256};
    use std::{
        fs::{self, File},
        io::{BufReader, Read, Write},
        path::Path,
    };
    use xmltree::XMLNode;

    use crate::firehose_xml_setup;

pub fn calc_hashes(xml_path: &Path, send_buffer_size: usize) -> Result<Vec<Vec<u8>>> {
    let program_file = fs::read(xml_path)?;
    let xml = xmltree::Element::parse(&program_file[..])?;

    let mut digests: Vec<Vec<u8>> = vec![];
    for node in xml.children.iter() {
        if let XMLNode::Element(e) = node {
            let args: Vec<(&str, &str)> = e
                .attributes
                .as_slice()
                .into_iter()
                .map(|(a, b)| (a.as_str(), b.as_str()))
                .collect();
            let packet = firehose_xml_setup(&e.name.to_ascii_lowercase(), &args)?;

            let hash = Sha256::digest(packet);
            digests.push(hash.to_vec());

            // SAFETY: if the program file exists, it must have a parent dir
            let xml_dir = xml_path.parent().unwrap();
            if let Some(filename) = &e.attributes.get("filename") {
                let file_path = xml_dir.join(filename);

                if filename.is_empty() {
                    continue;
                } else {
                    if !file_path.exists() {
                        println!("WARNING: {filename} doesn't exist - assuming that's intended");
                        continue;
                    }

                    println!("Processing {filename}...");
                }
                let mut buf = vec![0u8; send_buffer_size];
                let mut br = BufReader::new(File::open(file_path)?);
                loop {
                    let n = br.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    digests.push(Sha256::digest(&buf[..n]).to_vec());
                }
            }
        }
    }

    Ok(digests)
}

#[derive(Serialize)]
#[repr(C)]
struct MbnHeaderV3 {
    image_id: u32,
    header_ver_num: u32,
    image_src: u32,
    image_dest_ptr: u32,
    image_size: u32,
    code_size: u32,
    signature_ptr: u32,
    signature_size: u32,
    cert_chain_ptr: u32,
    cert_chain_size: u32,
}

/// The number of hashes in a single table of digests
/// The 54th entry is reserved for hashing the other 53
const MAX_DIGESTS_PER_FILE: usize = 54 - 1;

pub fn gen_hash_tables(
    digests: Vec<Vec<u8>>,
    output_dir: &Path,
    max_table_size: usize,
) -> Result<()> {
    let chained_table_elem_count = max_table_size / Sha256::output_size();
    let mut processed_chained_tables: Vec<Vec<u8>> = vec![];
    let primary_digests: Vec<Vec<u8>>;
    let aux_digests: Vec<Vec<u8>>;

    if digests.len() >= MAX_DIGESTS_PER_FILE {
        primary_digests = digests[..MAX_DIGESTS_PER_FILE].to_vec();
        aux_digests = digests[MAX_DIGESTS_PER_FILE..].to_vec();
    } else {
        primary_digests = digests;
        aux_digests = vec![];
    }

    // The last digest in the table is the hash of the next table
    // Add a - 1 to accomodate for the last entry being the next table's hash
    let chained_tables = aux_digests.chunks(chained_table_elem_count - 1);
    let mut hash: Vec<u8> = vec![];

    // Note this loop starts from the last table
    for tbl in chained_tables.rev() {
        // Add the digests
        let mut entry = tbl.concat();

        // Add the hash of the table that follows (add nothing in the first iteration)
        // TODO: use the explicit init/update/finalize to avoid sad copies
        entry.append(&mut hash);

        processed_chained_tables.push(entry);

        // Hash the current table to include in the next one
        // The variable will contain the hash of the first table at the end of
        // execution (may be an empty vector)
        hash = Sha256::digest(tbl.concat()).to_vec();
    }

    let mbn_table_size = match aux_digests.is_empty() {
        true => size_of_val(&primary_digests),
        false => size_of_val(&primary_digests) + Sha256::output_size(),
    };

    let hdr = MbnHeaderV3 {
        image_id: 26,
        header_ver_num: 3,
        // Offset of the first hash table
        image_src: 40,
        image_dest_ptr: 0,
        image_size: mbn_table_size as u32,
        code_size: mbn_table_size as u32,
        // The file will be signed externally, leave signature fields empty
        signature_ptr: 0,
        signature_size: 0,
        cert_chain_ptr: 0,
        cert_chain_size: 0,
    };

    if !output_dir.exists() {
        std::fs::create_dir(output_dir)?;
    }

    let mut mbn = File::create(output_dir.join("signme.mbn"))?;
    mbn.write_all(&serialize(&hdr)?)?;
    mbn.write_all(&primary_digests.concat())?;
    if let Some(hash) = processed_chained_tables.last() {
        mbn.write_all(hash)?;

        let mut aux_tbl_file = File::create(output_dir.join("tables.bin"))?;
        aux_tbl_file.write_all(&aux_digests.concat())?;
    }

    Ok(())
}
}

#[cfg(feature = "vip")]
pub use hashtable::{calc_hashes, gen_hash_tables};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpt_region_prepends_lun_specific_backup_then_main() {
        let s = masquerade_strategies("boot_a", true, 3);
        assert_eq!(s[0], ("gpt_backup3.bin".to_string(), "BackupGPT".to_string()));
        assert_eq!(s[1], ("gpt_main3.bin".to_string(), "PrimaryGPT".to_string()));
    }

    #[test]
    fn non_gpt_region_skips_lun_specific_strategies_but_keeps_generic() {
        let s = masquerade_strategies("boot_a", false, 3);
        assert!(!s.iter().any(|(f, _)| f == "gpt_backup3.bin"));
        assert_eq!(s[0], ("gpt_backup0.bin".to_string(), "BackupGPT".to_string()));
    }

    #[test]
    fn sanitized_label_strategy_present_and_last_resort_is_labelless() {
        let s = masquerade_strategies("my/weird part", false, 0);
        assert!(s.iter().any(|(f, l)| f == "my_weird_part" && l == "my_weird_part"));
        assert_eq!(s.last(), Some(&(String::new(), String::new())));
    }

    #[test]
    fn empty_label_adds_no_extra_strategy() {
        let with_label = masquerade_strategies("boot_a", false, 0).len();
        let without_label = masquerade_strategies("", false, 0).len();
        assert_eq!(with_label, without_label + 1);
    }
}
