// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use anyhow::{Result, bail};
use gptman::{self, GPT, GPTHeader, GPTPartitionEntry};
use owo_colors::OwoColorize;
use std::io::{Cursor, Error, ErrorKind, Read, Seek, Write};

use qdl::{self, firehose_read_storage, lp::LpMetadata, types::QdlChan};

/// Large enough to cover every candidate LP metadata header offset (up to
/// 16384) plus the header itself and its table tails.
const LP_PROBE_BYTES: usize = 64 * 1024;

pub fn read_gpt_from_storage<T: Read + Write + QdlChan>(
    channel: &mut T,
    slot: u8,
    phys_part_idx: u8,
) -> Result<GPT> {
    let mut buf = Cursor::new(Vec::<u8>::new());

    // First, probe sector 1 to retrieve the GPT size
    // Note, sector 0 contains a fake MBR as per the GPT spec ("Protective MBR")
    firehose_read_storage(channel, &mut buf, 1, slot, phys_part_idx, 1)?;

    buf.rewind()?;
    let header = match GPTHeader::read_from(&mut buf) {
        Ok(h) => h,
        Err(e) => bail!("Couldn't parse the GPT header: {}", e),
    };

    // The entire primary GPT is located between sectors 0 and first_usable_lba
    let gpt_len = header.first_usable_lba as usize;

    // Then, read the entire GPT and parse it
    buf.rewind()?;
    firehose_read_storage(channel, &mut buf, gpt_len, slot, phys_part_idx, 0)?;

    // Ignore the aforementioned MBR sector
    buf.set_position(channel.fh_config().storage_sector_size as u64);
    GPT::read_from(&mut buf, channel.fh_config().storage_sector_size as u64).map_err(|e| e.into())
}

pub fn find_part<T: Read + Write + QdlChan>(
    channel: &mut T,
    name: &str,
    slot: u8,
    phys_part_idx: u8,
) -> Result<GPTPartitionEntry> {
    match read_gpt_from_storage(channel, slot, phys_part_idx)?
        .iter()
        .find(|(_, p)| p.partition_name.to_string() == name)
    {
        Some(p) => Ok(p.1.clone()),
        None => Err(Error::from(ErrorKind::NotFound).into()),
    }
}

pub fn print_partition_table<T: Read + Write + QdlChan>(
    channel: &mut T,
    slot: u8,
    phys_part_idx: u8,
) -> Result<()> {
    let gpt = read_gpt_from_storage(channel, slot, phys_part_idx)?;

    println!(
        "GPT on physical partition {} of {}:",
        phys_part_idx.bright_yellow(),
        channel.fh_config().storage_type.to_string().bright_yellow()
    );
    for (idx, part) in gpt.iter() {
        println!(
            "{}] {}: start_sector = {}, {} bytes ({} kiB)",
            idx,
            part.partition_name.as_str(),
            part.starting_lba,
            part.size().unwrap() * gpt.sector_size,
            part.size().unwrap() * gpt.sector_size / 1024,
        );
    }

    Ok(())
}

pub fn read_storage_logical_partition<T: Read + Write + QdlChan>(
    channel: &mut T,
    out: &mut impl Write,
    name: &str,
    slot: u8,
    phys_part_idx: u8,
) -> Result<()> {
    let gpt = read_gpt_from_storage(channel, slot, phys_part_idx)?;

    let part = gpt
        .iter()
        .find(|(_, p)| p.partition_name.as_str() == name)
        .ok_or(Error::from(ErrorKind::NotFound))?
        .1;

    firehose_read_storage(
        channel,
        out,
        (part.ending_lba - part.starting_lba + 1) as usize,
        slot,
        phys_part_idx,
        part.starting_lba as u32,
    )
}

/// Parse the raw GPT codec's `GptTable` off the wire, the same way
/// `read_gpt_from_storage` pulls the `gptman::GPT` view, for callers that
/// want A/B aggregation or XML emission instead of a `gptman` cursor.
pub fn read_gpt_table_from_storage<T: Read + Write + QdlChan>(
    channel: &mut T,
    slot: u8,
    phys_part_idx: u8,
) -> Result<qdl::gpt::GptTable> {
    let mut buf = Cursor::new(Vec::<u8>::new());
    firehose_read_storage(channel, &mut buf, 1, slot, phys_part_idx, 1)?;

    buf.rewind()?;
    let header = match GPTHeader::read_from(&mut buf) {
        Ok(h) => h,
        Err(e) => bail!("Couldn't parse the GPT header: {}", e),
    };
    let gpt_len = header.first_usable_lba as usize;

    buf.rewind()?;
    firehose_read_storage(channel, &mut buf, gpt_len, slot, phys_part_idx, 0)?;

    buf.rewind()?;
    Ok(qdl::gpt::parse(&mut buf, phys_part_idx)?)
}

/// Find `super`'s start sector and pull back enough of its head to cover
/// every LP metadata candidate offset.
pub fn read_lp_metadata_from_storage<T: Read + Write + QdlChan>(
    channel: &mut T,
    slot: u8,
    phys_part_idx: u8,
) -> Result<(LpMetadata, u64)> {
    let part = find_part(channel, "super", slot, phys_part_idx)?;
    let sector_size = channel.fh_config().storage_sector_size;
    let probe_sectors = LP_PROBE_BYTES.div_ceil(sector_size.max(1));

    let mut buf = Cursor::new(Vec::<u8>::new());
    firehose_read_storage(
        channel,
        &mut buf,
        probe_sectors,
        slot,
        phys_part_idx,
        part.starting_lba as u32,
    )?;

    let metadata = LpMetadata::locate_and_parse(buf.get_ref())
        .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;
    Ok((metadata, part.starting_lba))
}

/// Resolve a logical volume's first LINEAR extent inside `super` and pull
/// that span off the wire.
pub fn read_logical_partition_bytes<T: Read + Write + QdlChan>(
    channel: &mut T,
    slot: u8,
    phys_part_idx: u8,
    lp: &LpMetadata,
    super_start_sector: u64,
    name: &str,
) -> Option<Vec<u8>> {
    let partition = lp.find(name)?;
    let sector_size = channel.fh_config().storage_sector_size as u64;
    let extent = partition
        .resolve(super_start_sector, sector_size)
        .into_iter()
        .next()?;

    let mut buf = Cursor::new(Vec::<u8>::new());
    firehose_read_storage(
        channel,
        &mut buf,
        extent.num_sectors as usize,
        slot,
        phys_part_idx,
        extent.absolute_sector as u32,
    )
    .ok()?;
    Some(buf.into_inner())
}
