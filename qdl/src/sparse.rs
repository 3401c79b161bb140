// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Android Sparse image codec.
//!
//! Parsing never loads RAW payload into memory; only the chunk index (tag,
//! block count, byte offset/length of payload in the underlying stream) is
//! kept. Expansion is a lazy, read-only operation over that index.

use std::io::{Read, Seek, SeekFrom, Write};

use thiserror::Error;

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26FF3A;
pub const SPARSE_HEADER_SIZE: u16 = 28;
pub const CHUNK_HEADER_SIZE: u16 = 12;

#[derive(Debug, Error)]
pub enum SparseError {
    #[error("I/O error reading sparse image: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a sparse image (bad magic)")]
    BadMagic,
    #[error("malformed sparse image: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTag {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl ChunkTag {
    fn from_u16(v: u16) -> Option<ChunkTag> {
        match v {
            0xCAC1 => Some(ChunkTag::Raw),
            0xCAC2 => Some(ChunkTag::Fill),
            0xCAC3 => Some(ChunkTag::DontCare),
            0xCAC4 => Some(ChunkTag::Crc32),
            _ => None,
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            ChunkTag::Raw => 0xCAC1,
            ChunkTag::Fill => 0xCAC2,
            ChunkTag::DontCare => 0xCAC3,
            ChunkTag::Crc32 => 0xCAC4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_size: u16,
    pub chunk_hdr_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub checksum: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ChunkRecord {
    pub tag: ChunkTag,
    pub chunk_blocks: u32,
    /// Expanded (post-inflation) byte offset of this chunk's start.
    pub expanded_offset: u64,
    /// Byte offset of the raw payload within the source stream (RAW only).
    pub payload_offset: u64,
    pub payload_len: u64,
    /// The 4-byte fill word, pre-read for FILL chunks.
    pub fill_word: Option<[u8; 4]>,
}

#[derive(Debug, Clone)]
pub struct SparseImage {
    pub header: SparseHeader,
    pub(crate) chunks: Vec<ChunkRecord>,
}

impl SparseImage {
    /// Test the first 4 bytes against the sparse magic.
    pub fn probe(first_four: &[u8]) -> bool {
        first_four.len() >= 4 && u32::from_le_bytes(first_four[0..4].try_into().unwrap()) == SPARSE_HEADER_MAGIC
    }

    pub fn expanded_len(&self) -> u64 {
        self.header.total_blocks as u64 * self.header.block_size as u64
    }

    /// Parse the fixed header and walk the chunk index, advancing past
    /// payload bytes without reading them.
    pub fn parse<R: Read + Seek>(reader: &mut R) -> Result<SparseImage, SparseError> {
        let mut hdr_buf = [0u8; SPARSE_HEADER_SIZE as usize];
        reader.read_exact(&mut hdr_buf)?;

        let magic = u32::from_le_bytes(hdr_buf[0..4].try_into().unwrap());
        if magic != SPARSE_HEADER_MAGIC {
            return Err(SparseError::BadMagic);
        }

        let header = SparseHeader {
            major_version: u16::from_le_bytes(hdr_buf[4..6].try_into().unwrap()),
            minor_version: u16::from_le_bytes(hdr_buf[6..8].try_into().unwrap()),
            file_hdr_size: u16::from_le_bytes(hdr_buf[8..10].try_into().unwrap()),
            chunk_hdr_size: u16::from_le_bytes(hdr_buf[10..12].try_into().unwrap()),
            block_size: u32::from_le_bytes(hdr_buf[12..16].try_into().unwrap()),
            total_blocks: u32::from_le_bytes(hdr_buf[16..20].try_into().unwrap()),
            total_chunks: u32::from_le_bytes(hdr_buf[20..24].try_into().unwrap()),
            checksum: u32::from_le_bytes(hdr_buf[24..28].try_into().unwrap()),
        };

        // Skip any vendor-extended header bytes before the first chunk.
        if header.file_hdr_size as u64 > SPARSE_HEADER_SIZE as u64 {
            reader.seek(SeekFrom::Current(
                header.file_hdr_size as i64 - SPARSE_HEADER_SIZE as i64,
            ))?;
        }

        let mut chunks = Vec::with_capacity(header.total_chunks as usize);
        let mut expanded_offset = 0u64;
        let mut seen_blocks = 0u64;

        for _ in 0..header.total_chunks {
            let mut chdr = [0u8; CHUNK_HEADER_SIZE as usize];
            reader.read_exact(&mut chdr)?;

            let raw_tag = u16::from_le_bytes(chdr[0..2].try_into().unwrap());
            let tag = ChunkTag::from_u16(raw_tag)
                .ok_or_else(|| SparseError::Malformed(format!("unknown chunk tag 0x{raw_tag:x}")))?;
            let chunk_blocks = u32::from_le_bytes(chdr[4..8].try_into().unwrap());
            let total_size = u32::from_le_bytes(chdr[8..12].try_into().unwrap());

            let payload_len = total_size as u64 - CHUNK_HEADER_SIZE as u64;
            let payload_offset = reader.stream_position()?;

            let fill_word = if tag == ChunkTag::Fill {
                let mut w = [0u8; 4];
                reader.read_exact(&mut w)?;
                Some(w)
            } else {
                if payload_len > 0 {
                    reader.seek(SeekFrom::Current(payload_len as i64))?;
                }
                None
            };

            chunks.push(ChunkRecord {
                tag,
                chunk_blocks,
                expanded_offset,
                payload_offset,
                payload_len,
                fill_word,
            });

            expanded_offset += chunk_blocks as u64 * header.block_size as u64;
            seen_blocks += chunk_blocks as u64;
        }

        if seen_blocks != header.total_blocks as u64 {
            return Err(SparseError::Malformed(format!(
                "chunk blocks sum to {seen_blocks}, header declares {}",
                header.total_blocks
            )));
        }

        Ok(SparseImage { header, chunks })
    }

    fn chunk_at(&self, pos: u64) -> Option<&ChunkRecord> {
        // Chunks are emitted in expanded order, so a prefix-sum scan suffices.
        self.chunks.iter().find(|c| {
            let len = c.chunk_blocks as u64 * self.header.block_size as u64;
            pos >= c.expanded_offset && pos < c.expanded_offset + len
        })
    }

    /// Fill `buf` starting at expanded position `pos`, materializing RAW from
    /// `reader`, replicating FILL's 4-byte word, and zero-filling DONT_CARE
    /// and CRC32.
    pub fn read_at<R: Read + Seek>(
        &self,
        reader: &mut R,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize, SparseError> {
        if pos >= self.expanded_len() {
            return Ok(0);
        }
        let Some(chunk) = self.chunk_at(pos) else {
            return Ok(0);
        };
        let chunk_len = chunk.chunk_blocks as u64 * self.header.block_size as u64;
        let within = pos - chunk.expanded_offset;
        let n = buf.len().min((chunk_len - within) as usize);

        match chunk.tag {
            ChunkTag::Raw => {
                reader.seek(SeekFrom::Start(chunk.payload_offset + within))?;
                reader.read_exact(&mut buf[..n])?;
            }
            ChunkTag::Fill => {
                let word = chunk.fill_word.unwrap();
                for (i, b) in buf[..n].iter_mut().enumerate() {
                    *b = word[(within as usize + i) % 4];
                }
            }
            ChunkTag::DontCare | ChunkTag::Crc32 => {
                buf[..n].fill(0);
            }
        }

        Ok(n)
    }

    /// Expand the whole image to `out`, a contiguous raw byte stream.
    pub fn expand_all<R: Read + Seek, W: Write>(
        &self,
        reader: &mut R,
        out: &mut W,
    ) -> Result<(), SparseError> {
        let mut buf = vec![0u8; self.header.block_size.max(4096) as usize];
        let mut pos = 0u64;
        let total = self.expanded_len();
        while pos < total {
            let n = self.read_at(reader, pos, &mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            pos += n as u64;
        }
        Ok(())
    }

    /// Ordered (expanded_offset, byte_length) ranges covering RAW+FILL data
    /// only — the sparse writer's "what actually has data" source of truth.
    pub fn data_ranges(&self) -> Vec<(u64, u64)> {
        self.chunks
            .iter()
            .filter(|c| matches!(c.tag, ChunkTag::Raw | ChunkTag::Fill))
            .map(|c| (c.expanded_offset, c.chunk_blocks as u64 * self.header.block_size as u64))
            .collect()
    }

    /// Group chunks into consecutive runs whose serialized size fits
    /// `max_wire_bytes`, each re-emitted as a standalone sparse image with
    /// checksum zeroed.
    pub fn resplit<R: Read + Seek>(
        &self,
        reader: &mut R,
        max_wire_bytes: usize,
    ) -> Result<Vec<Vec<u8>>, SparseError> {
        let mut groups: Vec<Vec<&ChunkRecord>> = vec![];
        let mut current: Vec<&ChunkRecord> = vec![];
        let mut current_size = SPARSE_HEADER_SIZE as usize;

        for chunk in &self.chunks {
            let chunk_wire_size = CHUNK_HEADER_SIZE as usize
                + match chunk.tag {
                    ChunkTag::Raw => chunk.payload_len as usize,
                    ChunkTag::Fill => 4,
                    ChunkTag::DontCare | ChunkTag::Crc32 => 0,
                };

            if !current.is_empty() && current_size + chunk_wire_size > max_wire_bytes {
                groups.push(std::mem::take(&mut current));
                current_size = SPARSE_HEADER_SIZE as usize;
            }
            current.push(chunk);
            current_size += chunk_wire_size;
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let mut out = Vec::with_capacity(groups.len());
        for group in groups {
            out.push(self.serialize_group(reader, &group)?);
        }
        Ok(out)
    }

    fn serialize_group<R: Read + Seek>(
        &self,
        reader: &mut R,
        group: &[&ChunkRecord],
    ) -> Result<Vec<u8>, SparseError> {
        let total_blocks: u32 = group.iter().map(|c| c.chunk_blocks).sum();
        let mut buf = Vec::new();

        buf.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.header.major_version.to_le_bytes());
        buf.extend_from_slice(&self.header.minor_version.to_le_bytes());
        buf.extend_from_slice(&SPARSE_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&CHUNK_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&self.header.block_size.to_le_bytes());
        buf.extend_from_slice(&total_blocks.to_le_bytes());
        buf.extend_from_slice(&(group.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // checksum not recomputed

        for chunk in group {
            let payload_len = match chunk.tag {
                ChunkTag::Raw => chunk.payload_len,
                ChunkTag::Fill => 4,
                ChunkTag::DontCare | ChunkTag::Crc32 => 0,
            };
            let total_size = CHUNK_HEADER_SIZE as u32 + payload_len as u32;

            buf.extend_from_slice(&chunk.tag.to_u16().to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
            buf.extend_from_slice(&chunk.chunk_blocks.to_le_bytes());
            buf.extend_from_slice(&total_size.to_le_bytes());

            match chunk.tag {
                ChunkTag::Raw => {
                    let mut payload = vec![0u8; chunk.payload_len as usize];
                    reader.seek(SeekFrom::Start(chunk.payload_offset))?;
                    reader.read_exact(&mut payload)?;
                    buf.extend_from_slice(&payload);
                }
                ChunkTag::Fill => {
                    buf.extend_from_slice(&chunk.fill_word.unwrap());
                }
                ChunkTag::DontCare | ChunkTag::Crc32 => {}
            }
        }

        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_image_raw_then_dontcare() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&SPARSE_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&CHUNK_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&4096u32.to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes()); // total_blocks
        buf.extend_from_slice(&2u32.to_le_bytes()); // total_chunks
        buf.extend_from_slice(&0u32.to_le_bytes()); // checksum

        // RAW chunk: 2 blocks, 8192 bytes of 0xAB
        buf.extend_from_slice(&0xCAC1u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&(CHUNK_HEADER_SIZE as u32 + 8192).to_le_bytes());
        buf.extend(std::iter::repeat(0xABu8).take(8192));

        // DONT_CARE chunk: 2 blocks
        buf.extend_from_slice(&0xCAC3u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&(CHUNK_HEADER_SIZE as u32).to_le_bytes());

        buf
    }

    #[test]
    fn scenario_raw_then_dont_care() {
        let bytes = build_image_raw_then_dontcare();
        let mut cur = Cursor::new(bytes);
        let img = SparseImage::parse(&mut cur).unwrap();

        assert_eq!(img.expanded_len(), 16384);
        assert_eq!(img.data_ranges(), vec![(0, 8192)]);

        let mut expanded = Vec::new();
        img.expand_all(&mut cur, &mut expanded).unwrap();
        assert_eq!(expanded.len(), 16384);
        assert!(expanded[..8192].iter().all(|&b| b == 0xAB));
        assert!(expanded[8192..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn scenario_fill_chunk_cycles_word() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SPARSE_HEADER_MAGIC.to_le_bytes());
        buf.extend_from_slice(&1u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&SPARSE_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&CHUNK_HEADER_SIZE.to_le_bytes());
        buf.extend_from_slice(&4096u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());

        buf.extend_from_slice(&0xCAC2u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(CHUNK_HEADER_SIZE as u32 + 4).to_le_bytes());
        buf.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());

        let mut cur = Cursor::new(buf);
        let img = SparseImage::parse(&mut cur).unwrap();
        let mut expanded = Vec::new();
        img.expand_all(&mut cur, &mut expanded).unwrap();

        assert_eq!(expanded.len(), 4096);
        for chunk in expanded.chunks(4) {
            assert_eq!(chunk, [0xEF, 0xBE, 0xAD, 0xDE]);
        }
    }

    #[test]
    fn resplit_round_trips_raw_data() {
        let bytes = build_image_raw_then_dontcare();
        let mut cur = Cursor::new(bytes);
        let img = SparseImage::parse(&mut cur).unwrap();

        let groups = img.resplit(&mut cur, 1_000_000).unwrap();
        assert_eq!(groups.len(), 1);

        let mut cur2 = Cursor::new(groups[0].clone());
        let img2 = SparseImage::parse(&mut cur2).unwrap();
        let mut expanded = Vec::new();
        img2.expand_all(&mut cur2, &mut expanded).unwrap();

        let mut expanded_orig = Vec::new();
        img.expand_all(&mut cur, &mut expanded_orig).unwrap();

        assert_eq!(expanded, expanded_orig);
    }

    #[test]
    fn probe_checks_magic() {
        assert!(SparseImage::probe(&SPARSE_HEADER_MAGIC.to_le_bytes()));
        assert!(!SparseImage::probe(&[0, 0, 0, 0]));
    }
}
