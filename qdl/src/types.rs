// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::{
    fmt,
    io::{Read, Write},
    str::FromStr,
};

use indexmap::IndexMap;
use thiserror::Error;

/// Transport abstraction implemented by the serial and USB backends.
pub trait QdlReadWrite: Read + Write {}

/// Per-session state every engine function operates on.
pub trait QdlChan {
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QdlBackend {
    #[default]
    Usb,
    Serial,
}

impl FromStr for QdlBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "usb" => Ok(QdlBackend::Usb),
            "serial" => Ok(QdlBackend::Serial),
            other => anyhow::bail!("Unknown backend '{other}', expected usb/serial"),
        }
    }
}

/// Storage kind behind the active Firehose session.
///
/// `Nvme`/`Nand` are accepted on the CLI surface for forward compatibility,
/// but only Ufs/Emmc have a known default sector size and are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirehoseStorageType {
    #[default]
    Ufs,
    Emmc,
    Nvme,
    Nand,
}

impl FromStr for FirehoseStorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ufs" => Ok(FirehoseStorageType::Ufs),
            "emmc" => Ok(FirehoseStorageType::Emmc),
            "nvme" => Ok(FirehoseStorageType::Nvme),
            "nand" => Ok(FirehoseStorageType::Nand),
            other => anyhow::bail!("Unknown storage type '{other}'"),
        }
    }
}

impl fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FirehoseStorageType::Ufs => "UFS",
            FirehoseStorageType::Emmc => "eMMC",
            FirehoseStorageType::Nvme => "NVMe",
            FirehoseStorageType::Nand => "NAND",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseResetMode {
    /// Reboot straight back into EDL
    ResetToEdl,
    /// Normal system reboot
    Reset,
    /// Power the device off
    PowerOff,
}

impl FromStr for FirehoseResetMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "edl" => Ok(FirehoseResetMode::ResetToEdl),
            "system" => Ok(FirehoseResetMode::Reset),
            "off" => Ok(FirehoseResetMode::PowerOff),
            other => anyhow::bail!("Unknown reset mode '{other}', expected edl/off/system"),
        }
    }
}

impl fmt::Display for FirehoseResetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FirehoseResetMode::ResetToEdl => "edl",
            FirehoseResetMode::Reset => "system",
            FirehoseResetMode::PowerOff => "off",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

/// Best-effort classification of a device NAK's `error` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NakError {
    Authentication,
    Signature,
    Hash,
    PartitionNotFound,
    InvalidLun,
    WriteProtect,
    Timeout,
    Busy,
    Configure,
    Generic(String),
}

impl NakError {
    /// Classify a device-provided error string by substring match.
    pub fn classify(error_str: &str) -> NakError {
        let lower = error_str.to_ascii_lowercase();
        if lower.contains("auth") {
            NakError::Authentication
        } else if lower.contains("signat") {
            NakError::Signature
        } else if lower.contains("hash") {
            NakError::Hash
        } else if lower.contains("partition") && lower.contains("not") {
            NakError::PartitionNotFound
        } else if lower.contains("lun") {
            NakError::InvalidLun
        } else if lower.contains("write protect") || lower.contains("write-protect") {
            NakError::WriteProtect
        } else if lower.contains("timeout") || lower.contains("timed out") {
            NakError::Timeout
        } else if lower.contains("busy") {
            NakError::Busy
        } else {
            NakError::Generic(error_str.to_owned())
        }
    }

    /// Returns `(fatal, retryable)` for this classification.
    pub fn flags(&self) -> (bool, bool) {
        match self {
            NakError::Authentication | NakError::Signature | NakError::Hash => (true, false),
            NakError::PartitionNotFound | NakError::InvalidLun => (false, false),
            NakError::WriteProtect => (true, false),
            NakError::Timeout | NakError::Busy => (false, true),
            NakError::Configure => (true, false),
            NakError::Generic(_) => (false, true),
        }
    }
}

#[derive(Debug, Error)]
pub enum FirehoseError {
    #[error("transport error: {0}")]
    TransportIo(#[from] std::io::Error),
    #[error("malformed response: {0:?}")]
    MalformedData(IndexMap<String, String>),
    #[error("device NAK: {0:?}")]
    Nak(NakError),
    #[error("device requires a newer host, min version supported is {device_min_version}")]
    ProtocolVersionIncompatibility { device_min_version: u32 },
    #[error("{0} not found")]
    NotFound(String),
    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

#[derive(Debug, Error)]
pub enum SaharaError {
    #[error("transport error: {0}")]
    TransportIo(#[from] std::io::Error),
    #[error("fatal device error: {0}")]
    Fatal(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("watchdog retry budget exhausted")]
    WatchdogExhausted,
    #[error("operation cancelled")]
    Cancelled,
}

/// Host-side view of the active Firehose session: negotiated sizes plus the
/// caller-selected options.
#[derive(Debug, Clone)]
pub struct FirehoseConfiguration {
    pub hash_packets: bool,
    pub read_back_verify: bool,
    pub storage_type: FirehoseStorageType,
    pub storage_sector_size: usize,
    pub storage_slot: u8,
    pub bypass_storage: bool,
    pub backend: QdlBackend,
    pub skip_firehose_log: bool,
    pub verbose_firehose: bool,

    /// Negotiated by `<configure>`.
    pub xml_buf_size: usize,
    /// Negotiated max payload to target, clamped to [64 KiB, 16 MiB].
    pub send_buffer_size: usize,
    /// Requested payload before negotiation; defaults to 16 MiB.
    pub requested_payload_bytes: usize,

    /// 0 = use the device's negotiated max payload as the chunk unit.
    pub chunk_size_bytes: usize,
    /// Use VIP (masquerade) strategies for locked devices.
    pub use_vip: bool,
    /// Gate for the dangerous, disabled-by-default `<ufs>` provisioning
    /// sequence.
    pub enable_provision: bool,
}

pub const MIN_PAYLOAD_BYTES: usize = 64 * 1024;
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        FirehoseConfiguration {
            hash_packets: false,
            read_back_verify: false,
            storage_type: FirehoseStorageType::default(),
            storage_sector_size: 0,
            storage_slot: 0,
            bypass_storage: false,
            backend: QdlBackend::default(),
            skip_firehose_log: true,
            verbose_firehose: false,
            xml_buf_size: 4096,
            send_buffer_size: MAX_PAYLOAD_BYTES,
            requested_payload_bytes: MAX_PAYLOAD_BYTES,
            chunk_size_bytes: 0,
            use_vip: false,
            enable_provision: false,
        }
    }
}

impl FirehoseConfiguration {
    /// Clamp a negotiated/requested payload size to the legal range.
    pub fn clamp_payload(bytes: usize) -> usize {
        bytes.clamp(MIN_PAYLOAD_BYTES, MAX_PAYLOAD_BYTES)
    }

    /// Floor a requested chunk size to a sector-size multiple and cap it at
    /// the negotiated max payload.
    pub fn effective_chunk_size(&self) -> usize {
        if self.chunk_size_bytes == 0 {
            return self.send_buffer_size;
        }
        let floored = (self.chunk_size_bytes / self.storage_sector_size.max(1))
            * self.storage_sector_size.max(1);
        floored.clamp(self.storage_sector_size.max(1), self.send_buffer_size)
    }
}

/// A full-duplex transport (e.g. serial, USB) plus the session configuration
/// it is driving.
pub struct QdlDevice {
    pub rw: Box<dyn QdlReadWrite>,
    pub fh_cfg: FirehoseConfiguration,
    /// When true, drop() tries to reset the device back to EDL so a panic or
    /// early return doesn't leave it wedged mid-session.
    pub reset_on_drop: bool,
}

impl Read for QdlDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.rw.read(buf)
    }
}

impl Write for QdlDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.rw.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.rw.flush()
    }
}

impl QdlChan for QdlDevice {
    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nak_classification() {
        assert_eq!(
            NakError::classify("Authentication failed"),
            NakError::Authentication
        );
        assert_eq!(NakError::classify("bad signature"), NakError::Signature);
        assert_eq!(
            NakError::classify("partition not found"),
            NakError::PartitionNotFound
        );
        assert_eq!(NakError::classify("foo"), NakError::Generic("foo".into()));
    }

    #[test]
    fn chunk_size_floors_to_sector_multiple() {
        let mut cfg = FirehoseConfiguration {
            storage_sector_size: 4096,
            send_buffer_size: 1024 * 1024,
            chunk_size_bytes: 5000,
            ..Default::default()
        };
        assert_eq!(cfg.effective_chunk_size(), 4096);
        cfg.chunk_size_bytes = 0;
        assert_eq!(cfg.effective_chunk_size(), 1024 * 1024);
    }
}
