// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
//! `qdl`: Sahara+Firehose protocol engine for flashing Qualcomm EDL-mode
//! devices, plus the on-wire artifact codecs (Sparse, GPT, LP metadata,
//! EROFS/EXT4 property extraction) the flasher needs to decide what to
//! write where.
//!
//! The crate root re-exports the Firehose entry points so callers write
//! `qdl::firehose_configure(...)` directly, while the codecs and chip-probe
//! machinery live in their own modules.

pub mod deviceinfo;
pub mod firehose;
pub mod fsprobe;
pub mod gpt;
pub mod lp;
pub mod oplus;
pub mod parsers;
pub mod sahara;
pub mod sparse;
pub mod types;
pub mod vip;
pub mod watchdog;

#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "usb")]
pub mod usb;

pub use firehose::{
    ChunkProgress, firehose_checksum_storage, firehose_configure, firehose_erase,
    firehose_get_default_sector_size, firehose_nop, firehose_patch, firehose_peek,
    firehose_program_sparse, firehose_program_storage, firehose_program_storage_chunked,
    firehose_read, firehose_read_storage, firehose_read_storage_chunked, firehose_reset,
    firehose_set_active_slot, firehose_set_bootable, firehose_ufs_provision, firehose_xml_setup,
};
pub use types::{
    FirehoseError, FirehoseResetMode, FirehoseStatus, FirehoseStorageType, NakError, QdlChan,
    QdlReadWrite,
};

use types::QdlBackend;

/// Open a transport behind the selected backend. `serial_no` selects a USB
/// device by serial number when more than one is attached; `dev_path`
/// selects a serial port.
pub fn setup_target_device(
    backend: QdlBackend,
    serial_no: Option<String>,
    dev_path: Option<String>,
) -> anyhow::Result<Box<dyn QdlReadWrite>> {
    match backend {
        QdlBackend::Serial => {
            #[cfg(feature = "serial")]
            {
                Ok(Box::new(serial::setup_serial_device(dev_path)?))
            }
            #[cfg(not(feature = "serial"))]
            {
                anyhow::bail!("built without the 'serial' feature")
            }
        }
        QdlBackend::Usb => {
            #[cfg(feature = "usb")]
            {
                Ok(Box::new(usb::setup_usb_device(serial_no)?))
            }
            #[cfg(not(feature = "usb"))]
            {
                anyhow::bail!("built without the 'usb' feature")
            }
        }
    }
}
