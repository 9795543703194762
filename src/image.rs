//! Utilities for working with kernel images loaded out of a volume.
//!
//! A volume is read in whole LEBs, so the buffer usually holds more than the image itself. This
//! determines the image's real size (and where it wants to run) from its header.

use std::mem::size_of;

use crc::{Crc, CRC_32_ISO_HDLC};
const UIMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const UIMAGE_MAGIC: u32 = 0x27051956;
const UIMAGE_HEADER_SIZE: usize = 64;

const UIMAGE_POS_MAGIC: usize = 0;
const UIMAGE_POS_HCRC: usize = 4;
const UIMAGE_POS_SIZE: usize = 12;
const UIMAGE_POS_LOAD: usize = 16;
const UIMAGE_POS_ENTRY: usize = 20;
const UIMAGE_POS_COMP: usize = 31;
const UIMAGE_POS_NAME: usize = 32;
const UIMAGE_NAME_LEN: usize = 32;

/// ARM zImages carry their magic (and extent) in native, i.e. little-endian, order
const ZIMAGE_MAGIC: u32 = 0x016F2818;
const ZIMAGE_POS_MAGIC: usize = 36;
const ZIMAGE_POS_START: usize = 40;
const ZIMAGE_POS_END: usize = 44;
const ZIMAGE_HEADER_SIZE: usize = 48;

/// A kernel image recognized at the start of a buffer
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum KernelImage {
    /// A legacy U-Boot image: a 64-byte header, then the payload
    UImage {
        /// Header plus payload
        size: u32,
        load: u32,
        entry: u32,

        /// The compression type; 0 means uncompressed
        comp: u8,
        name: String,
    },

    /// A self-decompressing ARM zImage
    ZImage {
        size: u32,

        /// Offset of the entry point from the start of the image
        start: u32,
    },
}

fn be32(bytes: &[u8], pos: usize) -> u32 {
    let mut word = [0u8; size_of::<u32>()];
    word.copy_from_slice(&bytes[pos..][..size_of::<u32>()]);
    u32::from_be_bytes(word)
}

fn le32(bytes: &[u8], pos: usize) -> u32 {
    let mut word = [0u8; size_of::<u32>()];
    word.copy_from_slice(&bytes[pos..][..size_of::<u32>()]);
    u32::from_le_bytes(word)
}

impl KernelImage {
    /// Identify the kernel image at the start of `bytes`.
    pub fn detect(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() >= UIMAGE_HEADER_SIZE && be32(bytes, UIMAGE_POS_MAGIC) == UIMAGE_MAGIC {
            return Self::parse_uimage(&bytes[..UIMAGE_HEADER_SIZE]);
        }

        if bytes.len() >= ZIMAGE_HEADER_SIZE && le32(bytes, ZIMAGE_POS_MAGIC) == ZIMAGE_MAGIC {
            let start = le32(bytes, ZIMAGE_POS_START);
            let end = le32(bytes, ZIMAGE_POS_END);
            let size = end
                .checked_sub(start)
                .ok_or(anyhow::anyhow!("zImage ends ({end:#x}) before it starts ({start:#x})"))?;
            return Ok(Self::ZImage { size, start });
        }

        anyhow::bail!("Unknown kernel image format")
    }

    fn parse_uimage(header: &[u8]) -> anyhow::Result<Self> {
        let mut header: [u8; UIMAGE_HEADER_SIZE] = header.try_into()?;

        let hcrc = be32(&header, UIMAGE_POS_HCRC);
        header[UIMAGE_POS_HCRC..][..size_of::<u32>()].fill(0u8);
        anyhow::ensure!(
            hcrc == UIMAGE_CRC.checksum(&header),
            "uImage header is corrupt",
        );

        let size = be32(&header, UIMAGE_POS_SIZE)
            .checked_add(UIMAGE_HEADER_SIZE as u32)
            .ok_or(anyhow::anyhow!("Overflow in computing uImage size"))?;

        let name = &header[UIMAGE_POS_NAME..][..UIMAGE_NAME_LEN];
        let name_len = name.iter().position(|&x| x == 0).unwrap_or(UIMAGE_NAME_LEN);

        Ok(Self::UImage {
            size,
            load: be32(&header, UIMAGE_POS_LOAD),
            entry: be32(&header, UIMAGE_POS_ENTRY),
            comp: header[UIMAGE_POS_COMP],
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
        })
    }

    /// The number of bytes the image occupies, from the start of its header
    pub fn size(&self) -> usize {
        match self {
            Self::UImage { size, .. } | Self::ZImage { size, .. } => *size as usize,
        }
    }

    /// Can this be started without first decompressing it?
    pub fn is_bootable(&self) -> bool {
        match self {
            Self::UImage { comp, .. } => *comp == 0,
            Self::ZImage { .. } => true,
        }
    }
}
