//! This module contains the code necessary to read EC/VID headers and volume table records, with
//! magic, version, and CRC verification. Encoding is only compiled into tests, which use it to
//! build images.

use super::error::HeaderError;

use crc::{Crc, CRC_32_JAMCRC};
use deku::DekuContainerRead;
#[cfg(test)]
use deku::DekuContainerWrite;
use income::{EcHdr, VidHdr, VtblRecord, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};

pub static UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// On-flash size of an EC header
pub const UBI_EC_HDR_SIZE: usize = 64;
/// On-flash size of a VID header
pub const UBI_VID_HDR_SIZE: usize = 64;
/// On-flash size of one volume table record
pub const UBI_VTBL_RECORD_SIZE: usize = 0xAC;

/// Every header (and vtbl record) ends with a CRC of the bytes before it
const CRC_SIZE: usize = std::mem::size_of::<u32>();

/// Compute the CRC of a header's bytes, excluding the trailing CRC field itself
fn header_crc(bytes: &[u8]) -> u32 {
    UBI_CRC.checksum(&bytes[..bytes.len().saturating_sub(CRC_SIZE)])
}

/// Fill in the trailing CRC field of freshly-serialized header bytes
#[cfg(test)]
fn seal(bytes: &mut [u8]) {
    let crc = header_crc(bytes);
    let len = bytes.len();
    if len >= CRC_SIZE {
        bytes[len - CRC_SIZE..].copy_from_slice(&crc.to_be_bytes());
    }
}

/// Copy serialized bytes to the front of a caller-provided buffer
#[cfg(test)]
fn copy_out(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// A trait missing from the `income` crate: implements parsing UBI headers from byteslices, with
/// magic, version, and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> {
    /// The on-flash size of the header, including its CRC
    const SIZE: usize;

    fn get_magic() -> &'static [u8];
    fn get_hdr_version(&self) -> u8;
    fn get_crc(&self) -> u32;

    /// Whether a non-matching magic just means that nothing was ever written here
    fn is_blank_magic(magic: u32) -> bool {
        magic == 0xFFFF_FFFF
    }

    fn parse(buf: &'a [u8], verify_crc: bool) -> Result<Self, HeaderError> {
        let bytes = buf.get(..Self::SIZE).ok_or(HeaderError::Malformed)?;

        let magic_bytes = &bytes[..Self::get_magic().len()];
        if magic_bytes != Self::get_magic() {
            let found = magic_bytes
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
            return Err(if Self::is_blank_magic(found) {
                HeaderError::Erased
            } else {
                HeaderError::BadMagic { found }
            });
        }

        let (_, header) = Self::from_bytes((bytes, 0)).map_err(|_| HeaderError::Malformed)?;

        if header.get_hdr_version() != UBI_VERSION {
            return Err(HeaderError::BadVersion {
                found: header.get_hdr_version(),
            });
        }

        if verify_crc {
            let stored = header.get_crc();
            let computed = header_crc(bytes);
            if stored != computed {
                return Err(HeaderError::BadCrc { stored, computed });
            }
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    const SIZE: usize = UBI_EC_HDR_SIZE;

    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
}

impl ParseHeader<'_> for VidHdr {
    const SIZE: usize = UBI_VID_HDR_SIZE;

    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }

    // A VID area that was zeroed, rather than erased, is equally unused
    fn is_blank_magic(magic: u32) -> bool {
        magic == 0xFFFF_FFFF || magic == 0
    }
}

/// This represents the specific fields we care about in an EC header
///
/// This is meant to be more ergonomic to work with than EcHdr, which represents the raw data
///
/// Headers can be decoded, but never written, by users of this crate:
///
/// ```compile_fail
/// let mut buf = [0u8; 64];
/// ubi_boot::ubi::Ec::default().encode(&mut buf).unwrap();
/// ```
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    /// Convert from a byte slice
    pub fn decode(bytes: &[u8], verify_crc: bool) -> Result<Self, HeaderError> {
        EcHdr::parse(bytes, verify_crc).map(|x| x.into())
    }

    /// Write into a byte slice
    #[cfg(test)]
    pub(crate) fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let mut bytes = EcHdr::from(self).to_bytes()?;
        seal(&mut bytes);
        copy_out(&bytes, out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

#[cfg(test)]
impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(UBI_EC_HDR_MAGIC);

        Self {
            magic,
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        }
    }
}

/// These represent UBI volume types
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(()),
        }
    }
}

/// This represents the specific fields we care about in a VID header
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    /// The type of volume.
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    /// The ID of the volume, and entry in the volume table.
    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    /// For `Static` volumes and copied LEBs, the number of bytes written at the same time as the
    /// VID header, which are thus included in `data_crc`; otherwise 0.
    pub data_size: u32,

    /// The number of LEBs used by this volume, or 0 if this volume is `Dynamic`
    pub used_ebs: u32,

    /// The number of bytes unused at the end of the PEB, to cut the LEB down to a multiple of the
    /// requested volume alignment size.
    pub data_pad: u32,

    /// The CRC of the first `data_size` bytes of the LEB, or 0 when unused.
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    /// Change the sequence number for this `Vid`
    #[cfg(test)]
    pub(crate) fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    /// Does the LEB's data carry a CRC that can be checked?
    pub fn has_data_crc(&self) -> bool {
        self.vol_type == VolType::Static || self.copy_flag
    }

    /// Convert from a byte slice
    pub fn decode(bytes: &[u8], verify_crc: bool) -> Result<Self, HeaderError> {
        VidHdr::parse(bytes, verify_crc)
            .and_then(|x| x.try_into().map_err(|_| HeaderError::Malformed))
    }

    /// Write into a byte slice
    #[cfg(test)]
    pub(crate) fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let mut bytes = VidHdr::from(self).to_bytes()?;
        seal(&mut bytes);
        copy_out(&bytes, out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = ();

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        let vol_type = vol_type.try_into()?;
        let copy_flag = copy_flag != 0;

        Ok(Self {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

#[cfg(test)]
impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let vol_type = vol_type.into();
        let copy_flag = copy_flag.into();

        let mut magic = [0u8; 4];
        magic.copy_from_slice(UBI_VID_HDR_MAGIC);

        Self {
            magic,
            version: UBI_VERSION,

            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        }
    }
}

/// This represents the specific fields we care about in a volume table record
///
/// ```compile_fail
/// let bytes = ubi_boot::ubi::VolTableRecord::default().into_bytes();
/// ```
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct VolTableRecord {
    /// The total number of PEBs allocated to this volume.
    pub reserved_pebs: u32,

    /// All LEBs in this volume will be a multiple of this size.
    pub alignment: u32,

    /// The number of bytes reserved from the end of each PEB to ensure alignment.
    pub data_pad: u32,

    /// The type of volume.
    pub vol_type: VolType,

    /// Set to `true` during a whole-volume update, so that if interrupted, it's possible to detect
    /// that the volume is corrupt.
    pub upd_marker: bool,

    /// The name of the volume, at most 127 bytes of UTF-8.
    pub name: String,

    /// Any flags set on this volume.
    pub flags: u8,
}

impl VolTableRecord {
    /// Convert from a byte slice
    ///
    /// Empty slots (zeroed records, or ones with no name) decode as `None`, just like damaged
    /// ones.
    pub fn decode(bytes: &[u8], verify_crc: bool) -> Option<Self> {
        let bytes = bytes.get(..UBI_VTBL_RECORD_SIZE)?;
        let (_, vtblrec) = VtblRecord::from_bytes((bytes, 0)).ok()?;
        if verify_crc && vtblrec.crc != header_crc(bytes) {
            return None;
        }
        vtblrec.try_into().ok()
    }

    /// Write into a Vec<u8>
    #[cfg(test)]
    pub(crate) fn into_bytes(self) -> anyhow::Result<Vec<u8>> {
        let mut bytes = VtblRecord::from(self).to_bytes()?;
        seal(&mut bytes);
        Ok(bytes)
    }

    /// Represent an empty entry in the volume table
    #[cfg(test)]
    pub(crate) fn none_into_bytes() -> anyhow::Result<Vec<u8>> {
        let record = VtblRecord {
            reserved_pebs: Default::default(),
            alignment: Default::default(),
            data_pad: Default::default(),
            vol_type: Default::default(),
            upd_marker: Default::default(),
            name: std::array::from_fn(|_| 0u8),
            name_len: Default::default(),
            flags: Default::default(),
            crc: Default::default(),
            padding: Default::default(),
        };
        let mut bytes = record.to_bytes()?;
        seal(&mut bytes);
        Ok(bytes)
    }
}

#[cfg(test)]
pub(crate) trait OptionIntoBytes {
    fn into_bytes(self) -> anyhow::Result<Vec<u8>>;
}

#[cfg(test)]
impl OptionIntoBytes for Option<VolTableRecord> {
    fn into_bytes(self) -> anyhow::Result<Vec<u8>> {
        match self {
            Some(x) => x.into_bytes(),
            None => VolTableRecord::none_into_bytes(),
        }
    }
}

impl TryFrom<VtblRecord> for VolTableRecord {
    type Error = ();

    fn try_from(value: VtblRecord) -> Result<Self, Self::Error> {
        let VtblRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,
            ..
        } = value;

        if name_len == 0 {
            return Err(());
        }

        let vol_type = vol_type.try_into()?;
        let upd_marker = upd_marker != 0;
        let name = name.get(..name_len as usize).ok_or(())?;
        let name = std::str::from_utf8(name).map_err(|_| ())?.to_string();

        Ok(Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        })
    }
}

#[cfg(test)]
impl From<VolTableRecord> for VtblRecord {
    fn from(value: VolTableRecord) -> VtblRecord {
        let VolTableRecord {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            flags,
        } = value;

        let vol_type = vol_type.into();
        let upd_marker = upd_marker.into();

        // Leave room for the NUL terminator that Linux expects
        let mut name_bytes = name.as_bytes();
        let mut name = std::array::from_fn(|_| 0u8);
        name_bytes = &name_bytes[..std::cmp::min(name_bytes.len(), name.len() - 1)];
        name[..name_bytes.len()].copy_from_slice(name_bytes);
        let name_len = name_bytes.len() as _;

        Self {
            reserved_pebs,
            alignment,
            data_pad,
            vol_type,
            upd_marker,
            name,
            name_len,
            flags,

            crc: Default::default(),
            padding: Default::default(),
        }
    }
}
