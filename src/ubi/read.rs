//! This module reads the data of a LEB out of the PEB holding it.

use super::error::ReadError;
use super::headers::{VolType, UBI_CRC};
use super::scan::read_headers;
use crate::nand::NandBlock;

use log::trace;

use std::ops::Range;

/// Where in the destination buffer the LEB's data lands
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum LebOffset {
    /// At this many bytes from the start of the buffer
    At(usize),

    /// At the LEB's position within its volume, i.e. `lnum` times the LEB size, so that a whole
    /// volume can be read into one flat buffer
    Auto,
}

/// Read the data of the LEB held by `block` into `dest`, returning the number of bytes written.
///
/// This is [read_leb_range], for callers that only need the amount.
pub fn read_leb<B: NandBlock>(
    block: &B,
    scratch: &mut [u8],
    verify_crc: bool,
    offset: LebOffset,
    dest: &mut [u8],
) -> Result<usize, ReadError> {
    read_leb_range(block, scratch, verify_crc, offset, dest).map(|x| x.len())
}

/// Read the data of the LEB held by `block` into `dest`, returning the range of `dest` written.
///
/// The amount read is the data size of a static LEB, or the whole LEB otherwise, cut short by the
/// end of `dest`. If the LEB's position (see [LebOffset]) is already past the end of `dest`,
/// nothing is read and the result is an empty range; any other read that produces nothing is an
/// error.
///
/// When `verify_crc` is set, LEBs that carry a data CRC (static ones and copies) are checked over
/// their full data size, even the part that doesn't fit in `dest`.
///
/// On error, `dest` holds no unverified data: whatever part of it the LEB was being read into is
/// zeroed, and the rest is untouched.
///
/// `scratch` must hold at least [super::scan::HEADER_SCRATCH_PAGES] pages, and is clobbered.
pub fn read_leb_range<B: NandBlock>(
    block: &B,
    scratch: &mut [u8],
    verify_crc: bool,
    offset: LebOffset,
    dest: &mut [u8],
) -> Result<Range<usize>, ReadError> {
    let (ec, vid) = read_headers(block, scratch, verify_crc)?;

    let page_size = block.page_size();
    let data_offset = ec.data_offset as usize;
    let leb_size = block
        .size()
        .checked_sub(data_offset)
        .and_then(|x| x.checked_sub(vid.data_pad as usize))
        .filter(|&x| x > 0)
        .ok_or(ReadError::Layout)?;

    let offset = match offset {
        LebOffset::At(offset) => offset,
        LebOffset::Auto => (vid.lnum as usize).saturating_mul(leb_size),
    };
    if dest.len() <= offset {
        trace!("LEB {}:{} is past the end of the buffer", vid.vol_id, vid.lnum);
        return Ok(dest.len()..dest.len());
    }
    let dest = &mut dest[offset..];

    let data_size = vid.data_size as usize;
    if vid.vol_type == VolType::Static && data_size > leb_size {
        return Err(ReadError::Layout);
    }

    let size = match vid.vol_type {
        VolType::Static => data_size,
        VolType::Dynamic => leb_size,
    };
    let size = std::cmp::min(size, dest.len());
    let crc_len = match verify_crc && vid.has_data_crc() {
        true => std::cmp::min(data_size, leb_size),
        false => 0,
    };

    let total = std::cmp::max(size, crc_len);
    let page_buf = &mut scratch[..page_size];
    let mut digest = UBI_CRC.digest();
    let mut page = (data_offset / page_size) as u32;
    let mut skip = data_offset % page_size;
    let mut done = 0;

    while done < total && page < block.page_count() {
        if let Err(e) = block.read(page, page_buf) {
            dest[..size].fill(0);
            return Err(ReadError::Media(e));
        }

        let chunk = &page_buf[skip..std::cmp::min(page_size, skip + (total - done))];
        if done < size {
            let n = std::cmp::min(chunk.len(), size - done);
            trace!("Copying to {:#x}..{:#x}", offset + done, offset + done + n);
            dest[done..done + n].copy_from_slice(&chunk[..n]);
        }
        if done < crc_len {
            digest.update(&chunk[..std::cmp::min(chunk.len(), crc_len - done)]);
        }

        done += chunk.len();
        page += 1;
        skip = 0;
    }

    if crc_len > 0 {
        let computed = digest.finalize();
        if computed != vid.data_crc {
            dest[..size].fill(0);
            return Err(ReadError::DataCrc {
                stored: vid.data_crc,
                computed,
            });
        }
    }

    match std::cmp::min(done, size) {
        0 => Err(ReadError::Empty),
        written => Ok(offset..offset + written),
    }
}
