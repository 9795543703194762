//! This module contains code to scan the PEBs of a UBI partition and record which LEB, if any,
//! each one holds.

use super::directory::UbiConfig;
use super::error::HeaderError;
use super::headers::*;
use crate::nand::{Nand, NandBlock};

use log::{debug, info, log, trace, Level};

/// `vol_id` of a PEB that holds no (usable) LEB
pub const UNUSED: u32 = u32::MAX;

/// How many pages of scratch [read_headers] needs: the first page, plus up to two more for a VID
/// header that lies beyond (or straddles the end of) the first page
pub const HEADER_SCRATCH_PAGES: usize = 3;

/// What the scan learned about one PEB
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct Peb {
    /// The volume this PEB belongs to, or [UNUSED]
    pub vol_id: u32,

    /// Which LEB of the volume this PEB holds
    pub lnum: u32,

    /// CRC of the LEB data, as recorded in the VID header
    pub data_crc: u32,

    /// The write sequence number of the VID header
    pub sqnum: u64,

    /// Whether the LEB was written as a copy of another PEB
    pub copy_flag: bool,

    /// The PEB holding LEB `lnum + 1` of the same volume, if known
    pub next: Option<u32>,
}

impl Default for Peb {
    fn default() -> Self {
        Self {
            vol_id: UNUSED,
            lnum: 0,
            data_crc: 0,
            sqnum: 0,
            copy_flag: false,
            next: None,
        }
    }
}

impl From<Vid> for Peb {
    fn from(value: Vid) -> Self {
        Self {
            vol_id: value.vol_id,
            lnum: value.lnum,
            data_crc: value.data_crc,
            sqnum: value.sqnum,
            copy_flag: value.copy_flag,
            next: None,
        }
    }
}

impl Peb {
    /// Does this PEB hold a live LEB?
    pub fn is_used(&self) -> bool {
        self.vol_id != UNUSED
    }
}

/// The table of every PEB in the partition, indexed by PEB number
pub type PebTable = Box<[Peb]>;

/// Read the bytes `offset..offset + len` of a block, via whole pages read into `scratch`.
///
/// The returned slice borrows `scratch`, so it is only valid until the next read.
pub fn read_span<'s, B: NandBlock>(
    block: &B,
    offset: usize,
    len: usize,
    scratch: &'s mut [u8],
) -> anyhow::Result<&'s [u8]> {
    let page_size = block.page_size();
    anyhow::ensure!(len > 0 && page_size > 0, "empty read");

    let first = offset / page_size;
    let last = (offset + len - 1) / page_size;
    anyhow::ensure!(
        last < block.page_count() as usize,
        "bytes {offset}..{} are beyond the end of the block",
        offset + len
    );

    let buf = scratch
        .get_mut(..(last - first + 1) * page_size)
        .ok_or(anyhow::anyhow!("scratch buffer too small"))?;
    block.read(first as u32, buf)?;

    Ok(&buf[offset % page_size..][..len])
}

/// Read and validate both headers of a PEB.
///
/// `scratch` must hold at least [HEADER_SCRATCH_PAGES] pages; its content is clobbered. The
/// headers are only returned as a pair: a PEB without a valid VID header is of no use to a reader,
/// even if its EC header is fine.
pub fn read_headers<B: NandBlock>(
    block: &B,
    scratch: &mut [u8],
    verify_crc: bool,
) -> Result<(Ec, Vid), HeaderError> {
    let page_size = block.page_size();
    if scratch.len() < page_size * HEADER_SCRATCH_PAGES {
        return Err(HeaderError::Media(anyhow::anyhow!("scratch buffer too small")));
    }

    let (first_page, rest) = scratch.split_at_mut(page_size);
    block.read(0, first_page).map_err(HeaderError::Media)?;

    let ec = Ec::decode(first_page, verify_crc)?;

    let vid_offset = ec.vid_hdr_offset as usize;
    let vid = match first_page.get(vid_offset..vid_offset + UBI_VID_HDR_SIZE) {
        Some(bytes) => Vid::decode(bytes, verify_crc)?,
        None => {
            trace!("VID header at offset {vid_offset:#x} is outside the first page");
            let bytes = read_span(block, vid_offset, UBI_VID_HDR_SIZE, rest)
                .map_err(HeaderError::Media)?;
            Vid::decode(bytes, verify_crc)?
        }
    };

    Ok((ec, vid))
}

/// The level a header error is logged at: only corruption is worth a warning, and a PEB that
/// simply holds nothing is not worth more than a trace
fn header_error_level(error: &HeaderError) -> Level {
    match error {
        e if e.is_corruption() => Level::Warn,
        HeaderError::Media(_) => Level::Info,
        _ => Level::Trace,
    }
}

fn log_header_error(pnum: u32, error: &HeaderError) {
    log!(header_error_level(error), "PEB {pnum} holds no LEB: {error}");
}

/// Read the headers of every PEB (past the reserved ones) and build the [PebTable].
///
/// This never fails: bad blocks, unreadable pages, and corrupt headers all just leave the PEB's
/// entry unused.
pub fn scan_blocks<N: Nand>(nand: &N, config: &UbiConfig, scratch: &mut [u8]) -> PebTable {
    let block_count = nand.get_layout().blocks;
    let mut pebs = vec![Peb::default(); block_count as usize];

    let rpt = howudoin::new()
        .label("Scanning blocks")
        .set_len(u64::from(block_count.saturating_sub(config.first_block)));

    for pnum in config.first_block..block_count {
        rpt.inc();

        let block = match nand.block(pnum) {
            Ok(Some(block)) => block,
            Ok(None) => {
                info!("PEB {pnum} is bad");
                continue;
            }
            Err(e) => {
                info!("PEB {pnum} could not be accessed: {e}");
                continue;
            }
        };

        match read_headers(&block, scratch, config.verify_crc) {
            Ok((_, vid)) => {
                trace!(
                    "PEB {pnum}: LEB {}:{} (sqnum {}{})",
                    vid.vol_id,
                    vid.lnum,
                    vid.sqnum,
                    if vid.copy_flag { ", copy" } else { "" }
                );
                pebs[pnum as usize] = vid.into();
            }
            Err(e) => log_header_error(pnum, &e),
        }
    }

    rpt.close();

    let used = pebs.iter().filter(|x| x.is_used()).count();
    debug!("Scanned {block_count} PEBs, {used} hold LEBs");

    pebs.into()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;
    use crate::ubi::testutil::{ImageBuilder, TEST_LAYOUT};

    fn scan(nand: &SimNand, config: UbiConfig) -> PebTable {
        let mut scratch = vec![0; TEST_LAYOUT.bytes_per_page * HEADER_SCRATCH_PAGES];
        scan_blocks(nand, &config, &mut scratch)
    }

    #[test_log::test]
    fn test_scan_classifies_blocks() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        let vid = Vid {
            vol_id: 3,
            ..Default::default()
        };
        image.write_leb(1, vid, b"hello")?;
        let copy = Vid {
            lnum: 1,
            copy_flag: true,
            ..vid
        };
        image.write_leb(2, copy, b"world")?;
        image.write_ec_only(4)?;
        image.write_junk(5)?;
        image.nand.block_mut(6)?.mark_bad();
        let nand = image.build();

        let pebs = scan(&nand, UbiConfig::default());
        assert_eq!(pebs.len(), TEST_LAYOUT.blocks as usize);

        assert_eq!((pebs[1].vol_id, pebs[1].lnum, pebs[1].copy_flag), (3, 0, false));
        assert_eq!((pebs[2].vol_id, pebs[2].lnum, pebs[2].copy_flag), (3, 1, true));
        assert!(pebs[2].sqnum > pebs[1].sqnum);
        assert!(pebs.iter().all(|x| x.next.is_none()));

        for pnum in [0, 3, 4, 5, 6, 7] {
            assert!(!pebs[pnum].is_used(), "PEB {pnum} should be unused");
        }

        Ok(())
    }

    #[test]
    fn test_scan_skips_reserved_blocks() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(0, Vid { vol_id: 1, ..Default::default() }, b"boot")?;
        image.write_leb(3, Vid { vol_id: 2, ..Default::default() }, b"data")?;
        let nand = image.build();

        let pebs = scan(&nand, UbiConfig::default().first_block(2));
        assert!(!pebs[0].is_used());
        assert_eq!(pebs[3].vol_id, 2);

        Ok(())
    }

    #[test]
    fn test_read_headers_vid_beyond_first_page() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        let page = TEST_LAYOUT.bytes_per_page as u32;

        // VID header straddling the boundary between the second and third page
        image.ec = Ec {
            vid_hdr_offset: 2 * page - 32,
            data_offset: 3 * page,
            ..image.ec
        };
        image.write_leb(0, Vid { vol_id: 9, lnum: 4, ..Default::default() }, b"x")?;

        // VID header sharing the first page with the EC header
        image.ec = Ec {
            vid_hdr_offset: 64,
            data_offset: page,
            ..image.ec
        };
        image.write_leb(1, Vid { vol_id: 9, lnum: 5, ..Default::default() }, b"y")?;
        let nand = image.build();

        let mut scratch = vec![0; TEST_LAYOUT.bytes_per_page * HEADER_SCRATCH_PAGES];

        let block = nand.block(0)?.unwrap();
        let (ec, vid) = read_headers(&block, &mut scratch, true)?;
        assert_eq!(ec.vid_hdr_offset, 2 * page - 32);
        assert_eq!((vid.vol_id, vid.lnum), (9, 4));

        let block = nand.block(1)?.unwrap();
        let (ec, vid) = read_headers(&block, &mut scratch, true)?;
        assert_eq!(ec.vid_hdr_offset, 64);
        assert_eq!((vid.vol_id, vid.lnum), (9, 5));

        Ok(())
    }

    #[test]
    fn test_read_headers_errors() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_ec_only(1)?;
        image.write_junk(2)?;
        image.write_leb(3, Vid::default(), b"z")?;
        image.nand.block_mut(3)?.fail_page(0);
        let nand = image.build();

        let mut scratch = vec![0; TEST_LAYOUT.bytes_per_page * HEADER_SCRATCH_PAGES];
        let mut headers = |pnum| {
            let block = nand.block(pnum).unwrap().unwrap();
            read_headers(&block, &mut scratch, true).unwrap_err()
        };

        // Fully erased, and EC-only (free) blocks are both expected and silent
        let err = headers(0);
        assert!(matches!(err, HeaderError::Erased) && !err.is_corruption());
        let err = headers(1);
        assert!(matches!(err, HeaderError::Erased) && !err.is_corruption());

        let err = headers(2);
        assert!(matches!(err, HeaderError::BadMagic { .. }) && err.is_corruption());

        let err = headers(3);
        assert!(matches!(err, HeaderError::Media(_)) && !err.is_corruption());

        Ok(())
    }

    #[test]
    fn test_header_error_level() {
        let mut bytes = [0xFF; UBI_EC_HDR_SIZE];
        let err = Ec::decode(&bytes, true).unwrap_err();
        assert_eq!(header_error_level(&err), Level::Trace);

        bytes[..4].copy_from_slice(b"UBI?");
        let err = Ec::decode(&bytes, true).unwrap_err();
        assert_eq!(header_error_level(&err), Level::Warn);

        let crc = HeaderError::BadCrc {
            stored: 0,
            computed: 1,
        };
        assert_eq!(header_error_level(&crc), Level::Warn);
        assert_eq!(header_error_level(&HeaderError::Malformed), Level::Warn);

        let media = HeaderError::Media(anyhow::anyhow!("read failed"));
        assert_eq!(header_error_level(&media), Level::Info);
    }

    #[test]
    fn test_read_span() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        let pattern: Vec<u8> = (0..TEST_LAYOUT.block_size()).map(|x| x as u8).collect();
        image.nand.block_mut(0)?.program(0, &pattern)?;
        let nand = image.build();

        let block = nand.block(0)?.unwrap();
        let mut scratch = vec![0; TEST_LAYOUT.bytes_per_page * 2];
        let page = TEST_LAYOUT.bytes_per_page;

        let span = read_span(&block, page - 2, 4, &mut scratch)?;
        assert_eq!(span, &pattern[page - 2..page + 2]);

        assert!(read_span(&block, TEST_LAYOUT.block_size() - 1, 2, &mut scratch).is_err());
        assert!(read_span(&block, 0, page * 3, &mut scratch).is_err());

        Ok(())
    }
}
