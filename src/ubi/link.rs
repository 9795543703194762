//! This module turns the flat [PebTable] into per-volume chains of LEBs, after settling which PEB
//! holds each LEB when an interrupted update (or wear-leveling move) left two copies behind.
//!
//! Both passes compare every pair of PEBs. That is quadratic, but the PEB count of a boot
//! partition is small and this only runs once.

use super::directory::UbiConfig;
use super::read::{read_leb, LebOffset};
use super::scan::{Peb, UNUSED};
use super::{UBI_INTERNAL_VOL_START, UBI_LAYOUT_VOLUME_ID};
use crate::nand::Nand;

use log::{debug, info, warn};

/// Can PEBs of this volume be chained? User volumes and the layout volume can; other internal
/// volumes are of no interest to a boot loader.
fn is_linkable(vol_id: u32) -> bool {
    vol_id < UBI_INTERNAL_VOL_START || vol_id == UBI_LAYOUT_VOLUME_ID
}

/// Check whether a copied LEB's data survived the copy
fn revalidate<N: Nand>(nand: &N, pnum: u32, scratch: &mut [u8], leb_buf: &mut [u8]) -> bool {
    let block = match nand.block(pnum) {
        Ok(Some(block)) => block,
        Ok(None) => {
            warn!("PEB {pnum} went bad before it could be revalidated");
            return false;
        }
        Err(e) => {
            warn!("PEB {pnum} could not be revalidated: {e}");
            return false;
        }
    };

    match read_leb(&block, scratch, true, LebOffset::At(0), leb_buf) {
        Ok(_) => true,
        Err(e) => {
            warn!("Copied LEB in PEB {pnum} is damaged: {e}");
            false
        }
    }
}

/// Decide which of two PEBs holding the same LEB survives, returning `(winner, loser)`
fn pick_winner<N: Nand>(
    nand: &N,
    pebs: &[Peb],
    a: u32,
    b: u32,
    config: &UbiConfig,
    scratch: &mut [u8],
    leb_buf: &mut [u8],
) -> (u32, u32) {
    let (newer, older) = match pebs[b as usize].sqnum > pebs[a as usize].sqnum {
        true => (b, a),
        false => (a, b),
    };

    // Without the copy flag, the newer write was a complete one
    if !config.verify_crc || !pebs[newer as usize].copy_flag {
        return (newer, older);
    }

    match revalidate(nand, newer, scratch, leb_buf) {
        true => (newer, older),
        false => (older, newer),
    }
}

/// Find every LEB held by more than one PEB, and mark all but one of the PEBs as [UNUSED].
///
/// `scratch` must hold at least [super::scan::HEADER_SCRATCH_PAGES] pages, and `leb_buf` a whole
/// eraseblock; both are clobbered.
pub fn resolve_duplicates<N: Nand>(
    nand: &N,
    pebs: &mut [Peb],
    config: &UbiConfig,
    scratch: &mut [u8],
    leb_buf: &mut [u8],
) {
    for a in 0..pebs.len() {
        if !is_linkable(pebs[a].vol_id) {
            continue;
        }

        for b in a + 1..pebs.len() {
            // Has `a` itself been superseded?
            if !pebs[a].is_used() {
                break;
            }

            if (pebs[b].vol_id, pebs[b].lnum) != (pebs[a].vol_id, pebs[a].lnum) {
                continue;
            }

            let (winner, loser) =
                pick_winner(nand, pebs, a as u32, b as u32, config, scratch, leb_buf);
            let loser_peb = &mut pebs[loser as usize];
            info!(
                "LEB {}:{} is in PEB {winner}, superseding PEB {loser}",
                loser_peb.vol_id, loser_peb.lnum
            );
            loser_peb.vol_id = UNUSED;
            loser_peb.next = None;
        }
    }
}

/// Point each PEB's `next` at the PEB holding the following LEB of the same volume.
///
/// Duplicates must have been resolved first, so that each LEB has exactly one PEB.
pub fn link_chains(pebs: &mut [Peb]) {
    for a in 0..pebs.len() {
        if !is_linkable(pebs[a].vol_id) {
            continue;
        }

        for b in a + 1..pebs.len() {
            if pebs[b].vol_id != pebs[a].vol_id {
                continue;
            }

            if pebs[a].lnum.checked_add(1) == Some(pebs[b].lnum) {
                pebs[a].next = Some(b as u32);
            } else if pebs[b].lnum.checked_add(1) == Some(pebs[a].lnum) {
                pebs[b].next = Some(a as u32);
            }
        }
    }

    let linked = pebs.iter().filter(|x| x.next.is_some()).count();
    debug!("Linked {linked} LEBs to their successors");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::SimNand;
    use crate::ubi::headers::{VolType, Vid};
    use crate::ubi::scan::{scan_blocks, PebTable, HEADER_SCRATCH_PAGES};
    use crate::ubi::testutil::{ImageBuilder, TEST_LAYOUT};

    fn scan_and_link(nand: &SimNand, config: UbiConfig) -> PebTable {
        let mut scratch = vec![0; TEST_LAYOUT.bytes_per_page * HEADER_SCRATCH_PAGES];
        let mut leb_buf = vec![0; TEST_LAYOUT.block_size()];
        let mut pebs = scan_blocks(nand, &config, &mut scratch);
        resolve_duplicates(nand, &mut pebs, &config, &mut scratch, &mut leb_buf);
        link_chains(&mut pebs);
        pebs
    }

    fn leb(vol_id: u32, lnum: u32, sqnum: u64, copy_flag: bool) -> Vid {
        Vid {
            vol_id,
            lnum,
            sqnum,
            copy_flag,
            ..Default::default()
        }
    }

    /// Follow a chain from `head`, returning the `lnum` of each PEB visited
    fn walk(pebs: &[Peb], head: u32) -> Vec<u32> {
        let mut lnums = Vec::new();
        let mut next = Some(head);
        while let Some(pnum) = next {
            assert!(lnums.len() <= pebs.len(), "cycle in chain");
            let peb = pebs[pnum as usize];
            assert!(peb.is_used());
            lnums.push(peb.lnum);
            next = peb.next;
        }
        lnums
    }

    #[test]
    fn test_link_out_of_order() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(6, leb(3, 0, 0, false), b"a")?;
        image.write_leb(1, leb(3, 1, 0, false), b"b")?;
        image.write_leb(4, leb(3, 2, 0, false), b"c")?;
        image.write_leb(2, leb(5, 0, 0, false), b"d")?;
        image.write_leb(3, leb(5, 1, 0, false), b"e")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[6].next, Some(1));
        assert_eq!(pebs[1].next, Some(4));
        assert_eq!(pebs[4].next, None);
        assert_eq!(walk(&pebs, 6), [0, 1, 2]);
        assert_eq!(walk(&pebs, 2), [0, 1]);

        Ok(())
    }

    #[test]
    fn test_link_stops_at_gap() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(0, leb(1, 0, 0, false), b"a")?;
        image.write_leb(1, leb(1, 2, 0, false), b"c")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(walk(&pebs, 0), [0]);

        Ok(())
    }

    #[test_log::test]
    fn test_duplicate_newer_wins() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(2, leb(3, 0, 20, false), b"new")?;
        image.write_leb(3, leb(3, 0, 10, false), b"old")?;
        image.write_leb(5, leb(3, 1, 11, false), b"next")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[2].vol_id, 3);
        assert_eq!(pebs[3].vol_id, UNUSED);
        assert_eq!(pebs[3].next, None);
        assert_eq!(walk(&pebs, 2), [0, 1]);

        Ok(())
    }

    #[test_log::test]
    fn test_duplicate_valid_copy_wins() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(1, leb(4, 0, 10, false), b"old")?;
        image.write_leb(6, leb(4, 0, 30, true), b"copied")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[1].vol_id, UNUSED);
        assert_eq!(pebs[6].vol_id, 4);

        Ok(())
    }

    #[test_log::test]
    fn test_duplicate_damaged_copy_loses() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(1, leb(4, 0, 10, false), b"old")?;
        image.write_leb(2, leb(4, 1, 11, false), b"tail")?;

        // The copy's data doesn't match its CRC, as if the copy was interrupted
        let copy = Vid {
            data_size: 6,
            data_crc: 0xDEADBEEF,
            ..leb(4, 0, 30, true)
        };
        image.write_leb_raw(6, copy, b"copied")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[1].vol_id, 4);
        assert_eq!(pebs[6].vol_id, UNUSED);
        assert_eq!(walk(&pebs, 1), [0, 1]);

        Ok(())
    }

    #[test]
    fn test_duplicate_unreadable_copy_loses() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(0, leb(4, 0, 30, true), b"copied")?;
        image.write_leb(7, leb(4, 0, 10, false), b"old")?;
        image.nand.block_mut(0)?.fail_page(2);
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[0].vol_id, UNUSED);
        assert_eq!(pebs[7].vol_id, 4);

        Ok(())
    }

    #[test]
    fn test_duplicate_without_crc_uses_sqnum() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(1, leb(4, 0, 10, false), b"old")?;
        let copy = Vid {
            data_size: 6,
            data_crc: 0xDEADBEEF,
            ..leb(4, 0, 30, true)
        };
        image.write_leb_raw(6, copy, b"copied")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(false));

        assert_eq!(pebs[1].vol_id, UNUSED);
        assert_eq!(pebs[6].vol_id, 4);

        Ok(())
    }

    #[test]
    fn test_duplicate_triplicate() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(0, leb(2, 0, 5, false), b"a")?;
        image.write_leb(3, leb(2, 0, 15, false), b"c")?;
        image.write_leb(5, leb(2, 0, 9, false), b"b")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        let survivors: Vec<usize> = (0..pebs.len()).filter(|&i| pebs[i].vol_id == 2).collect();
        assert_eq!(survivors, [3]);

        Ok(())
    }

    #[test]
    fn test_link_layout_volume_but_not_other_internal() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(0, leb(UBI_LAYOUT_VOLUME_ID, 0, 0, false), b"v0")?;
        image.write_leb(1, leb(UBI_LAYOUT_VOLUME_ID, 1, 0, false), b"v1")?;
        image.write_leb(2, leb(UBI_LAYOUT_VOLUME_ID + 1, 0, 0, false), b"x0")?;
        image.write_leb(3, leb(UBI_LAYOUT_VOLUME_ID + 1, 1, 0, false), b"x1")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        assert_eq!(pebs[0].next, Some(1));
        assert_eq!(pebs[2].next, None);

        Ok(())
    }

    #[test]
    fn test_chains_well_formed() -> anyhow::Result<()> {
        // A jumble of volumes, duplicates, and a static volume, in scrambled PEB order
        let mut image = ImageBuilder::new(TEST_LAYOUT);
        image.write_leb(7, leb(1, 1, 0, false), b"1:1")?;
        image.write_leb(0, leb(1, 0, 0, false), b"1:0")?;
        image.write_leb(4, leb(1, 1, 0, false), b"1:1 again")?;
        image.write_leb(2, leb(1, 2, 0, false), b"1:2")?;
        let vid = Vid {
            vol_type: VolType::Static,
            ..leb(2, 0, 0, false)
        };
        image.write_leb(5, vid, b"2:0")?;
        image.write_leb(1, leb(1, 0, 0, false), b"1:0 again")?;
        let pebs = scan_and_link(&image.build(), UbiConfig::default().verify_crc(true));

        for (pnum, peb) in pebs.iter().enumerate() {
            if peb.is_used() && peb.lnum == 0 {
                let lnums = walk(&pebs, pnum as u32);
                let expected: Vec<u32> = (0..lnums.len() as u32).collect();
                assert_eq!(lnums, expected);
            }
        }

        // Every LEB is held by exactly one PEB, and no dead PEB is linked to
        assert_eq!(pebs.iter().filter(|x| x.is_used()).count(), 4);
        for peb in pebs.iter() {
            if let Some(next) = peb.next {
                assert!(pebs[next as usize].is_used());
            }
        }

        Ok(())
    }
}
