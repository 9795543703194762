//! This module loads the volume table out of the layout volume.

use super::headers::{VolTableRecord, UBI_VTBL_RECORD_SIZE};
use super::read::{read_leb, LebOffset};
use super::UBI_MAX_VOLUMES;
use crate::nand::Nand;

use log::{debug, info, warn};

/// The volume table, indexed by volume ID. Empty (or unreadable) slots are `None`.
pub type VolTable = Box<[Option<VolTableRecord>]>;

/// Load the volume table from the PEB holding LEB 0 of the layout volume.
///
/// This never fails: if `head` is `None` or cannot be read, the table comes back with every slot
/// empty, so that volumes can still be loaded by ID. The layout volume keeps a second copy of the
/// table in LEB 1, but only the head is consulted.
pub fn load_vtbl<N: Nand>(
    nand: &N,
    head: Option<u32>,
    scratch: &mut [u8],
    verify_crc: bool,
) -> VolTable {
    let mut table: VolTable = vec![None; UBI_MAX_VOLUMES].into();

    let Some(pnum) = head else {
        info!("No layout volume found; volumes can only be found by ID");
        return table;
    };

    let block = match nand.block(pnum) {
        Ok(Some(block)) => block,
        Ok(None) => {
            warn!("Layout volume PEB {pnum} is bad");
            return table;
        }
        Err(e) => {
            warn!("Layout volume PEB {pnum} could not be accessed: {e}");
            return table;
        }
    };

    let mut buf = vec![0u8; UBI_MAX_VOLUMES * UBI_VTBL_RECORD_SIZE];
    let len = match read_leb(&block, scratch, verify_crc, LebOffset::At(0), &mut buf) {
        Ok(len) => len,
        Err(e) => {
            warn!("Volume table in PEB {pnum} could not be read: {e}");
            return table;
        }
    };

    for (slot, bytes) in table.iter_mut().zip(buf[..len].chunks_exact(UBI_VTBL_RECORD_SIZE)) {
        *slot = VolTableRecord::decode(bytes, verify_crc);
    }

    let count = table.iter().flatten().count();
    debug!("Loaded volume table from PEB {pnum}: {count} volumes");

    table
}
