//! This module ties the scan, link, and volume-table steps together into an attached [Ubi], which
//! answers questions about volumes and loads their contents.

use super::error::UbiError;
use super::headers::VolTableRecord;
use super::link::{link_chains, resolve_duplicates};
use super::read::{read_leb_range, LebOffset};
use super::scan::{scan_blocks, Peb, PebTable, HEADER_SCRATCH_PAGES};
use super::vtbl::{load_vtbl, VolTable};
use super::{UBI_LAYOUT_VOLUME_ID, UBI_LAYOUT_VOLUME_NAME, UBI_MAX_VOLUMES};
use crate::nand::Nand;

use log::{debug, info, warn};

/// Settings for attaching to a UBI partition
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct UbiConfig {
    /// The number of blocks at the start of the partition reserved for something other than UBI
    /// (e.g. the boot loader itself), which are never scanned.
    pub first_block: u32,

    /// Whether to check header CRCs and data CRCs, and to revalidate copied LEBs before trusting
    /// them over an older PEB. Without this, only the magic and version of a header are checked,
    /// and duplicate LEBs are resolved by sequence number alone.
    pub verify_crc: bool,
}

impl Default for UbiConfig {
    fn default() -> Self {
        Self {
            first_block: 0,
            verify_crc: cfg!(feature = "crc"),
        }
    }
}

impl UbiConfig {
    /// Change the number of reserved blocks
    pub fn first_block(mut self, first_block: u32) -> Self {
        self.first_block = first_block;
        self
    }

    /// Enable or disable CRC checks
    pub fn verify_crc(mut self, verify_crc: bool) -> Self {
        self.verify_crc = verify_crc;
        self
    }
}

/// Iterator over the PEBs of a volume, in LEB order
#[derive(Debug, Clone)]
pub struct Chain<'a> {
    pebs: &'a [Peb],
    next: Option<u32>,

    /// A chain can't visit more PEBs than exist; this bounds the walk should the table ever hold
    /// a cycle
    remaining: usize,
}

impl<'a> Chain<'a> {
    fn new(pebs: &'a [Peb], head: Option<u32>) -> Self {
        Self {
            pebs,
            next: head,
            remaining: pebs.len(),
        }
    }
}

impl Iterator for Chain<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let pnum = self.next?;
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        self.next = self.pebs.get(pnum as usize).and_then(|x| x.next);
        Some(pnum)
    }
}

/// What [Ubi::load_volume_extent] read
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Loaded {
    /// The number of bytes read, over all LEBs
    pub bytes: usize,

    /// The end of the last byte read, in the destination buffer. Past `bytes` whenever a LEB was
    /// skipped before it.
    pub end: usize,
}

/// An attached UBI partition.
///
/// Everything is worked out once, by [Ubi::attach]; afterward the only flash access is reading
/// volume contents.
pub struct Ubi<N: Nand> {
    nand: N,
    config: UbiConfig,
    pebs: PebTable,

    /// PEB holding LEB 0 of each user volume, indexed by volume ID
    heads: [Option<u32>; UBI_MAX_VOLUMES],

    /// PEB holding LEB 0 of the layout volume
    layout_head: Option<u32>,

    vtbl: VolTable,

    /// Page scratch for header and payload reads, clobbered by every read
    scratch: Vec<u8>,
}

impl<N: Nand> Ubi<N> {
    /// Scan the partition, link every volume's LEBs together, and load the volume table.
    ///
    /// This does not fail: unreadable or corrupt parts of the partition are logged and left out,
    /// and what remains is still usable.
    pub fn attach(nand: N, config: UbiConfig) -> Self {
        let layout = nand.get_layout();
        let mut scratch = vec![0u8; layout.bytes_per_page * HEADER_SCRATCH_PAGES];

        let mut pebs = scan_blocks(&nand, &config, &mut scratch);

        // Only needed for revalidating copies, so it doesn't outlive attaching
        let mut leb_buf = vec![0u8; layout.block_size()];
        resolve_duplicates(&nand, &mut pebs, &config, &mut scratch, &mut leb_buf);
        drop(leb_buf);

        link_chains(&mut pebs);

        let mut heads = [None; UBI_MAX_VOLUMES];
        let mut layout_head = None;
        for (pnum, peb) in pebs.iter().enumerate() {
            if !peb.is_used() || peb.lnum != 0 {
                continue;
            }

            let slot = match peb.vol_id {
                UBI_LAYOUT_VOLUME_ID => &mut layout_head,
                id if (id as usize) < UBI_MAX_VOLUMES => &mut heads[id as usize],
                id => {
                    debug!("Ignoring volume {id} in PEB {pnum}");
                    continue;
                }
            };
            info!("Volume {} starts at PEB {pnum}", peb.vol_id);
            *slot = Some(pnum as u32);
        }

        let vtbl = load_vtbl(&nand, layout_head, &mut scratch, config.verify_crc);

        Self {
            nand,
            config,
            pebs,
            heads,
            layout_head,
            vtbl,
            scratch,
        }
    }

    /// The PEB holding LEB 0 of a volume
    fn head(&self, vol_id: u32) -> Option<u32> {
        match vol_id {
            UBI_LAYOUT_VOLUME_ID => self.layout_head,
            id => self.heads.get(id as usize).copied().flatten(),
        }
    }

    /// Look up the name of a volume.
    ///
    /// The layout volume's name is fixed, since the volume table doesn't describe the volume
    /// holding it.
    pub fn volume_name(&self, vol_id: u32) -> Option<&str> {
        match vol_id {
            UBI_LAYOUT_VOLUME_ID => Some(UBI_LAYOUT_VOLUME_NAME),
            id => self.volume_record(id).map(|x| x.name.as_str()),
        }
    }

    /// The volume table record of a volume, if the table has one
    pub fn volume_record(&self, vol_id: u32) -> Option<&VolTableRecord> {
        self.vtbl.get(vol_id as usize)?.as_ref()
    }

    /// Find the ID of the volume with exactly this name.
    ///
    /// A volume that is in the volume table but has no LEB 0 on flash is not found.
    pub fn search_volume(&self, name: &str) -> Option<u32> {
        let found = self
            .vtbl
            .iter()
            .enumerate()
            .find(|(_, record)| record.as_ref().is_some_and(|x| x.name == name))
            .map(|(id, _)| id as u32)?;

        match self.head(found) {
            Some(_) => Some(found),
            None => {
                warn!("Volume \"{name}\" ({found}) has no LEB 0");
                None
            }
        }
    }

    /// Read the contents of a volume into `dest`, returning the number of bytes read.
    ///
    /// Each LEB lands at its position within the volume, and LEBs that would start past the end
    /// of `dest` are skipped. Damaged LEBs are logged and skipped too, so the result may have
    /// holes, but as much as possible is recovered. It is only an error if nothing at all could be
    /// read.
    pub fn load_volume(&mut self, vol_id: u32, dest: &mut [u8]) -> Result<usize, UbiError> {
        self.load_volume_extent(vol_id, dest).map(|x| x.bytes)
    }

    /// Read the contents of a volume into `dest` as [Ubi::load_volume] does, also reporting where
    /// the data ends.
    ///
    /// Skipped LEBs leave holes that never hold unverified data, and a skipped LEB in the middle
    /// of a volume puts the end past the byte count: only the end tells how much of `dest` holds
    /// the volume.
    pub fn load_volume_extent(
        &mut self,
        vol_id: u32,
        dest: &mut [u8],
    ) -> Result<Loaded, UbiError> {
        let head = self.head(vol_id).ok_or(UbiError::VolumeNotFound(vol_id))?;

        let mut loaded = Loaded::default();
        for pnum in Chain::new(&self.pebs, Some(head)) {
            let lnum = self.pebs[pnum as usize].lnum;
            let block = match self.nand.block(pnum) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    warn!("LEB {vol_id}:{lnum} is in bad PEB {pnum}; skipping");
                    continue;
                }
                Err(e) => {
                    warn!("LEB {vol_id}:{lnum} (PEB {pnum}) could not be accessed: {e}");
                    continue;
                }
            };

            match read_leb_range(
                &block,
                &mut self.scratch,
                self.config.verify_crc,
                LebOffset::Auto,
                dest,
            ) {
                Ok(range) if range.is_empty() => {}
                Ok(range) => {
                    debug!(
                        "Read {} bytes of LEB {vol_id}:{lnum} from PEB {pnum}",
                        range.len()
                    );
                    loaded.bytes += range.len();
                    loaded.end = std::cmp::max(loaded.end, range.end);
                }
                Err(e) => warn!("LEB {vol_id}:{lnum} (PEB {pnum}) could not be read: {e}"),
            }
        }

        match loaded.bytes {
            0 => Err(UbiError::NoData(vol_id)),
            _ => Ok(loaded),
        }
    }

    /// Look up a volume by name and read its contents, as [Ubi::load_volume] does
    pub fn load_named(&mut self, name: &str, dest: &mut [u8]) -> Result<usize, UbiError> {
        let vol_id = self
            .search_volume(name)
            .ok_or_else(|| UbiError::NameNotFound(name.to_string()))?;
        self.load_volume(vol_id, dest)
    }

    /// The PEBs of a volume, in LEB order. Empty if the volume doesn't exist.
    pub fn chain(&self, vol_id: u32) -> Chain<'_> {
        Chain::new(&self.pebs, self.head(vol_id))
    }

    /// The IDs of every volume found on flash, the layout volume last
    pub fn volumes(&self) -> impl Iterator<Item = u32> + '_ {
        (0..UBI_MAX_VOLUMES as u32)
            .filter(|&id| self.head(id).is_some())
            .chain(self.layout_head.map(|_| UBI_LAYOUT_VOLUME_ID))
    }

    /// What the scan recorded about a PEB
    pub fn peb(&self, pnum: u32) -> Option<&Peb> {
        self.pebs.get(pnum as usize)
    }

    pub fn pebs(&self) -> &[Peb] {
        &self.pebs
    }

    pub fn config(&self) -> &UbiConfig {
        &self.config
    }

    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Detach, giving back the flash
    pub fn into_inner(self) -> N {
        self.nand
    }
}
