//! Helpers for building UBI images on a [SimNand], for tests.

use super::headers::*;
use super::{UBI_LAYOUT_VOLUME_ID, UBI_MAX_VOLUMES};
use crate::nand::{Nand, NandLayout, SimNand};

pub const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 8,
    bytes_per_page: 512,
};

const UBI_LAYOUT_VOLUME_COMPAT: u8 = 5;

/// Writes PEBs the way UBI would, with valid headers and CRCs
pub struct ImageBuilder {
    pub nand: SimNand,

    /// The EC header written to every PEB
    pub ec: Ec,

    sqnum: u64,
}

impl ImageBuilder {
    /// Start an image on blank flash, with the VID header in page 1 and data from page 2
    pub fn new(layout: NandLayout) -> Self {
        let page = layout.bytes_per_page as u32;
        Self {
            nand: SimNand::new(layout),
            ec: Ec {
                ec: 1,
                vid_hdr_offset: page,
                data_offset: 2 * page,
                image_seq: 0x1234_5678,
            },
            sqnum: 0,
        }
    }

    /// The usable bytes per LEB, given the current EC header
    pub fn leb_size(&self) -> usize {
        self.nand.get_layout().block_size() - self.ec.data_offset as usize
    }

    /// Write a PEB holding one LEB.
    ///
    /// The data size and CRC are filled in when UBI would record them (static volumes and
    /// copies), and a fresh sqnum is assigned unless `vid` already has one. Returns the `Vid` as
    /// written.
    pub fn write_leb(&mut self, pnum: u32, mut vid: Vid, data: &[u8]) -> anyhow::Result<Vid> {
        if vid.has_data_crc() {
            vid.data_size = data.len() as u32;
            vid.data_crc = UBI_CRC.checksum(data);
        }
        if vid.sqnum == 0 {
            self.sqnum += 1;
            vid.sqnum = self.sqnum;
        } else {
            self.sqnum = self.sqnum.max(vid.sqnum);
        }

        self.write_leb_raw(pnum, vid, data)?;
        Ok(vid)
    }

    /// Write a PEB holding one LEB, with the VID header exactly as given
    pub fn write_leb_raw(&mut self, pnum: u32, vid: Vid, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = self.ec_block()?;
        vid.encode(&mut buf[self.ec.vid_hdr_offset as usize..])?;
        let data_offset = self.ec.data_offset as usize;
        buf[data_offset..data_offset + data.len()].copy_from_slice(data);

        self.program(pnum, &buf)
    }

    /// Write a whole volume, split into LEBs, to the given PEBs in order
    pub fn write_volume(
        &mut self,
        pebs: &[u32],
        vol_id: u32,
        vol_type: VolType,
        data: &[u8],
    ) -> anyhow::Result<()> {
        let chunks: Vec<&[u8]> = data.chunks(self.leb_size()).collect();
        anyhow::ensure!(chunks.len() <= pebs.len(), "not enough PEBs for the volume");

        for (lnum, (&pnum, chunk)) in pebs.iter().zip(chunks).enumerate() {
            let vid = Vid {
                vol_type,
                vol_id,
                lnum: lnum as u32,
                ..Default::default()
            };
            self.write_leb(pnum, vid, chunk)?;
        }

        Ok(())
    }

    /// Write LEB 0 of the layout volume, holding the given volume table records
    pub fn write_vtbl(
        &mut self,
        pnum: u32,
        records: &[(u32, VolTableRecord)],
    ) -> anyhow::Result<()> {
        let count = std::cmp::min(self.leb_size() / UBI_VTBL_RECORD_SIZE, UBI_MAX_VOLUMES);
        let mut table: Vec<Option<VolTableRecord>> = vec![None; count];
        for (id, record) in records {
            table[*id as usize] = Some(record.clone());
        }

        let mut data = Vec::with_capacity(count * UBI_VTBL_RECORD_SIZE);
        for record in table {
            data.append(&mut record.into_bytes()?);
        }

        let vid = Vid {
            vol_id: UBI_LAYOUT_VOLUME_ID,
            compat: UBI_LAYOUT_VOLUME_COMPAT,
            ..Default::default()
        };
        self.write_leb(pnum, vid, &data)?;
        Ok(())
    }

    /// Write only an EC header, as UBI leaves free PEBs
    pub fn write_ec_only(&mut self, pnum: u32) -> anyhow::Result<()> {
        let buf = self.ec_block()?;
        self.program(pnum, &buf)
    }

    /// Write something that isn't UBI at all
    pub fn write_junk(&mut self, pnum: u32) -> anyhow::Result<()> {
        self.program(pnum, b"JUNK, NOT AN EC HEADER")
    }

    pub fn build(self) -> SimNand {
        self.nand
    }

    /// A block-sized buffer of erased bytes, with the EC header in place
    fn ec_block(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0xFF; self.nand.get_layout().block_size()];
        self.ec.encode(&mut buf)?;
        Ok(buf)
    }

    fn program(&mut self, pnum: u32, content: &[u8]) -> anyhow::Result<()> {
        let block = self.nand.block_mut(pnum)?;
        block.erase();
        block.program(0, content)
    }
}
