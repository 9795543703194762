//! Read-only NAND access through the Linux MTD subsystem
//!
//! The kernel's MTD driver does the ECC; a page it can't correct comes back as `EBADMSG`, which
//! is reported as a read error, so that UBI treats the LEB as unreadable.

use super::{Nand, NandBlock, NandLayout};

use anyhow::{anyhow, bail, ensure};
use log::debug;
use nix::errno::Errno;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::{Path, PathBuf};

/// NAND flash behind a `/dev/mtdX` device, opened read-only
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

/// ECC statistics the kernel keeps per MTD device
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct EccStats {
    /// Bitflips corrected since boot
    pub corrected: u32,

    /// Uncorrectable reads since boot
    pub failed: u32,

    pub bad_blocks: u32,
}

/// Find the `/dev` path of the MTD device named `name` in a listing formatted like `/proc/mtd`:
///
/// ```text
/// dev:    size   erasesize  name
/// mtd0: 00100000 00020000 "boot"
/// mtd1: 07f00000 00020000 "ubi"
/// ```
fn find_named<R: BufRead>(proc_mtd: R, name: &str) -> anyhow::Result<PathBuf> {
    let quoted = format!("\"{name}\"");

    for line in proc_mtd.lines() {
        let line = line?;
        let Some((dev, rest)) = line.split_once(':') else {
            continue;
        };

        if rest.trim_end().ends_with(&quoted) {
            return Ok(Path::new("/dev").join(dev));
        }
    }

    bail!("MTD device {quoted} could not be found");
}

impl MtdNand {
    /// Open an MTD device by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path.as_ref())?;
        let info = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        };
        let layout = info.try_into()?;
        debug!("Opened {}: {layout:?}", path.as_ref().display());

        Ok(Self { file, layout })
    }

    /// Open an MTD device (or partition) by name, as listed in `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        let proc_mtd = BufReader::new(File::open("/proc/mtd")?);
        Self::open(find_named(proc_mtd, name)?)
    }

    /// Ask the kernel whether a block is marked bad
    fn is_bad(&self, index: u32) -> anyhow::Result<bool> {
        let offset = self.layout.block_size() as u64 * u64::from(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &offset)? };
        Ok(bad != 0)
    }

    /// Get the kernel's ECC statistics for this device
    pub fn ecc_stats(&self) -> anyhow::Result<EccStats> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            stats.assume_init()
        };

        Ok(EccStats {
            corrected: stats.corrected,
            failed: stats.failed,
            bad_blocks: stats.badblocks,
        })
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        match self.is_bad(index)? {
            true => Ok(None),
            false => Ok(Some(MtdBlock { nand: self, index })),
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

/// A good block of an [MtdNand]
pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let pages = content.len() / self.page_size();
        ensure!(
            content.len() % self.page_size() == 0,
            "buffer not multiple of page size"
        );
        ensure!(
            start_page as usize + pages <= self.page_count() as usize,
            "block {}, pages {start_page}..+{pages} out of bounds",
            self.index
        );

        let offset = self.size() as u64 * u64::from(self.index)
            + self.page_size() as u64 * u64::from(start_page);

        match self.nand.file.read_exact_at(content, offset) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EBADMSG as i32) => Err(anyhow!(
                "uncorrectable ECC error in block {}, pages {start_page}..+{pages}",
                self.index
            )),
            Err(e) => Err(e.into()),
        }
    }
}

mod ioctl {
    //! The MTD ioctls needed for reading

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryFrom<mtd_info_user> for NandLayout {
        type Error = anyhow::Error;

        fn try_from(info: mtd_info_user) -> anyhow::Result<Self> {
            // mtdram reports byte-sized pages; treat those as 64-byte pages
            let writesize = match info.writesize {
                1 => 64,
                x => x,
            };

            ensure!(
                info.erasesize != 0 && writesize != 0,
                "MTD reports zero-sized eraseblocks or pages"
            );
            ensure!(
                info.size % info.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                info.erasesize % writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            Ok(NandLayout {
                blocks: info.size / info.erasesize,
                pages_per_block: info.erasesize / writesize,
                bytes_per_page: writesize as usize,
            })
        }
    }

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
