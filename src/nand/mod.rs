//! Abstractions and code to access NAND flash
//!
//! The boot path never writes flash, so the [Nand] and [NandBlock] traits are read-only. The
//! simulated NAND still supports programming, but only through its own inherent methods, which
//! is how test images and image files get built.

use std::io::Read;
use std::str::FromStr;

use anyhow::ensure;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    /// The number of bytes in one eraseblock
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        ensure!(pages_per_block > 0, "a block needs at least one page");
        ensure!(bytes_per_page > 0, "a page needs at least one byte");

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

/// Represents a NAND flash device, as seen by a reader
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// How many bytes in this block?
    fn size(&self) -> usize {
        self.page_size() * self.page_count() as usize
    }
}

/// A simulated in-memory NAND flash, backing tests and NAND image files
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Every byte of the block, 0xFF where erased
    data: Box<[u8]>,

    page_size: usize,

    /// Pages below this one can't be programmed again until the block is erased
    next_page: u32,

    marked_bad: bool,

    /// Pages that fail to read, simulating uncorrectable ECC errors
    unreadable: Vec<u32>,
}

impl SimNand {
    /// Create a fully-erased SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize].into_boxed_slice();
        Self { blocks, layout }
    }

    /// Fill the NAND with a raw image, one whole block after another
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        for block in self.blocks.iter_mut() {
            block.erase();
            block.marked_bad = false;
            read.read_exact(&mut block.data)?;
            if !block.data.is_erased() {
                block.next_page = block.page_count();
            }
        }

        Ok(())
    }

    /// Get mutable access to a block (even a bad one), to set up its content
    pub fn block_mut(&mut self, index: u32) -> anyhow::Result<&mut SimBlock> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
    }
}

impl SimBlock {
    fn new(layout: NandLayout) -> Self {
        Self {
            data: vec![0xFF; layout.block_size()].into_boxed_slice(),
            page_size: layout.bytes_per_page,
            next_page: 0,
            marked_bad: false,
            unreadable: Vec::new(),
        }
    }

    fn page_count(&self) -> u32 {
        (self.data.len() / self.page_size) as u32
    }

    /// Program `content` starting at `start_page`, padding a partial last page with 0xFF.
    ///
    /// Pages must be programmed in increasing order, as MLC NAND requires: programming a page
    /// makes it and every page before it unprogrammable until the next erase.
    pub fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(
            start_page >= self.next_page,
            "page {start_page} is behind already-programmed page {}",
            self.next_page
        );

        let begin = start_page as usize * self.page_size;
        let area = self
            .data
            .get_mut(begin..begin + content.len())
            .ok_or(anyhow::anyhow!("program beyond the end of the block"))?;
        area.copy_from_slice(content);

        self.next_page = start_page + content.len().div_ceil(self.page_size) as u32;
        Ok(())
    }

    /// Erase the block, making all pages programmable (and readable) again
    pub fn erase(&mut self) {
        self.data.fill(0xFF);
        self.next_page = 0;
        self.unreadable.clear();
    }

    /// Mark the block bad; it can no longer be obtained through [Nand::block]
    pub fn mark_bad(&mut self) {
        self.erase();
        self.marked_bad = true;
    }

    /// Make a page fail every subsequent read, until the block is erased
    pub fn fail_page(&mut self, page: u32) {
        self.unreadable.push(page);
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a SimBlock;

    fn block(&self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &SimBlock {
    fn page_count(&self) -> u32 {
        SimBlock::page_count(self)
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() % self.page_size == 0, "content not page-sized");

        let pages = (content.len() / self.page_size) as u32;
        let end_page = start_page + pages;
        if let Some(page) = self.unreadable.iter().find(|&&x| (start_page..end_page).contains(&x)) {
            anyhow::bail!("uncorrectable error in page {page}");
        }

        let begin = start_page as usize * self.page_size;
        let pages = self
            .data
            .get(begin..begin + content.len())
            .ok_or(anyhow::anyhow!("pages {start_page}..{end_page} out of bounds"))?;
        content.copy_from_slice(pages);
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
};

#[test]
fn test_sim_block() {
    let nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block_mut(0).unwrap().mark_bad();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_program_read() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page + 10];
    let mut data_out = vec![0u8; TEST_LAYOUT.bytes_per_page * 2];

    let block = nand.block_mut(0).unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(3, &data_in).is_err());
    assert!(block.program(15, &data_in).is_err());
    block.program(4, b"next").unwrap();

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out[..data_in.len()], data_in);
    assert!(data_out[data_in.len()..].is_erased());

    assert!(block.read(15, &mut data_out).is_err());
    assert!(block.read(0, &mut [0u8; 100]).is_err());

    let block = nand.block_mut(0).unwrap();
    block.erase();
    block.program(0, &data_in).unwrap();
}

#[test]
fn test_sim_unreadable_page() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block_mut(3).unwrap().fail_page(1);

    let mut buf = vec![0u8; TEST_LAYOUT.bytes_per_page * 2];
    let block = nand.block(3).unwrap().unwrap();
    assert!(block.read(0, &mut buf).is_err());
    assert!(block.read(2, &mut buf).is_ok());

    nand.block_mut(3).unwrap().erase();
    let block = nand.block(3).unwrap().unwrap();
    assert!(block.read(0, &mut buf).is_ok());
}

#[test]
fn test_sim_load() {
    let block_size = TEST_LAYOUT.block_size();
    let mut image = vec![0x55u8; block_size * TEST_LAYOUT.blocks as usize];
    image[block_size..][..block_size].fill(0xFF);

    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block_mut(2).unwrap().mark_bad();
    nand.load(&mut image.as_slice()).unwrap();

    let mut buf = vec![0u8; block_size];
    let block = nand.block(2).unwrap().expect("loading clears bad marks");
    block.read(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&x| x == 0x55u8));

    // Loaded content is final, but blocks that loaded erased can still be programmed
    assert!(nand.block_mut(0).unwrap().program(0, &[0]).is_err());
    assert!(nand.block_mut(1).unwrap().program(0, &[0]).is_ok());

    let mut short = &image[..block_size * 3];
    assert!(SimNand::new(TEST_LAYOUT).load(&mut short).is_err());
}

#[test]
fn test_layout_from_str() {
    let layout: NandLayout = "8x16x256".parse().unwrap();
    assert_eq!(layout, TEST_LAYOUT);
    assert_eq!(layout.block_size(), 4096);
    assert!("8x16".parse::<NandLayout>().is_err());
    assert!("8x0x256".parse::<NandLayout>().is_err());
}
