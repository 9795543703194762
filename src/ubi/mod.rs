//! This module implements read-only access to UBI volumes, as needed to boot from them.
//!
//! UBI spreads each volume over "logical eraseblocks" (LEBs), each of which lives in some
//! "physical eraseblock" (PEB) of the NAND, in no particular order. The first writable page of
//! every PEB holds an "erase counter" ("EC") header, and a PEB that is in use also has a "volume
//! ID" ("VID") header saying which LEB of which volume it holds:
//!
//! ```text
//! +- PEB 5 ------+   +- PEB 2 ------+   +- PEB 9 ------+
//! | EC header    |   | EC header    |   | EC header    |
//! | VID: 3:1     |   | VID: 3:0     |   | VID: 3:0     |
//! | sqnum 41     |   | sqnum 12     |   | sqnum 40     |
//! | data...      |   | data...      |   | data...      |
//! +--------------+   +--------------+   +--------------+
//! ```
//!
//! Attaching (see [Ubi::attach]) therefore goes:
//! 1. Scan: read the headers of every PEB, noting which LEB each holds.
//! 2. Resolve duplicates: when two PEBs claim the same LEB (PEBs 2 and 9 above), the one with the
//!    higher sequence number is newer and wins, unless it was written as a copy and its data
//!    doesn't check out.
//! 3. Link: chain each LEB to the PEB holding the next LEB of the same volume.
//! 4. Load the volume table from the internal layout volume, so volumes can be found by name.
//!
//! Nothing is ever written, and nothing short of a bad `Nand` implementation makes attaching
//! fail: whatever can't be read is left out.

mod directory;
mod error;
mod headers;
mod link;
mod read;
mod scan;
#[cfg(test)]
mod testutil;
mod vtbl;

pub use directory::{Chain, Loaded, Ubi, UbiConfig};
pub use error::{HeaderError, ReadError, UbiError};
pub use headers::{Ec, VolTableRecord, VolType, Vid, UBI_CRC};
pub use read::{read_leb, read_leb_range, LebOffset};
pub use scan::{read_headers, Peb, HEADER_SCRATCH_PAGES, UNUSED};

/// The number of user volumes the volume table can describe
pub const UBI_MAX_VOLUMES: usize = 128;

/// Volume IDs from here up are reserved for UBI's own use
pub const UBI_INTERNAL_VOL_START: u32 = 0x7FFF_FFFF - 4096;

/// The internal volume holding the volume table
pub const UBI_LAYOUT_VOLUME_ID: u32 = UBI_INTERNAL_VOL_START;

pub const UBI_LAYOUT_VOLUME_NAME: &str = "layout volume";
