//! Error types for attaching and reading UBI.
//!
//! Only [UbiError] ever reaches a caller of the directory API; the others are absorbed (and
//! logged) at the point where a block or LEB is skipped.

use thiserror::Error;

/// Why a PEB's EC or VID header could not be used
#[derive(Debug, Error)]
pub enum HeaderError {
    /// The magic reads as erased (or blank) flash; the normal state of an unused block
    #[error("header area is erased")]
    Erased,

    #[error("bad header magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("unsupported header version {found}")]
    BadVersion { found: u8 },

    #[error("bad header CRC (stored {stored:#010x}, computed {computed:#010x})")]
    BadCrc { stored: u32, computed: u32 },

    /// The header bytes could not be interpreted (e.g. an unknown volume type)
    #[error("malformed header")]
    Malformed,

    #[error("media error: {0}")]
    Media(#[source] anyhow::Error),
}

impl HeaderError {
    /// Does this indicate damaged content, as opposed to unused flash or a media failure?
    ///
    /// Only corruption is worth a warning; erased blocks are the expected empty case.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. } | Self::BadVersion { .. } | Self::BadCrc { .. } | Self::Malformed
        )
    }
}

/// Why the payload of a LEB could not be read
#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error("media error: {0}")]
    Media(#[source] anyhow::Error),

    /// The headers describe offsets that do not fit in the eraseblock
    #[error("headers inconsistent with the flash geometry")]
    Layout,

    #[error("bad data CRC (stored {stored:#010x}, computed {computed:#010x})")]
    DataCrc { stored: u32, computed: u32 },

    #[error("no data could be read")]
    Empty,
}

/// Errors reported by the volume directory
#[derive(Debug, Error, Eq, PartialEq)]
pub enum UbiError {
    #[error("volume {0} not found")]
    VolumeNotFound(u32),

    #[error("volume \"{0}\" not found")]
    NameNotFound(String),

    #[error("no data could be read from volume {0}")]
    NoData(u32),
}
