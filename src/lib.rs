//! Read-only UBI access for boot loaders: attach to a UBI partition on raw NAND, find volumes by
//! ID or name, and load their contents.

pub mod image;
pub mod nand;
pub mod ubi;
