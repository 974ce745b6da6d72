//! Core library surface: a `Container` owns an arena of `Disk`s and
//! `Volume`s indexed by integer id rather than the pointer graph a C
//! implementation builds, per the Design Notes these modules were expanded
//! from (spec.md §9: "model state as arena-indexed structs, not a handler
//! pointer graph").

pub mod config;
pub mod create;
pub mod error;
pub mod extents;
pub mod geometry;
pub mod handler;
pub mod imsm;
pub mod incremental;
pub mod monitor;
pub mod namemap;
pub mod reshape;
pub mod types;

use crate::mdcore::handler::{ContainerSuper, MetadataHandler as _};
use crate::mdcore::imsm::ImsmHandler;
use anyhow::Result;

/// Picks the one handler whose `match_by_descriptor` recognizes the bytes at
/// a container's anchor offset. Only one format exists today
/// (`MetadataFormat::Imsm`); the loop shape is what makes adding a second
/// format later a one-line addition to `HANDLERS` instead of a rewrite.
pub fn load_any_super(anchor_bytes: &[u8], native_sector_size: u32) -> Result<ContainerSuper> {
    let handler = ImsmHandler;
    if handler.match_by_descriptor(anchor_bytes) {
        return handler.load_super(anchor_bytes, native_sector_size);
    }
    Err(error::MdError::MetadataInvariant("no handler recognises this anchor".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_any_super_rejects_garbage() {
        let garbage = vec![0u8; 64];
        assert!(load_any_super(&garbage, 512).is_err());
    }
}
