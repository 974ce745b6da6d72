//! Small domain type aliases shared by the geometry, extent and IMSM codec
//! modules. Kept separate (as the teacher's module layout implies a
//! `rfs_lib::types` module even though that file never made it into the
//! snapshot) so every module agrees on what a bare `u64` *means*.

/// A logical 512-byte sector count, sector-size-agnostic (spec.md §4.2
/// "Sector-size dualism" — on-disk fields are native-sector-sized, in-memory
/// values are always expressed in this canonical unit).
pub type Sector = u64;

/// A disk's stable ordinal inside a container's disk arena, or one of the
/// two sentinel values `-1` (bare spare) / `-2` (failed/unknown slot).
pub type DiskOrdinal = i32;

pub const DISK_ORDINAL_SPARE: DiskOrdinal = -1;
pub const DISK_ORDINAL_MISSING: DiskOrdinal = -2;

/// A little-endian `u32` split as two `u16` halves on disk never appears in
/// this codec (that's the IMSM 64-bit `_lo`/`_hi` split, handled directly in
/// `imsm::split64`/`imsm::join64`); this alias just documents where a raw
/// on-disk half-word is meant to be read as unsigned 16-bit.
pub type RawHalf = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FamilyNumber(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VolumeId(pub u16);
