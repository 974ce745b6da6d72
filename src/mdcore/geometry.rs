//! Geometry primitives (spec.md §2 "dependency order: geometry primitives
//! first", §3 Map invariant, §4.3 step 1/3/4).
//!
//! Name/value tables grounded directly on `examples/original_source/maps.c`
//! (`pers`, `r5layout`, `r0layout`): those are literally the tables a real
//! `mdadm` build ships, so `parse_level`/`parse_layout` reproduce them
//! instead of inventing a new vocabulary.

use crate::mdcore::error::MdError;
use crate::mdcore::types::Sector;
use anyhow::{anyhow, Result};

pub const RESERVED_SECTORS: Sector = 8192;
pub const MIB: Sector = 2048; // 512-byte sectors per MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
    Container,
}

impl RaidLevel {
    /// `pers[]` in maps.c: numeric names a user or an on-disk field may use.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "raid0" | "0" | "stripe" => Ok(RaidLevel::Raid0),
            "raid1" | "1" | "mirror" => Ok(RaidLevel::Raid1),
            "raid5" | "5" => Ok(RaidLevel::Raid5),
            "raid6" | "6" => Ok(RaidLevel::Raid6),
            "raid10" | "10" => Ok(RaidLevel::Raid10),
            "container" => Ok(RaidLevel::Container),
            other => Err(MdError::Config(format!("unrecognised raid level {:?}", other)).into()),
        }
    }

    /// On-disk IMSM raid_level byte (spec.md §4.2 "Level encoding": the hard
    /// set `{0,1,5,10}` — RAID6 has no IMSM map encoding of its own and is
    /// refused by `validate_geometry` for that format).
    pub fn imsm_byte(self) -> Option<u8> {
        match self {
            RaidLevel::Raid0 => Some(0),
            RaidLevel::Raid1 => Some(1),
            RaidLevel::Raid5 => Some(5),
            RaidLevel::Raid10 => Some(10),
            RaidLevel::Raid6 | RaidLevel::Container => None,
        }
    }

    /// Hard-wired member-count bounds (spec.md §4.2, no platform override).
    pub fn member_count_bounds(self, orom_max: Option<u32>) -> (u32, u32) {
        match self {
            RaidLevel::Raid0 => (2, orom_max.unwrap_or(u32::MAX)),
            RaidLevel::Raid1 => (2, 2),
            RaidLevel::Raid5 => (3, 6),
            RaidLevel::Raid6 => (4, 256),
            RaidLevel::Raid10 => (4, 10),
            RaidLevel::Container => (0, u32::MAX),
        }
    }

    pub fn valid_member_count(self, n: u32, orom_max: Option<u32>) -> bool {
        match self {
            RaidLevel::Raid10 => matches!(n, 4 | 6 | 8 | 10),
            other => {
                let (lo, hi) = other.member_count_bounds(orom_max);
                n >= lo && n <= hi
            }
        }
    }

    /// Level <= 0 (RAID0, and any future linear/container level) forbids
    /// spares (spec.md §4.3 step 1; `examples/original_source/Create.c:561`
    /// `if (s->level <= 0 && s->sparedisks)` -> error).
    pub fn allows_spares(self) -> bool {
        !matches!(self, RaidLevel::Container | RaidLevel::Raid0)
    }

    pub fn requires_chunk(self) -> bool {
        matches!(self, RaidLevel::Raid0 | RaidLevel::Raid5 | RaidLevel::Raid6 | RaidLevel::Raid10)
    }

    pub fn forbids_chunk(self) -> bool {
        matches!(self, RaidLevel::Raid1 | RaidLevel::Container)
    }

    /// Number of mirrored copies in a map (spec.md §3 Map "domain count").
    pub fn domain_count(self) -> u32 {
        match self {
            RaidLevel::Raid1 | RaidLevel::Raid10 => 2,
            _ => 1,
        }
    }

    /// Data-bearing member count for a given total member count, used by the
    /// `array_size` invariant in spec.md §3.
    pub fn data_members(self, n: u32) -> u32 {
        match self {
            RaidLevel::Raid0 => n,
            RaidLevel::Raid1 => 1,
            RaidLevel::Raid5 => n - 1,
            RaidLevel::Raid6 => n - 2,
            RaidLevel::Raid10 => n / self.domain_count(),
            RaidLevel::Container => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    LeftAsymmetric,
    RightAsymmetric,
    LeftSymmetric,
    RightSymmetric,
    NearCopies2,
    Raid0Original,
    Raid0AltMultizone,
}

impl Layout {
    /// Default layout per level (spec.md §4.3 step 4).
    pub fn default_for(level: RaidLevel) -> Option<Self> {
        match level {
            RaidLevel::Raid5 | RaidLevel::Raid6 => Some(Layout::LeftSymmetric),
            RaidLevel::Raid10 => Some(Layout::NearCopies2),
            RaidLevel::Raid0 => Some(Layout::Raid0Original),
            _ => None,
        }
    }
}

/// Default chunk size in KiB when the caller doesn't specify one
/// (spec.md §4.3 step 3, "typically 128 KiB, clamped to platform max").
pub const DEFAULT_CHUNK_KIB: u32 = 128;

pub fn default_chunk_kib(platform_max_kib: Option<u32>) -> u32 {
    match platform_max_kib {
        Some(max) if max < DEFAULT_CHUNK_KIB => max,
        _ => DEFAULT_CHUNK_KIB,
    }
}

/// Round `blocks_per_member` down so that `array_size` lands on a whole
/// MiB-per-member multiple (spec.md §3 Map invariant).
pub fn array_size(level: RaidLevel, n_members: u32, blocks_per_member: Sector) -> Sector {
    let data = level.data_members(n_members) as Sector;
    let rounded_per_member = (blocks_per_member / MIB) * MIB;
    rounded_per_member * data
}

/// Reconstructs `num_data_stripes` from geometry (spec.md §3).
pub fn num_data_stripes(blocks_per_member: Sector, domains: u32, blocks_per_strip: Sector) -> Sector {
    blocks_per_member / domains as Sector / blocks_per_strip
}

/// spec.md §3 Map invariant's reconciliation rule for metadata written by
/// older code: trust the larger of the two readings only within a bounded
/// drift, else trust `blocks_per_member` and recompute the stripe count.
pub fn reconcile_array_size(
    level: RaidLevel,
    n_members: u32,
    stored_array_size: Sector,
    blocks_per_member: Sector,
) -> (Sector, bool) {
    let data = level.data_members(n_members) as Sector;
    let reconstructed = (blocks_per_member / MIB) * MIB * data;
    if stored_array_size == reconstructed {
        return (stored_array_size, false);
    }
    let diff = stored_array_size.abs_diff(reconstructed);
    let tolerance = 2048 * data;
    if diff <= tolerance {
        (stored_array_size.max(reconstructed), false)
    } else {
        (reconstructed, true)
    }
}

/// Validate device/level/chunk/size combination (spec.md §4.3 steps 1-4),
/// returning the chunk size (in 512-byte sectors) to use.
pub fn validate_chunk(level: RaidLevel, chunk_kib: Option<u32>, platform_max_kib: Option<u32>) -> Result<Option<Sector>> {
    if level.forbids_chunk() {
        if chunk_kib.is_some() {
            return Err(MdError::Config(format!("{:?} does not take a chunk size", level)).into());
        }
        return Ok(None);
    }
    if level.requires_chunk() {
        let kib = chunk_kib.unwrap_or_else(|| default_chunk_kib(platform_max_kib));
        if kib == 0 || kib & (kib - 1) != 0 {
            return Err(MdError::Geometry(format!("chunk size {}KiB is not a power of two", kib)).into());
        }
        return Ok(Some((kib as Sector) * 2));
    }
    Ok(chunk_kib.map(|k| (k as Sector) * 2))
}

pub fn validate_device_count(
    level: RaidLevel,
    raid_disks: u32,
    spares: u32,
    journal_disks: u32,
    orom_max: Option<u32>,
) -> Result<()> {
    if !level.allows_spares() && spares > 0 {
        return Err(MdError::Config(format!("{:?} cannot take spares", level)).into());
    }
    if !level.valid_member_count(raid_disks, orom_max) {
        let (lo, hi) = level.member_count_bounds(orom_max);
        return Err(MdError::Geometry(format!(
            "{:?} needs between {} and {} devices, got {}",
            level, lo, hi, raid_disks
        ))
        .into());
    }
    let _ = journal_disks;
    Ok(())
}

pub fn round_down(value: Sector, unit: Sector) -> Sector {
    if unit == 0 {
        return value;
    }
    (value / unit) * unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raid5_data_members_is_n_minus_one() {
        assert_eq!(RaidLevel::Raid5.data_members(4), 3);
    }

    #[test]
    fn raid10_rejects_odd_member_counts() {
        assert!(!RaidLevel::Raid10.valid_member_count(5, None));
        assert!(RaidLevel::Raid10.valid_member_count(4, None));
    }

    #[test]
    fn array_size_rounds_down_to_mib_per_member() {
        // 100 blocks short of a MiB boundary must be dropped.
        let bpm = 10 * MIB + 100;
        let size = array_size(RaidLevel::Raid5, 4, bpm);
        assert_eq!(size % MIB, 0);
        assert_eq!(size, 10 * MIB * 3);
    }

    #[test]
    fn reconcile_prefers_blocks_per_member_past_tolerance() {
        let level = RaidLevel::Raid5;
        let bpm = 100 * MIB;
        let reconstructed = (bpm / MIB) * MIB * level.data_members(4) as Sector;
        let (value, drifted) = reconcile_array_size(level, 4, reconstructed + 100_000, bpm);
        assert!(drifted);
        assert_eq!(value, reconstructed);
    }

    #[test]
    fn reconcile_accepts_small_drift() {
        let level = RaidLevel::Raid5;
        let bpm = 100 * MIB;
        let reconstructed = (bpm / MIB) * MIB * level.data_members(4) as Sector;
        let (value, drifted) = reconcile_array_size(level, 4, reconstructed + 10, bpm);
        assert!(!drifted);
        assert_eq!(value, reconstructed.max(reconstructed + 10));
    }

    #[test]
    fn chunk_required_for_raid5_defaults_to_128kib() {
        let chunk = validate_chunk(RaidLevel::Raid5, None, None).unwrap();
        assert_eq!(chunk, Some(256)); // 128 KiB == 256 sectors
    }

    #[test]
    fn chunk_forbidden_for_raid1() {
        assert!(validate_chunk(RaidLevel::Raid1, Some(64), None).is_err());
    }
}
