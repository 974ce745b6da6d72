//! IMSM on-disk format codec (spec.md §4.2). Bit-exact layout, checksum,
//! attribute negotiation, migration record and bad-block log placement.
//!
//! Fixed-size sections are `#[repr(C)]` structs overlaid directly on the
//! anchor buffer with `zerocopy`, the safe replacement for the
//! `unsafe { serialize_row/deserialize_row }` pointer casts the teacher
//! (`rfs_lib::utils`) used for its ext2 structures. Variable-length sections
//! (ordinal tables, bad-block entries) are appended by hand after the fixed
//! prefix, the same way the teacher appends `i_block` indirection data.

use crate::mdcore::error::MdError;
use crate::mdcore::geometry::RaidLevel;
use crate::mdcore::handler::{
    ContainerSuper, MetadataFormat, MetadataHandler, SpareCriteria, SuperOrdering, UpdateKind, VolumeInfo,
};
use crate::mdcore::types::Sector;
use anyhow::{anyhow, Context, Result};
use disk_driver::{DiskDriver, SeekType};
use zerocopy::{AsBytes, FromBytes};

pub const SIGNATURE: &[u8; 24] = b"Intel Raid ISM Cfg Sig. ";
pub const VERSION_1_3: &[u8; 8] = b"1.3.00\0\0";
pub const VERSION_2_0_JOURNAL: &[u8; 8] = b"2.0.00\0\0";

pub const MPB_SECTOR_CNT: Sector = 2;
pub const RESERVED_SECTORS: Sector = crate::mdcore::geometry::RESERVED_SECTORS;
pub const MULTIPLE_PPL_AREA: u64 = 1024 * 1024; // ~1 MiB per member bitmap/PPL reservation window
pub const BBM_LOG_SIGNATURE: u32 = 0xabadb10c;
pub const BBM_MAX_ENTRIES: usize = 254;
pub const BBM_MAX_SECTORS_PER_ENTRY: u32 = 256;

// ---------------------------------------------------------------------
// Attribute flags (spec.md §4.2 "Attribute flags")
// ---------------------------------------------------------------------

pub mod attr {
    pub const CHECKSUM_VERIFY: u32 = 1 << 0;
    pub const TWO_TB: u32 = 1 << 1;
    pub const TWO_TB_DISK: u32 = 1 << 2;
    pub const RAID0: u32 = 1 << 3;
    pub const RAID1: u32 = 1 << 4;
    pub const RAID10: u32 = 1 << 5;
    pub const RAID5: u32 = 1 << 6;
    pub const EXPANDED_STRIPE_SIZE: u32 = 1 << 7;
    pub const RAID10_EXT: u32 = 1 << 8;
    pub const BBM: u32 = 1 << 9;
    pub const NEVER_USE: u32 = 1 << 31;

    pub const SUPPORTED: u32 = CHECKSUM_VERIFY
        | TWO_TB
        | TWO_TB_DISK
        | RAID0
        | RAID1
        | RAID10
        | RAID5
        | EXPANDED_STRIPE_SIZE
        | RAID10_EXT
        | BBM;
    pub const IGNORED: u32 = NEVER_USE;
}

/// spec.md §4.2: "The handler accepts a super only if
/// `(attributes & ~(SUPPORTED | IGNORED)) == 0`".
pub fn attributes_supported(attributes: u32) -> bool {
    attributes & !(attr::SUPPORTED | attr::IGNORED) == 0
}

// ---------------------------------------------------------------------
// 64-bit size split (spec.md §4.2 "Size split")
// ---------------------------------------------------------------------

pub fn split64(v: u64) -> (u32, u32) {
    (v as u32, (v >> 32) as u32)
}

pub fn join64(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

/// "Clear high bits" pass: when `2tb_disk` isn't set, `_hi` halves are forced
/// to zero on load.
pub fn clear_high_if_unsupported(attributes: u32, hi: u32) -> u32 {
    if attributes & attr::TWO_TB_DISK == 0 {
        0
    } else {
        hi
    }
}

// ---------------------------------------------------------------------
// Sector-size dualism (spec.md §4.2, §8 round-trip laws)
// ---------------------------------------------------------------------

/// On-disk numeric fields are expressed in the member's native sector size;
/// in-memory values are always canonical 512-byte sectors. 4K-native devices
/// store values 8x smaller than their 512-byte-view equivalent.
pub fn to_native(value_512: u64, native_sector_size: u32) -> u64 {
    match native_sector_size {
        4096 => value_512 / 8,
        _ => value_512,
    }
}

pub fn from_native(value_native: u64, native_sector_size: u32) -> u64 {
    match native_sector_size {
        4096 => value_native * 8,
        _ => value_native,
    }
}

// ---------------------------------------------------------------------
// Anchor header
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct AnchorHeader {
    pub sig: [u8; 24],
    pub version: [u8; 8],
    pub check_sum: u32,
    pub mpb_size: u32,
    pub family_num: u32,
    pub orig_family_num: u32,
    pub generation_num: u32,
    pub attributes: u32,
    pub num_disks: u8,
    pub num_raid_devs: u8,
    pub error_log_entries: u8,
    pub filler: u8,
    pub bbm_log_size: u32,
}

impl AnchorHeader {
    pub const SIZE: usize = std::mem::size_of::<AnchorHeader>();

    pub fn new(family_num: u32, orig_family_num: u32) -> Self {
        Self {
            sig: *SIGNATURE,
            version: *VERSION_1_3,
            check_sum: 0,
            mpb_size: Self::SIZE as u32,
            family_num,
            orig_family_num,
            generation_num: 0,
            attributes: attr::CHECKSUM_VERIFY | attr::RAID0 | attr::RAID1 | attr::RAID5 | attr::RAID10 | attr::BBM,
            num_disks: 0,
            num_raid_devs: 0,
            error_log_entries: 0,
            filler: 0,
            bbm_log_size: 0,
        }
    }

    pub fn signature_valid(&self) -> bool {
        self.sig == *SIGNATURE && (self.version == *VERSION_1_3 || self.version == *VERSION_2_0_JOURNAL)
    }
}

/// 32-bit truncated sum of little-endian 32-bit words over `buf`, with the
/// stored checksum field contribution subtracted out (spec.md §4.2
/// "Checksum").
pub fn checksum(buf: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for chunk in buf.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum = sum.wrapping_add(u32::from_le_bytes(word));
    }
    sum
}

/// Compute the checksum of a full anchor buffer whose embedded `check_sum`
/// field currently holds `stored_value`; equivalent to computing over the
/// buffer with `check_sum` zeroed, per spec.md §4.2.
pub fn checksum_excluding_stored(buf: &[u8], stored_value: u32) -> u32 {
    checksum(buf).wrapping_sub(stored_value)
}

// ---------------------------------------------------------------------
// Disk record (spec.md §3 "Disk (in a Container)")
// ---------------------------------------------------------------------

pub mod disk_state {
    pub const SPARE: u32 = 1 << 0;
    pub const CONFIGURED: u32 = 1 << 1;
    pub const FAILED: u32 = 1 << 2;
    pub const JOURNAL: u32 = 1 << 3;
    /// Not an on-disk IMSM bit (IMSM has no such field) — admission-time
    /// bookkeeping only, set when a homehost mismatch degrades trust to
    /// "foreign" instead of rejecting the device (spec.md §4.4 step 3). It
    /// only affects later naming (a suffix `_N` on collision), never quorum.
    pub const FOREIGN: u32 = 1 << 4;
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct DiskRecordRaw {
    pub serial: [u8; 16],
    pub total_blocks_lo: u32,
    pub total_blocks_hi: u32,
    pub scsi_id: u32,
    pub status: u32,
}

impl DiskRecordRaw {
    pub const SIZE: usize = std::mem::size_of::<DiskRecordRaw>();
}

#[derive(Debug, Clone)]
pub struct Disk {
    /// Printable serial, already trimmed and `:` -> `;` remapped at admission.
    pub serial: String,
    pub total_blocks: Sector,
    pub scsi_id: u32,
    pub status: u32,
}

impl Disk {
    pub fn encode(&self, native_sector_size: u32, attributes: u32) -> DiskRecordRaw {
        let mut serial = [0u8; 16];
        let bytes = self.serial.as_bytes();
        let n = bytes.len().min(16);
        serial[..n].copy_from_slice(&bytes[..n]);
        let native_blocks = to_native(self.total_blocks, native_sector_size);
        let (lo, hi) = split64(native_blocks);
        let hi = if attributes & attr::TWO_TB_DISK != 0 { hi } else { 0 };
        DiskRecordRaw {
            serial,
            total_blocks_lo: lo,
            total_blocks_hi: hi,
            scsi_id: self.scsi_id,
            status: self.status,
        }
    }

    pub fn decode(raw: &DiskRecordRaw, native_sector_size: u32, attributes: u32) -> Self {
        let end = raw.serial.iter().position(|&b| b == 0).unwrap_or(16);
        let serial = String::from_utf8_lossy(&raw.serial[..end]).to_string();
        let hi = clear_high_if_unsupported(attributes, raw.total_blocks_hi);
        let native_blocks = join64(raw.total_blocks_lo, hi);
        Disk {
            serial,
            total_blocks: from_native(native_blocks, native_sector_size),
            scsi_id: raw.scsi_id,
            status: raw.status,
        }
    }

    /// Normalize a device-reported serial per spec.md §3: trim whitespace,
    /// remap `:` to `;`.
    pub fn normalize_serial(raw: &str) -> String {
        raw.trim().chars().map(|c| if c == ':' { ';' } else { c }).collect()
    }
}

// ---------------------------------------------------------------------
// Map (spec.md §3 "Map")
// ---------------------------------------------------------------------

pub mod map_state {
    pub const UNINITIALIZED: u8 = 0;
    pub const NORMAL: u8 = 1;
    pub const DEGRADED: u8 = 2;
    pub const FAILED: u8 = 3;
}

pub const FAILED_DISK_NONE: u32 = 0xFFFF_FFFF;
pub const NEEDS_REBUILD_BIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct MapFixedRaw {
    pub pba_of_lba0_lo: u32,
    pub pba_of_lba0_hi: u32,
    pub blocks_per_member_lo: u32,
    pub blocks_per_member_hi: u32,
    pub num_domains: u8,
    pub raid_level: u8,
    pub num_members: u8,
    pub map_state: u8,
    pub blocks_per_strip: u32,
    pub failed_disk_num: u32,
}

impl MapFixedRaw {
    pub const SIZE: usize = std::mem::size_of::<MapFixedRaw>();
}

#[derive(Debug, Clone)]
pub struct Map {
    pub pba_of_lba0: Sector,
    pub blocks_per_member: Sector,
    pub level: RaidLevel,
    pub num_domains: u8,
    pub num_members: u8,
    pub map_state: u8,
    pub blocks_per_strip: Sector,
    pub failed_disk_num: Option<u32>,
    /// slot index -> (container disk ordinal, needs_rebuild)
    pub ordinal_table: Vec<(u32, bool)>,
}

impl Map {
    pub fn encoded_size(num_members: usize) -> usize {
        MapFixedRaw::SIZE + num_members.saturating_sub(1) * 4
    }

    pub fn encode(&self, native_sector_size: u32, attributes: u32) -> (MapFixedRaw, Vec<u8>) {
        let (pba_lo, pba_hi) = split64(to_native(self.pba_of_lba0, native_sector_size));
        let (bpm_lo, bpm_hi) = split64(to_native(self.blocks_per_member, native_sector_size));
        let keep_hi = attributes & attr::TWO_TB_DISK != 0;
        let raw = MapFixedRaw {
            pba_of_lba0_lo: pba_lo,
            pba_of_lba0_hi: if keep_hi { pba_hi } else { 0 },
            blocks_per_member_lo: bpm_lo,
            blocks_per_member_hi: if keep_hi { bpm_hi } else { 0 },
            num_domains: self.num_domains,
            raid_level: self.level.imsm_byte().unwrap_or(0),
            num_members: self.num_members,
            map_state: self.map_state,
            blocks_per_strip: to_native(self.blocks_per_strip, native_sector_size) as u32,
            failed_disk_num: self.failed_disk_num.unwrap_or(FAILED_DISK_NONE),
        };
        let mut table_bytes = Vec::with_capacity(self.ordinal_table.len() * 4);
        for (ordinal, rebuild) in &self.ordinal_table {
            let mut word = *ordinal;
            if *rebuild {
                word |= NEEDS_REBUILD_BIT;
            }
            table_bytes.extend_from_slice(&word.to_le_bytes());
        }
        (raw, table_bytes)
    }

    pub fn decode(raw: &MapFixedRaw, table_bytes: &[u8], native_sector_size: u32, attributes: u32) -> Result<Self> {
        let hi_pba = clear_high_if_unsupported(attributes, raw.pba_of_lba0_hi);
        let hi_bpm = clear_high_if_unsupported(attributes, raw.blocks_per_member_hi);
        let mut level = match raw.raid_level {
            0 => RaidLevel::Raid0,
            1 => RaidLevel::Raid1,
            5 => RaidLevel::Raid5,
            10 => RaidLevel::Raid10,
            other => return Err(MdError::MetadataInvariant(format!("unknown on-disk raid level byte {}", other)).into()),
        };
        // spec.md §4.2 "Level encoding": read-side normalization of the
        // legacy RAID1-as-RAID10 encoding. Write side is untouched.
        if level == RaidLevel::Raid1 && raw.num_members == 4 {
            level = RaidLevel::Raid10;
        }
        let mut ordinal_table = Vec::with_capacity(raw.num_members as usize);
        for chunk in table_bytes.chunks(4).take(raw.num_members as usize) {
            let mut word_bytes = [0u8; 4];
            word_bytes.copy_from_slice(chunk);
            let word = u32::from_le_bytes(word_bytes);
            let rebuild = word & NEEDS_REBUILD_BIT != 0;
            ordinal_table.push((word & !NEEDS_REBUILD_BIT, rebuild));
        }
        Ok(Map {
            pba_of_lba0: from_native(join64(raw.pba_of_lba0_lo, hi_pba), native_sector_size),
            blocks_per_member: from_native(join64(raw.blocks_per_member_lo, hi_bpm), native_sector_size),
            level,
            num_domains: raw.num_domains,
            num_members: raw.num_members,
            map_state: raw.map_state,
            blocks_per_strip: from_native(raw.blocks_per_strip as u64, native_sector_size),
            failed_disk_num: if raw.failed_disk_num == FAILED_DISK_NONE { None } else { Some(raw.failed_disk_num) },
            ordinal_table,
        })
    }
}

// ---------------------------------------------------------------------
// Volume (spec.md §3 "Volume")
// ---------------------------------------------------------------------

pub mod volume_status {
    pub const CLEAN: u16 = 1 << 0;
    pub const DIRTY: u16 = 1 << 1;
    pub const DIRTY_STRIPE_VALID: u16 = 1 << 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteHolePolicy {
    Off,
    DistributedPpl,
    JournalingDrive,
    MultipleDistributedPpl,
    MultiplePplOnJournal,
    Bitmap,
    OffMultiple,
}

impl WriteHolePolicy {
    fn to_byte(self) -> u8 {
        match self {
            WriteHolePolicy::Off => 0,
            WriteHolePolicy::DistributedPpl => 1,
            WriteHolePolicy::JournalingDrive => 2,
            WriteHolePolicy::MultipleDistributedPpl => 3,
            WriteHolePolicy::MultiplePplOnJournal => 4,
            WriteHolePolicy::Bitmap => 5,
            WriteHolePolicy::OffMultiple => 6,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => WriteHolePolicy::Off,
            1 => WriteHolePolicy::DistributedPpl,
            2 => WriteHolePolicy::JournalingDrive,
            3 => WriteHolePolicy::MultipleDistributedPpl,
            4 => WriteHolePolicy::MultiplePplOnJournal,
            5 => WriteHolePolicy::Bitmap,
            6 => WriteHolePolicy::OffMultiple,
            other => return Err(MdError::MetadataInvariant(format!("bad write-hole policy byte {}", other)).into()),
        })
    }
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct VolumeFixedRaw {
    pub name: [u8; 16],
    pub volume_id: u16,
    pub status: u16,
    pub write_hole_policy: u8,
    pub filler: [u8; 3],
    pub array_size_lo: u32,
    pub array_size_hi: u32,
    pub migr_state: u8,
    pub migr_type: u8,
    pub filler2: [u8; 2],
}

impl VolumeFixedRaw {
    pub const SIZE: usize = std::mem::size_of::<VolumeFixedRaw>();
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
    pub volume_id: u16,
    pub array_size: Sector,
    pub status: u16,
    pub write_hole_policy: WriteHolePolicy,
    pub migrating: bool,
    pub migr_type: u8,
    pub maps: Vec<Map>,
}

impl Volume {
    pub fn encoded_size(&self) -> usize {
        VolumeFixedRaw::SIZE
            + self.maps.iter().map(|m| Map::encoded_size(m.num_members as usize)).sum::<usize>()
    }

    /// Validates the non-empty/length/charset/leading-dot rule from spec.md
    /// §3 "Volume".
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 16 {
            return Err(MdError::Config("volume name must be 1-16 bytes".into()).into());
        }
        if name.starts_with('.') {
            return Err(MdError::Config("volume name may not start with a dot".into()).into());
        }
        if !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            return Err(MdError::Config("volume name must be POSIX-portable".into()).into());
        }
        Ok(())
    }

    pub fn encode_fixed(&self, native_sector_size: u32, attributes: u32) -> VolumeFixedRaw {
        let mut name = [0u8; 16];
        let bytes = self.name.as_bytes();
        let n = bytes.len().min(16);
        name[..n].copy_from_slice(&bytes[..n]);
        let keep_hi = attributes & attr::TWO_TB_DISK != 0;
        let (lo, hi) = split64(to_native(self.array_size, native_sector_size));
        VolumeFixedRaw {
            name,
            volume_id: self.volume_id,
            status: self.status,
            write_hole_policy: self.write_hole_policy.to_byte(),
            filler: [0; 3],
            array_size_lo: lo,
            array_size_hi: if keep_hi { hi } else { 0 },
            migr_state: self.migrating as u8,
            migr_type: self.migr_type,
            filler2: [0; 2],
        }
    }

    pub fn decode_fixed(raw: &VolumeFixedRaw, native_sector_size: u32, attributes: u32) -> Result<(String, u16, Sector, u16, WriteHolePolicy, bool, u8)> {
        let end = raw.name.iter().position(|&b| b == 0).unwrap_or(16);
        let name = String::from_utf8_lossy(&raw.name[..end]).to_string();
        let hi = clear_high_if_unsupported(attributes, raw.array_size_hi);
        let array_size = from_native(join64(raw.array_size_lo, hi), native_sector_size);
        Ok((
            name,
            raw.volume_id,
            array_size,
            raw.status,
            WriteHolePolicy::from_byte(raw.write_hole_policy)?,
            raw.migr_state != 0,
            raw.migr_type,
        ))
    }
}

// ---------------------------------------------------------------------
// Migration record (spec.md §3 "MigrationRecord", §4.2 "Migration record")
// ---------------------------------------------------------------------

pub mod migr_status {
    pub const SOURCE_NORMAL: u8 = 0;
    pub const SOURCE_IN_CHECKPOINT_AREA: u8 = 1;
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct MigrationRecordRaw {
    pub family_num: u32,
    pub ascending: u8,
    pub status: u8,
    pub filler: [u8; 2],
    pub blocks_per_unit: u32,
    pub dest_depth_per_unit: u32,
    pub ckpt_area_pba_lo: u32,
    pub ckpt_area_pba_hi: u32,
    pub dest_1st_member_lba_lo: u32,
    pub dest_1st_member_lba_hi: u32,
    pub num_migr_units: u32,
    pub current_migr_unit: u32,
    pub post_migr_vol_cap_lo: u32,
    pub post_migr_vol_cap_hi: u32,
}

impl MigrationRecordRaw {
    pub const SIZE: usize = std::mem::size_of::<MigrationRecordRaw>();

    pub fn is_zeroed(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub family_num: u32,
    pub ascending: bool,
    pub status: u8,
    pub blocks_per_unit: Sector,
    pub dest_depth_per_unit: Sector,
    pub ckpt_area_pba: Sector,
    pub dest_1st_member_lba: Sector,
    pub num_migr_units: u64,
    pub current_migr_unit: u64,
    pub post_migr_vol_capacity: Sector,
}

impl MigrationRecord {
    pub fn encode(&self, native_sector_size: u32) -> MigrationRecordRaw {
        let (ckpt_lo, ckpt_hi) = split64(to_native(self.ckpt_area_pba, native_sector_size));
        let (dest_lo, dest_hi) = split64(to_native(self.dest_1st_member_lba, native_sector_size));
        let (cap_lo, cap_hi) = split64(to_native(self.post_migr_vol_capacity, native_sector_size));
        MigrationRecordRaw {
            family_num: self.family_num,
            ascending: self.ascending as u8,
            status: self.status,
            filler: [0; 2],
            blocks_per_unit: to_native(self.blocks_per_unit, native_sector_size) as u32,
            dest_depth_per_unit: to_native(self.dest_depth_per_unit, native_sector_size) as u32,
            ckpt_area_pba_lo: ckpt_lo,
            ckpt_area_pba_hi: ckpt_hi,
            dest_1st_member_lba_lo: dest_lo,
            dest_1st_member_lba_hi: dest_hi,
            num_migr_units: self.num_migr_units as u32,
            current_migr_unit: self.current_migr_unit as u32,
            post_migr_vol_cap_lo: cap_lo,
            post_migr_vol_cap_hi: cap_hi,
        }
    }

    pub fn decode(raw: &MigrationRecordRaw, native_sector_size: u32) -> Self {
        MigrationRecord {
            family_num: raw.family_num,
            ascending: raw.ascending != 0,
            status: raw.status,
            blocks_per_unit: from_native(raw.blocks_per_unit as u64, native_sector_size),
            dest_depth_per_unit: from_native(raw.dest_depth_per_unit as u64, native_sector_size),
            ckpt_area_pba: from_native(join64(raw.ckpt_area_pba_lo, raw.ckpt_area_pba_hi), native_sector_size),
            dest_1st_member_lba: from_native(join64(raw.dest_1st_member_lba_lo, raw.dest_1st_member_lba_hi), native_sector_size),
            num_migr_units: raw.num_migr_units as u64,
            current_migr_unit: raw.current_migr_unit as u64,
            post_migr_vol_capacity: from_native(join64(raw.post_migr_vol_cap_lo, raw.post_migr_vol_cap_hi), native_sector_size),
        }
    }

    pub fn zeroed() -> MigrationRecordRaw {
        MigrationRecordRaw::new_zeroed()
    }
}

impl MigrationRecordRaw {
    fn new_zeroed() -> Self {
        Self {
            family_num: 0,
            ascending: 0,
            status: 0,
            filler: [0; 2],
            blocks_per_unit: 0,
            dest_depth_per_unit: 0,
            ckpt_area_pba_lo: 0,
            ckpt_area_pba_hi: 0,
            dest_1st_member_lba_lo: 0,
            dest_1st_member_lba_hi: 0,
            num_migr_units: 0,
            current_migr_unit: 0,
            post_migr_vol_cap_lo: 0,
            post_migr_vol_cap_hi: 0,
        }
    }
}

/// Migration record location on every member: `disk_size − sector_size`
/// (spec.md §4.2 "Migration record").
pub fn migration_record_offset(disk_size_bytes: u64, sector_size: u32) -> u64 {
    disk_size_bytes - sector_size as u64
}

/// Anchor location: `disk_size − 2 × sector_size` (spec.md §4.1 `store_super`).
pub fn anchor_offset(disk_size_bytes: u64, sector_size: u32) -> u64 {
    disk_size_bytes - 2 * sector_size as u64
}

/// Extended-sector location for a super whose anchor doesn't fit in one
/// sector: `disk_size − (2 + extra_sectors) × sector_size`.
pub fn extended_offset(disk_size_bytes: u64, sector_size: u32, extra_sectors: u64) -> u64 {
    disk_size_bytes - (2 + extra_sectors) * sector_size as u64
}

/// Write a container's metadata to its backing device (spec.md §4.2 "store
/// order"): the anchor (the fixed `MPB_SECTOR_CNT`-sector region at
/// `anchor_offset`) always holds the header and as much of the body as fits;
/// anything past that overflows into the extended sectors immediately before
/// it. Extended sectors are written first, the anchor last, so a crash
/// between the two writes leaves either the old anchor (still valid) or a
/// new anchor whose extended content already landed — never a reference to
/// a half-written extension.
pub fn store_super_to_disk<D: DiskDriver>(driver: &mut D, sup: &ContainerSuper) -> Result<()> {
    let bytes = encode_container(sup);
    let sector_size = sup.native_sector_size;
    let disk_size = driver.size_bytes();
    let anchor_capacity = (MPB_SECTOR_CNT as u64 * sector_size as u64) as usize;

    if bytes.len() <= anchor_capacity {
        let mut anchor = vec![0u8; anchor_capacity];
        anchor[..bytes.len()].copy_from_slice(&bytes);
        let offset = anchor_offset(disk_size, sector_size);
        driver.ddriver_seek(offset as i64, SeekType::Set).context("seek to anchor sectors")?;
        driver.ddriver_write(&anchor, anchor_capacity).context("write anchor sectors")?;
        return Ok(());
    }

    let overflow = &bytes[anchor_capacity..];
    let extra_sectors = (overflow.len() as u64 + sector_size as u64 - 1) / sector_size as u64;
    let mut extended_buf = vec![0u8; (extra_sectors * sector_size as u64) as usize];
    extended_buf[..overflow.len()].copy_from_slice(overflow);
    let extended_off = extended_offset(disk_size, sector_size, extra_sectors);
    driver.ddriver_seek(extended_off as i64, SeekType::Set).context("seek to extended sectors")?;
    driver.ddriver_write(&extended_buf, extended_buf.len()).context("write extended sectors")?;

    let anchor_off = anchor_offset(disk_size, sector_size);
    driver.ddriver_seek(anchor_off as i64, SeekType::Set).context("seek to anchor sectors")?;
    driver.ddriver_write(&bytes[..anchor_capacity], anchor_capacity).context("write anchor sectors")?;
    Ok(())
}

/// Read a container's metadata back off its backing device: the anchor
/// sectors are read first (they carry `mpb_size`), and the extended sectors
/// are only consulted if the header says the blob spilled past the anchor's
/// capacity.
pub fn load_super_from_disk<D: DiskDriver>(driver: &mut D, native_sector_size: u32) -> Result<ContainerSuper> {
    let disk_size = driver.size_bytes();
    let anchor_capacity = (MPB_SECTOR_CNT as u64 * native_sector_size as u64) as usize;
    let anchor_off = anchor_offset(disk_size, native_sector_size);

    let mut anchor = vec![0u8; anchor_capacity];
    driver.ddriver_seek(anchor_off as i64, SeekType::Set).context("seek to anchor sectors")?;
    driver.ddriver_read(&mut anchor, anchor_capacity).context("read anchor sectors")?;

    let header = AnchorHeader::read_from(&anchor[..AnchorHeader::SIZE]).ok_or_else(|| anyhow!("anchor header misaligned"))?;
    if header.mpb_size as usize <= anchor_capacity {
        return decode_container(&anchor, native_sector_size);
    }

    let overflow_len = header.mpb_size as usize - anchor_capacity;
    let extra_sectors = (overflow_len as u64 + native_sector_size as u64 - 1) / native_sector_size as u64;
    let extended_off = extended_offset(disk_size, native_sector_size, extra_sectors);
    let mut extended_buf = vec![0u8; (extra_sectors * native_sector_size as u64) as usize];
    driver.ddriver_seek(extended_off as i64, SeekType::Set).context("seek to extended sectors")?;
    driver.ddriver_read(&mut extended_buf, extended_buf.len()).context("read extended sectors")?;

    let mut full = anchor;
    full.extend_from_slice(&extended_buf[..overflow_len]);
    decode_container(&full, native_sector_size)
}

/// Migration record I/O on one member (spec.md §4.2 "Migration record"):
/// lives at its own per-disk offset, a full sector away from the anchor.
pub fn store_migration_record_to_disk<D: DiskDriver>(driver: &mut D, record: &MigrationRecord, sector_size: u32) -> Result<()> {
    let raw = record.encode(sector_size);
    let disk_size = driver.size_bytes();
    let offset = migration_record_offset(disk_size, sector_size);
    driver.ddriver_seek(offset as i64, SeekType::Set).context("seek to migration record")?;
    driver.ddriver_write(raw.as_bytes(), MigrationRecordRaw::SIZE).context("write migration record")?;
    Ok(())
}

pub fn load_migration_record_from_disk<D: DiskDriver>(driver: &mut D, sector_size: u32) -> Result<MigrationRecord> {
    let disk_size = driver.size_bytes();
    let offset = migration_record_offset(disk_size, sector_size);
    let mut buf = vec![0u8; MigrationRecordRaw::SIZE];
    driver.ddriver_seek(offset as i64, SeekType::Set).context("seek to migration record")?;
    driver.ddriver_read(&mut buf, buf.len()).context("read migration record")?;
    let raw = MigrationRecordRaw::read_from(&buf[..]).ok_or_else(|| anyhow!("migration record misaligned"))?;
    Ok(MigrationRecord::decode(&raw, sector_size))
}

// ---------------------------------------------------------------------
// Bad-block log (spec.md §3 "BadBlockLog", §4.2 "Bad-block log", §8)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct BbmLogHeaderRaw {
    pub signature: u32,
    pub entry_count: u32,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
pub struct BbmEntryRaw {
    pub lba_bytes: [u8; 6],
    pub marked_count_minus_one: u8,
    pub disk_ordinal: u8,
}

impl BbmEntryRaw {
    pub const SIZE: usize = std::mem::size_of::<BbmEntryRaw>();

    pub fn lba(&self) -> u64 {
        let mut full = [0u8; 8];
        full[..6].copy_from_slice(&self.lba_bytes);
        u64::from_le_bytes(full)
    }

    pub fn set_lba(&mut self, lba: u64) {
        let bytes = lba.to_le_bytes();
        self.lba_bytes.copy_from_slice(&bytes[..6]);
    }

    pub fn sector_count(&self) -> u32 {
        self.marked_count_minus_one as u32 + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadBlockEntry {
    pub disk_ordinal: u8,
    pub lba: u64,
    pub sectors: u32,
}

impl BadBlockEntry {
    fn end(&self) -> u64 {
        self.lba + self.sectors as u64
    }
}

#[derive(Debug, Clone, Default)]
pub struct BadBlockLog {
    pub entries: Vec<BadBlockEntry>,
}

impl BadBlockLog {
    /// Merge a new bad-block record; merges into an existing contiguous
    /// entry on the same disk up to the 256-sector cap, else appends,
    /// splitting across the cap into the minimum number of entries
    /// (spec.md §4.2 "Bad-block log", §8 scenario 5).
    pub fn record(&mut self, disk_ordinal: u8, mut lba: u64, mut len: u32) -> Result<()> {
        while len > 0 {
            if let Some(existing) = self
                .entries
                .iter_mut()
                .find(|e| e.disk_ordinal == disk_ordinal && e.end() == lba)
            {
                let room = BBM_MAX_SECTORS_PER_ENTRY - existing.sectors;
                if room > 0 {
                    let take = room.min(len);
                    existing.sectors += take;
                    lba += take as u64;
                    len -= take;
                    continue;
                }
            }
            let take = len.min(BBM_MAX_SECTORS_PER_ENTRY);
            if self.entries.len() >= BBM_MAX_ENTRIES {
                return Err(MdError::MetadataInvariant("bad block log full".into()).into());
            }
            self.entries.push(BadBlockEntry { disk_ordinal, lba, sectors: take });
            lba += take as u64;
            len -= take;
        }
        Ok(())
    }

    /// Clear entries covering exactly `[lba, lba+len)` on `disk_ordinal`
    /// (spec.md §4.2: cleared when the kernel reports a successful rewrite).
    pub fn clear(&mut self, disk_ordinal: u8, lba: u64, len: u32) {
        self.entries.retain(|e| !(e.disk_ordinal == disk_ordinal && e.lba == lba && e.sectors == len));
    }

    /// Remove every entry for a removed disk and decrement ordinals above it
    /// (spec.md §4.2 "Bad-block log").
    pub fn remove_disk(&mut self, disk_ordinal: u8) {
        self.entries.retain(|e| e.disk_ordinal != disk_ordinal);
        for e in &mut self.entries {
            if e.disk_ordinal > disk_ordinal {
                e.disk_ordinal -= 1;
            }
        }
    }

    /// Rescale every entry's LBA/length for a sector-size view change
    /// (spec.md §3 BadBlockLog invariant: ×8 going 4K -> 512).
    pub fn rescale_to_512(&self) -> Vec<BadBlockEntry> {
        self.entries
            .iter()
            .map(|e| BadBlockEntry { disk_ordinal: e.disk_ordinal, lba: e.lba * 8, sectors: e.sectors * 8 })
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len() * BbmEntryRaw::SIZE);
        let header = BbmLogHeaderRaw { signature: BBM_LOG_SIGNATURE, entry_count: self.entries.len() as u32 };
        out.extend_from_slice(header.as_bytes());
        for e in &self.entries {
            let mut raw = BbmEntryRaw { lba_bytes: [0; 6], marked_count_minus_one: (e.sectors - 1) as u8, disk_ordinal: e.disk_ordinal };
            raw.set_lba(e.lba);
            out.extend_from_slice(raw.as_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(anyhow!("bad block log buffer too short"));
        }
        let header = BbmLogHeaderRaw::read_from(&buf[..8]).ok_or_else(|| anyhow!("bad block log header misaligned"))?;
        if header.signature != BBM_LOG_SIGNATURE {
            return Err(MdError::MetadataInvariant("bad block log signature mismatch".into()).into());
        }
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        let mut offset = 8;
        for _ in 0..header.entry_count {
            let raw = BbmEntryRaw::read_from(&buf[offset..offset + BbmEntryRaw::SIZE])
                .ok_or_else(|| anyhow!("bad block entry misaligned"))?;
            entries.push(BadBlockEntry { disk_ordinal: raw.disk_ordinal, lba: raw.lba(), sectors: raw.sector_count() });
            offset += BbmEntryRaw::SIZE;
        }
        Ok(BadBlockLog { entries })
    }
}

// ---------------------------------------------------------------------
// Bitmap area (spec.md §3 "Bitmap area")
// ---------------------------------------------------------------------

pub struct BitmapArea {
    pub header_offset: u64,
    pub header_size: u64,
    pub bitmap_size: u64,
}

pub fn bitmap_area(data_end: u64, sector_size: u32) -> BitmapArea {
    let header_offset = data_end + 8192;
    let header_size = sector_size as u64;
    let bitmap_size = MULTIPLE_PPL_AREA - header_offset.min(MULTIPLE_PPL_AREA) - header_size;
    BitmapArea { header_offset, header_size, bitmap_size }
}

// ---------------------------------------------------------------------
// Whole-container encode/decode and the MetadataHandler implementation
// ---------------------------------------------------------------------

/// Lay out one container's full metadata blob: anchor header, disk records,
/// then each volume's fixed record + maps, then the bad-block log. The
/// migration record lives at its own per-member offset (`migration_record_offset`)
/// and isn't part of this blob.
fn encode_container(sup: &ContainerSuper) -> Vec<u8> {
    let mut header = AnchorHeader::new(sup.family_num, sup.orig_family_num);
    header.generation_num = sup.generation_num;
    header.attributes = sup.attributes;
    header.num_disks = sup.disks.len() as u8;
    header.num_raid_devs = sup.volumes.len() as u8;

    let mut body = Vec::new();
    for disk in &sup.disks {
        body.extend_from_slice(disk.encode(sup.native_sector_size, sup.attributes).as_bytes());
    }
    for volume in &sup.volumes {
        body.extend_from_slice(volume.encode_fixed(sup.native_sector_size, sup.attributes).as_bytes());
        for map in &volume.maps {
            let (fixed, table) = map.encode(sup.native_sector_size, sup.attributes);
            body.extend_from_slice(fixed.as_bytes());
            body.extend_from_slice(&table);
        }
    }
    let bbm = sup.bbm_log.encode();
    header.bbm_log_size = bbm.len() as u32;
    header.mpb_size = (AnchorHeader::SIZE + body.len() + bbm.len()) as u32;

    let mut out = Vec::with_capacity(header.mpb_size as usize);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&bbm);

    let sum = checksum_excluding_stored(&out, 0);
    out[24 + 8..24 + 8 + 4].copy_from_slice(&sum.to_le_bytes());
    out
}

fn decode_container(buf: &[u8], native_sector_size: u32) -> Result<ContainerSuper> {
    if buf.len() < AnchorHeader::SIZE {
        return Err(anyhow!("anchor buffer shorter than header"));
    }
    let header = AnchorHeader::read_from(&buf[..AnchorHeader::SIZE]).ok_or_else(|| anyhow!("anchor header misaligned"))?;
    if !header.signature_valid() {
        return Err(MdError::MetadataInvariant("IMSM signature mismatch".into()).into());
    }
    if !attributes_supported(header.attributes) {
        return Err(MdError::MetadataInvariant(format!("unsupported attribute bits 0x{:08x}", header.attributes)).into());
    }
    let stored_checksum = header.check_sum;
    let mut zeroed = buf[..header.mpb_size as usize].to_vec();
    zeroed[24 + 8..24 + 8 + 4].copy_from_slice(&0u32.to_le_bytes());
    let computed = checksum(&zeroed);
    if computed != stored_checksum {
        return Err(MdError::MetadataInvariant("IMSM checksum mismatch".into()).into());
    }

    let mut offset = AnchorHeader::SIZE;
    let mut disks = Vec::with_capacity(header.num_disks as usize);
    for _ in 0..header.num_disks {
        let raw = DiskRecordRaw::read_from(&buf[offset..offset + DiskRecordRaw::SIZE])
            .ok_or_else(|| anyhow!("disk record misaligned"))?;
        disks.push(Disk::decode(&raw, native_sector_size, header.attributes));
        offset += DiskRecordRaw::SIZE;
    }

    let mut volumes = Vec::with_capacity(header.num_raid_devs as usize);
    for _ in 0..header.num_raid_devs {
        let raw = VolumeFixedRaw::read_from(&buf[offset..offset + VolumeFixedRaw::SIZE])
            .ok_or_else(|| anyhow!("volume record misaligned"))?;
        offset += VolumeFixedRaw::SIZE;
        let (name, volume_id, array_size, status, write_hole_policy, migrating, migr_type) =
            Volume::decode_fixed(&raw, native_sector_size, header.attributes)?;

        let num_maps = if migrating { 2 } else { 1 };
        let mut maps = Vec::with_capacity(num_maps);
        for _ in 0..num_maps {
            let fixed = MapFixedRaw::read_from(&buf[offset..offset + MapFixedRaw::SIZE])
                .ok_or_else(|| anyhow!("map record misaligned"))?;
            offset += MapFixedRaw::SIZE;
            let table_len = (fixed.num_members as usize).saturating_sub(1) * 4;
            let table = &buf[offset..offset + table_len];
            maps.push(Map::decode(&fixed, table, native_sector_size, header.attributes)?);
            offset += table_len;
        }
        volumes.push(Volume { name, volume_id, array_size, status, write_hole_policy, migrating, migr_type, maps });
    }

    let bbm_log = if header.bbm_log_size > 0 {
        BadBlockLog::decode(&buf[offset..offset + header.bbm_log_size as usize])?
    } else {
        BadBlockLog::default()
    };

    Ok(ContainerSuper {
        format: MetadataFormat::Imsm,
        family_num: header.family_num,
        orig_family_num: header.orig_family_num,
        generation_num: header.generation_num,
        attributes: header.attributes,
        disks,
        volumes,
        bbm_log,
        migration: None,
        native_sector_size,
    })
}

pub struct ImsmHandler;

impl MetadataHandler for ImsmHandler {
    fn format(&self) -> MetadataFormat {
        MetadataFormat::Imsm
    }

    fn match_by_descriptor(&self, anchor_bytes: &[u8]) -> bool {
        anchor_bytes.len() >= 24 && &anchor_bytes[..24] == SIGNATURE
    }

    fn load_super(&self, anchor_bytes: &[u8], native_sector_size: u32) -> Result<ContainerSuper> {
        decode_container(anchor_bytes, native_sector_size)
    }

    fn store_super(&self, sup: &ContainerSuper) -> Result<Vec<u8>> {
        Ok(encode_container(sup))
    }

    fn compare_super(&self, ours: &ContainerSuper, theirs: &ContainerSuper) -> SuperOrdering {
        if ours.family_num != theirs.family_num && ours.orig_family_num != theirs.orig_family_num {
            SuperOrdering::ForeignFamily
        } else if theirs.generation_num < ours.generation_num {
            SuperOrdering::StaleGeneration
        } else {
            SuperOrdering::SameFamily
        }
    }

    fn init_super(&self, family_num: u32) -> ContainerSuper {
        ContainerSuper {
            format: MetadataFormat::Imsm,
            family_num,
            orig_family_num: family_num,
            generation_num: 0,
            attributes: attr::CHECKSUM_VERIFY | attr::RAID0 | attr::RAID1 | attr::RAID5 | attr::RAID10 | attr::BBM,
            disks: Vec::new(),
            volumes: Vec::new(),
            bbm_log: BadBlockLog::default(),
            migration: None,
            native_sector_size: 512,
        }
    }

    fn add_to_super(&self, sup: &mut ContainerSuper, disk: Disk) -> Result<()> {
        sup.disks.push(disk);
        sup.generation_num += 1;
        Ok(())
    }

    fn write_init_super(&self, sup: &mut ContainerSuper, volume: Volume) -> Result<()> {
        Volume::validate_name(&volume.name)?;
        if sup.volumes.iter().any(|v| v.volume_id == volume.volume_id) {
            return Err(MdError::Config(format!("volume id {} already in use", volume.volume_id)).into());
        }
        sup.volumes.push(volume);
        sup.generation_num += 1;
        Ok(())
    }

    fn container_content(&self, sup: &ContainerSuper) -> Vec<VolumeInfo> {
        sup.volumes
            .iter()
            .map(|v| VolumeInfo {
                volume_id: v.volume_id,
                name: v.name.clone(),
                level: v.maps.first().map(|m| m.level).unwrap_or(RaidLevel::Container),
                array_size: v.array_size,
                degraded: v.maps.last().map(|m| m.map_state == map_state::DEGRADED).unwrap_or(false),
                resyncing: v.migrating,
            })
            .collect()
    }

    fn validate_geometry(
        &self,
        level: RaidLevel,
        raid_disks: u32,
        chunk_kib: Option<u32>,
        spare_criteria: &SpareCriteria,
    ) -> Result<()> {
        if level.imsm_byte().is_none() {
            return Err(MdError::Geometry(format!("{:?} has no IMSM map encoding", level)).into());
        }
        crate::mdcore::geometry::validate_device_count(level, raid_disks, 0, 0, spare_criteria.max_raid_disks)?;
        crate::mdcore::geometry::validate_chunk(level, chunk_kib, None)?;
        Ok(())
    }

    fn getinfo_super(&self, sup: &ContainerSuper, volume_id: u16) -> Option<VolumeInfo> {
        self.container_content(sup).into_iter().find(|v| v.volume_id == volume_id)
    }

    fn update_super(&self, sup: &mut ContainerSuper, change: UpdateKind) -> Result<()> {
        match change {
            UpdateKind::DiskAdded { disk } => sup.disks.push(disk),
            UpdateKind::DiskRemoved { ordinal } => {
                if (ordinal as usize) < sup.disks.len() {
                    sup.disks.remove(ordinal as usize);
                }
                sup.bbm_log.remove_disk(ordinal);
                for volume in &mut sup.volumes {
                    for map in &mut volume.maps {
                        map.ordinal_table.retain(|(o, _)| *o as u8 != ordinal);
                        for (o, _) in &mut map.ordinal_table {
                            if *o as u8 > ordinal {
                                *o -= 1;
                            }
                        }
                    }
                }
            }
            UpdateKind::DiskFailed { ordinal } => {
                if let Some(disk) = sup.disks.get_mut(ordinal as usize) {
                    disk.status |= disk_state::FAILED;
                }
            }
            UpdateKind::VolumeCreated { volume } => self.write_init_super(sup, volume)?,
            UpdateKind::VolumeGrown { volume_id, new_array_size } => {
                if let Some(v) = sup.volumes.iter_mut().find(|v| v.volume_id == volume_id) {
                    v.array_size = new_array_size;
                } else {
                    return Err(MdError::Config(format!("no such volume id {}", volume_id)).into());
                }
            }
            UpdateKind::BadBlockRecorded { ordinal, lba, len } => sup.bbm_log.record(ordinal, lba, len)?,
            UpdateKind::BadBlockCleared { ordinal, lba, len } => sup.bbm_log.clear(ordinal, lba, len),
            UpdateKind::GenerationBumped => {}
            UpdateKind::ActivateSpare { ordinal } => {
                if let Some(disk) = sup.disks.get_mut(ordinal as usize) {
                    disk.status &= !disk_state::SPARE;
                    disk.status |= disk_state::CONFIGURED;
                }
            }
            UpdateKind::KillArray { volume_id } => {
                sup.volumes.retain(|v| v.volume_id != volume_id);
            }
            UpdateKind::RenameArray { volume_id, new_name } => {
                Volume::validate_name(&new_name)?;
                let volume = sup
                    .volumes
                    .iter_mut()
                    .find(|v| v.volume_id == volume_id)
                    .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
                volume.name = new_name;
            }
            UpdateKind::ReshapeContainerDisks { added } => {
                sup.disks.extend(added);
            }
            UpdateKind::ReshapeMigration { volume_id, new_level, new_raid_disks, blocks_per_strip, migration } => {
                let volume = sup
                    .volumes
                    .iter_mut()
                    .find(|v| v.volume_id == volume_id)
                    .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
                let mut dest_map =
                    volume.maps.last().cloned().ok_or_else(|| MdError::MetadataInvariant("volume has no maps".into()))?;
                dest_map.level = new_level;
                dest_map.num_members = new_raid_disks as u8;
                dest_map.num_domains = new_level.domain_count() as u8;
                dest_map.blocks_per_strip = blocks_per_strip;
                dest_map.ordinal_table = (0..new_raid_disks).map(|i| (i, false)).collect();
                volume.maps.push(dest_map);
                volume.migrating = true;
                sup.migration = Some(migration);
            }
            UpdateKind::Takeover { volume_id, new_level, new_raid_disks } => {
                let volume = sup
                    .volumes
                    .iter_mut()
                    .find(|v| v.volume_id == volume_id)
                    .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
                let map = volume.maps.last_mut().ok_or_else(|| MdError::MetadataInvariant("volume has no maps".into()))?;
                map.level = new_level;
                map.num_members = new_raid_disks as u8;
                map.num_domains = new_level.domain_count() as u8;
                map.ordinal_table = (0..new_raid_disks).map(|i| (i, false)).collect();
            }
            UpdateKind::MigrationCheckpoint { current_migr_unit } => {
                if let Some(rec) = &mut sup.migration {
                    rec.current_migr_unit = current_migr_unit;
                }
            }
            UpdateKind::RwhPolicy { volume_id, policy } => {
                let volume = sup
                    .volumes
                    .iter_mut()
                    .find(|v| v.volume_id == volume_id)
                    .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
                volume.write_hole_policy = policy;
            }
        }
        sup.generation_num += 1;
        Ok(())
    }

    fn manage_reshape(&self, sup: &mut ContainerSuper, volume_id: u16) -> Result<bool> {
        let volume = sup
            .volumes
            .iter_mut()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
        if !volume.migrating {
            return Ok(true);
        }
        if let Some(rec) = &mut sup.migration {
            rec.current_migr_unit += 1;
            if rec.current_migr_unit >= rec.num_migr_units {
                volume.migrating = false;
                if let Some(dest) = volume.maps.pop() {
                    volume.maps = vec![dest];
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn get_spare_criteria(&self, sup: &ContainerSuper) -> SpareCriteria {
        let min_size = sup.disks.iter().map(|d| d.total_blocks).min();
        SpareCriteria { min_size, max_raid_disks: None }
    }

    fn write_bitmap(&self, sup: &ContainerSuper, volume_id: u16) -> Result<Vec<u8>> {
        let volume = sup
            .volumes
            .iter()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
        let map = volume.maps.last().ok_or_else(|| anyhow!("volume has no maps"))?;
        let bits = (map.blocks_per_member / MULTIPLE_PPL_AREA.max(1)).max(1);
        Ok(vec![0xff; ((bits + 7) / 8) as usize])
    }

    fn locate_bitmap(&self, _sup: &ContainerSuper, _volume_id: u16, data_end: Sector) -> Sector {
        bitmap_area(data_end, 512).header_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_round_trips() {
        let mut header = AnchorHeader::new(1, 1);
        header.num_disks = 4;
        let bytes_with_zero = header.as_bytes().to_vec();
        let computed = checksum(&bytes_with_zero);
        header.check_sum = computed;
        let final_bytes = header.as_bytes().to_vec();
        let recomputed = checksum_excluding_stored(&final_bytes, computed);
        assert_eq!(recomputed, computed);
    }

    #[test]
    fn attributes_reject_unknown_bits() {
        assert!(attributes_supported(attr::RAID5 | attr::BBM));
        assert!(!attributes_supported(1 << 20));
    }

    #[test]
    fn sector_size_round_trip_4k() {
        let v = 1_048_576u64; // exactly 1 GiB in 512-byte sectors
        let native = to_native(v, 4096);
        assert_eq!(native, v / 8);
        assert_eq!(from_native(native, 4096), v);
    }

    #[test]
    fn disk_record_round_trips() {
        let disk = Disk { serial: "WD-ABC123".into(), total_blocks: 200_000_000, scsi_id: 7, status: disk_state::CONFIGURED };
        let raw = disk.encode(512, attr::SUPPORTED);
        let back = Disk::decode(&raw, 512, attr::SUPPORTED);
        assert_eq!(back.serial, disk.serial);
        assert_eq!(back.total_blocks, disk.total_blocks);
    }

    #[test]
    fn clears_high_bits_when_2tb_disk_unsupported() {
        let disk = Disk { serial: "S".into(), total_blocks: (1u64 << 33) + 10, scsi_id: 0, status: 0 };
        let raw = disk.encode(512, attr::RAID0); // no TWO_TB_DISK bit
        assert_eq!(raw.total_blocks_hi, 0);
    }

    #[test]
    fn bad_block_merge_adjoins_into_one_entry() {
        let mut log = BadBlockLog::default();
        log.record(2, 1000, 200).unwrap();
        log.record(2, 1200, 100).unwrap();
        assert_eq!(log.entries.len(), 1);
        assert_eq!(log.entries[0].lba, 1000);
        assert_eq!(log.entries[0].sectors, 300);
    }

    #[test]
    fn bad_block_entry_splits_at_256_sector_cap() {
        let mut log = BadBlockLog::default();
        log.record(0, 0, 300).unwrap();
        assert_eq!(log.entries.len(), 2);
        assert_eq!(log.entries[0].sectors, 256);
        assert_eq!(log.entries[1].sectors, 44);
    }

    #[test]
    fn removing_disk_shifts_higher_ordinals_down() {
        let mut log = BadBlockLog::default();
        log.entries.push(BadBlockEntry { disk_ordinal: 1, lba: 0, sectors: 1 });
        log.entries.push(BadBlockEntry { disk_ordinal: 3, lba: 0, sectors: 1 });
        log.remove_disk(1);
        assert_eq!(log.entries.len(), 1);
        assert_eq!(log.entries[0].disk_ordinal, 2);
    }

    #[test]
    fn map_round_trips_ordinal_table() {
        let map = Map {
            pba_of_lba0: 2048,
            blocks_per_member: 100 * crate::mdcore::geometry::MIB,
            level: RaidLevel::Raid5,
            num_domains: 1,
            num_members: 4,
            map_state: map_state::NORMAL,
            blocks_per_strip: 256,
            failed_disk_num: None,
            ordinal_table: vec![(0, false), (1, false), (2, true), (3, false)],
        };
        let (fixed, table) = map.encode(512, attr::SUPPORTED);
        let decoded = Map::decode(&fixed, &table, 512, attr::SUPPORTED).unwrap();
        assert_eq!(decoded.ordinal_table, map.ordinal_table);
        assert_eq!(decoded.blocks_per_member, map.blocks_per_member);
    }

    #[test]
    fn legacy_raid1_four_member_reads_as_raid10() {
        let map = Map {
            pba_of_lba0: 0,
            blocks_per_member: 2048,
            level: RaidLevel::Raid1,
            num_domains: 2,
            num_members: 4,
            map_state: map_state::NORMAL,
            blocks_per_strip: 0,
            failed_disk_num: None,
            ordinal_table: vec![(0, false); 4],
        };
        let mut fixed = map.encode(512, attr::SUPPORTED).0;
        fixed.raid_level = 1;
        let decoded = Map::decode(&fixed, &[0u8; 16], 512, attr::SUPPORTED).unwrap();
        assert_eq!(decoded.level, RaidLevel::Raid10);
    }

    #[test]
    fn migration_record_round_trips() {
        let rec = MigrationRecord {
            family_num: 42,
            ascending: true,
            status: migr_status::SOURCE_IN_CHECKPOINT_AREA,
            blocks_per_unit: 2048,
            dest_depth_per_unit: 2048,
            ckpt_area_pba: 1_000_000,
            dest_1st_member_lba: 500_000,
            num_migr_units: 100,
            current_migr_unit: 37,
            post_migr_vol_capacity: 2_000_000,
        };
        let raw = rec.encode(512);
        let back = MigrationRecord::decode(&raw, 512);
        assert_eq!(back.family_num, rec.family_num);
        assert_eq!(back.current_migr_unit, rec.current_migr_unit);
        assert_eq!(back.ckpt_area_pba, rec.ckpt_area_pba);
    }

    #[test]
    fn volume_name_rules() {
        assert!(Volume::validate_name("data0").is_ok());
        assert!(Volume::validate_name("").is_err());
        assert!(Volume::validate_name(".hidden").is_err());
        assert!(Volume::validate_name("this_name_is_too_long_ok").is_err());
    }

    #[test]
    fn store_and_load_super_round_trip_through_disk() {
        use disk_driver::memory::MemoryDiskDriver;

        let handler = ImsmHandler;
        let mut sup = handler.init_super(7);
        sup.disks.push(Disk { serial: "S0".into(), total_blocks: 100_000, scsi_id: 0, status: disk_state::CONFIGURED });

        let mut drv = MemoryDiskDriver::new(1 << 20, 512, "D0");
        store_super_to_disk(&mut drv, &sup).unwrap();
        let back = load_super_from_disk(&mut drv, 512).unwrap();
        assert_eq!(back.family_num, sup.family_num);
        assert_eq!(back.disks.len(), 1);
        assert_eq!(back.disks[0].serial, "S0");
    }

    #[test]
    fn store_and_load_super_spills_into_extended_sectors_for_many_disks() {
        use disk_driver::memory::MemoryDiskDriver;

        let handler = ImsmHandler;
        let mut sup = handler.init_super(9);
        for i in 0..40 {
            sup.disks.push(Disk { serial: format!("S{}", i), total_blocks: 100_000, scsi_id: 0, status: disk_state::CONFIGURED });
        }

        let mut drv = MemoryDiskDriver::new(4 << 20, 512, "D0");
        store_super_to_disk(&mut drv, &sup).unwrap();
        let back = load_super_from_disk(&mut drv, 512).unwrap();
        assert_eq!(back.disks.len(), 40);
        assert_eq!(back.disks[39].serial, "S39");
    }

    #[test]
    fn migration_record_round_trips_through_disk() {
        use disk_driver::memory::MemoryDiskDriver;

        let rec = MigrationRecord {
            family_num: 3,
            ascending: true,
            status: migr_status::SOURCE_IN_CHECKPOINT_AREA,
            blocks_per_unit: 2048,
            dest_depth_per_unit: 2048,
            ckpt_area_pba: 10_000,
            dest_1st_member_lba: 5_000,
            num_migr_units: 20,
            current_migr_unit: 3,
            post_migr_vol_capacity: 200_000,
        };
        let mut drv = MemoryDiskDriver::new(1 << 20, 512, "D0");
        store_migration_record_to_disk(&mut drv, &rec, 512).unwrap();
        let back = load_migration_record_from_disk(&mut drv, 512).unwrap();
        assert_eq!(back.current_migr_unit, rec.current_migr_unit);
        assert_eq!(back.ckpt_area_pba, rec.ckpt_area_pba);
    }
}
