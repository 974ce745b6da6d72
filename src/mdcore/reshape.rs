//! Reshape / migration state machine (spec.md §4.5). Classifies a requested
//! change, computes how far it can go given free space, drives the
//! checkpoint loop through the handler's `manage_reshape`, and recovers a
//! crashed migration from its last checkpoint.
//!
//! The checkpoint loop's bounded wait for kernel progress uses the `retry`
//! crate the same way the teacher's daemon loop waits out transient EAGAIN:
//! a small fixed backoff, capped attempt count, success as soon as the
//! handler reports completion.

use crate::mdcore::error::MdError;
use crate::mdcore::extents::{largest_common_free_run, Extent};
use crate::mdcore::geometry::{self, RaidLevel};
use crate::mdcore::handler::{ContainerSuper, MetadataHandler, UpdateKind};
use crate::mdcore::imsm::{migr_status, MigrationRecord};
use crate::mdcore::types::Sector;
use anyhow::{Context, Result};
use disk_driver::{DiskDriver, SeekType};
use retry::delay::Fixed;
use retry::{retry, OperationResult};
use std::collections::HashSet;

/// What a requested change to a volume amounts to (spec.md §4.5
/// "analyze_change").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Same member count and data layout, different redundancy scheme
    /// entirely achievable without moving data (e.g. RAID1 <-> RAID10 with
    /// matching member count, or RAID0 <-> RAID10 doubling/halving members).
    Takeover,
    /// Level or layout change that requires rewriting every stripe.
    Migration,
    /// Member count or per-member capacity grows/shrinks, no layout change.
    SizeChange,
    /// Only the chunk size changes; member count and level are untouched.
    ChunkChange,
    /// Requested change can't be satisfied (geometry or in-flight state).
    Abort(String),
}

/// Level pairs reachable by takeover alone — no data needs to be rewritten,
/// only the map's level/layout/ordinal-table interpretation changes (spec.md
/// §4.5 takeover table): RAID1<->RAID10 at matching member count, and
/// RAID0<->RAID10 doubling/halving the member count by mirroring each
/// stripe member.
fn is_takeover_pair(from: RaidLevel, from_n: u32, to: RaidLevel, to_n: u32) -> bool {
    match (from, to) {
        (RaidLevel::Raid1, RaidLevel::Raid10) | (RaidLevel::Raid10, RaidLevel::Raid1) => from_n == to_n,
        (RaidLevel::Raid0, RaidLevel::Raid10) => to_n == from_n * 2,
        (RaidLevel::Raid10, RaidLevel::Raid0) => from_n == to_n * 2,
        _ => false,
    }
}

pub fn analyze_change(
    sup: &ContainerSuper,
    volume_id: u16,
    new_level: Option<RaidLevel>,
    new_raid_disks: Option<u32>,
    new_chunk: Option<Sector>,
) -> Result<ChangeKind> {
    let volume = sup
        .volumes
        .iter()
        .find(|v| v.volume_id == volume_id)
        .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
    if volume.migrating {
        return Ok(ChangeKind::Abort("volume already has a migration in flight".into()));
    }
    let map = volume.maps.last().ok_or_else(|| MdError::MetadataInvariant("volume has no maps".into()))?;

    let level_changing = new_level.map(|l| l != map.level).unwrap_or(false);
    let disks_changing = new_raid_disks.map(|n| n != map.num_members as u32).unwrap_or(false);
    let chunk_changing = new_chunk.map(|c| c != map.blocks_per_strip).unwrap_or(false);

    if !level_changing && !disks_changing && !chunk_changing {
        return Ok(ChangeKind::Abort("no change requested".into()));
    }
    if level_changing || disks_changing {
        let to_n = new_raid_disks.unwrap_or(map.num_members as u32);
        let to_level = new_level.unwrap_or(map.level);
        if is_takeover_pair(map.level, map.num_members as u32, to_level, to_n) {
            return Ok(ChangeKind::Takeover);
        }
        if disks_changing && !level_changing {
            if !map.level.valid_member_count(to_n, None) {
                return Ok(ChangeKind::Abort(format!("{:?} cannot have {} members", map.level, to_n)));
            }
            return Ok(ChangeKind::SizeChange);
        }
        return Ok(ChangeKind::Migration);
    }
    Ok(ChangeKind::ChunkChange)
}

/// How much growth a size-change reshape can actually deliver, bounded by
/// the smallest member's free run after the volume's own extent (spec.md
/// §4.5 "Free-space computation").
pub fn compute_grow_bound(per_member_extents: &[(Sector, Vec<Extent>)], chunk: Sector) -> Sector {
    largest_common_free_run(per_member_extents, chunk)
}

/// Begin a migration: validates the new geometry, then commits the
/// destination map and the migration record through a single
/// `ReshapeMigration` update (spec.md §4.5 "manage_reshape" setup half;
/// spec.md §4.1 "reshape_migration") instead of mutating the super's fields
/// directly.
pub fn begin_migration<H: MetadataHandler>(
    handler: &H,
    sup: &mut ContainerSuper,
    volume_id: u16,
    new_level: RaidLevel,
    new_raid_disks: u32,
    blocks_per_strip: Sector,
) -> Result<()> {
    handler.validate_geometry(new_level, new_raid_disks, None, &handler.get_spare_criteria(sup))?;

    let volume = sup
        .volumes
        .iter()
        .find(|v| v.volume_id == volume_id)
        .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
    let array_size = volume.array_size;
    let total_units = array_size / geometry::MIB.max(1);
    let migration = MigrationRecord {
        family_num: sup.family_num,
        ascending: true,
        status: migr_status::SOURCE_NORMAL,
        blocks_per_unit: geometry::MIB,
        dest_depth_per_unit: geometry::MIB,
        ckpt_area_pba: geometry::RESERVED_SECTORS,
        dest_1st_member_lba: geometry::RESERVED_SECTORS,
        num_migr_units: total_units.max(1),
        current_migr_unit: 0,
        post_migr_vol_capacity: array_size,
    };

    handler.update_super(sup, UpdateKind::ReshapeMigration { volume_id, new_level, new_raid_disks, blocks_per_strip, migration })
}

/// Drive the checkpoint loop to completion, polling the handler with a
/// fixed backoff and a bounded attempt count (spec.md §4.5: "checkpoints
/// must make forward progress or the reshape is considered stalled").
pub fn run_to_completion<H: MetadataHandler>(handler: &H, sup: &mut ContainerSuper, volume_id: u16, max_attempts: usize) -> Result<()> {
    let outcome = retry(Fixed::from_millis(1).take(max_attempts), || {
        match handler.manage_reshape(sup, volume_id) {
            Ok(true) => OperationResult::Ok(()),
            Ok(false) => OperationResult::Retry(MdError::ReshapeAbort("checkpoint not yet complete".into())),
            Err(e) => OperationResult::Err(MdError::ReshapeAbort(e.to_string())),
        }
    });
    outcome.map_err(|e| MdError::ReshapeAbort(e.to_string())).context("reshape checkpoint loop")?;
    Ok(())
}

/// Recover a migration interrupted mid-checkpoint (spec.md §4.5
/// "recover_backup"): if the migration record's status shows the checkpoint
/// area held valid data, the destination stripe at `current_migr_unit - 1`
/// may be half-written. Replay `dest_depth_per_unit * 512` bytes from
/// `ckpt_area_pba` back onto `dest_1st_member_lba + pba_of_lba0(dest_map)` on
/// every non-failed member, then roll the checkpoint back one unit so the
/// next pass re-does it instead of trusting the half-written copy.
pub fn recover_backup<D: DiskDriver>(sup: &mut ContainerSuper, volume_id: u16, members: &mut [(u32, &mut D)]) -> Result<()> {
    let in_checkpoint =
        matches!(&sup.migration, Some(rec) if rec.status == migr_status::SOURCE_IN_CHECKPOINT_AREA && rec.current_migr_unit > 0);
    if !in_checkpoint {
        return Ok(());
    }

    let volume = sup
        .volumes
        .iter()
        .find(|v| v.volume_id == volume_id)
        .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
    let dest_map = volume.maps.last().ok_or_else(|| MdError::MetadataInvariant("volume has no maps".into()))?;
    let failed_ordinals: HashSet<u32> = dest_map.ordinal_table.iter().filter(|(_, failed)| *failed).map(|(o, _)| *o).collect();
    let pba_of_lba0 = dest_map.pba_of_lba0;

    let rec = sup.migration.as_ref().expect("checked above");
    let depth_bytes = (rec.dest_depth_per_unit as u64 * 512) as usize;
    let src_offset = rec.ckpt_area_pba as i64 * 512;
    let dst_offset = (rec.dest_1st_member_lba + pba_of_lba0) as i64 * 512;

    let mut buf = vec![0u8; depth_bytes];
    for (ordinal, drv) in members.iter_mut() {
        if failed_ordinals.contains(ordinal) {
            continue;
        }
        drv.ddriver_seek(src_offset, SeekType::Set).context("seek to checkpoint area")?;
        drv.ddriver_read(&mut buf, depth_bytes).context("read checkpoint area")?;
        drv.ddriver_seek(dst_offset, SeekType::Set).context("seek to destination lba0")?;
        drv.ddriver_write(&buf, depth_bytes).context("replay checkpoint onto destination")?;
    }

    sup.migration.as_mut().expect("checked above").current_migr_unit -= 1;
    Ok(())
}

/// Progress fraction in `[0, 1]`, the contract the monitor/reporting layer
/// reads (spec.md §4.5 "Progress reporting contract").
pub fn progress_fraction(sup: &ContainerSuper) -> f64 {
    match &sup.migration {
        Some(rec) if rec.num_migr_units > 0 => rec.current_migr_unit as f64 / rec.num_migr_units as f64,
        _ => 1.0,
    }
}
