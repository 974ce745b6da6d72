//! Incremental assembly (spec.md §4.4). One device shows up (udev `add`
//! event, or a cold boot scan); this module decides whether it's enough to
//! complete quorum, bring the array up degraded, or just remember it and
//! wait for more.
//!
//! The event-count reconciliation is grounded directly on
//! `examples/original_source/Incremental.c`'s `avail[]` pass: count how many
//! configured slots we've actually seen a device for, compare against the
//! number required for the level, and only start once that's met or the
//! caller forces it.

use crate::mdcore::error::MdError;
use crate::mdcore::geometry::RaidLevel;
use crate::mdcore::handler::{ContainerSuper, KernelRpc, MetadataHandler};
use crate::mdcore::imsm::{disk_state, Disk};
use crate::mdcore::namemap::{identity_matches, HostIdentity, MapStore, NameMap};
use anyhow::{Context, Result};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Not enough devices yet; caller should wait for more incremental events.
    Incomplete,
    /// Enough devices for a degraded-but-legal start.
    Degraded,
    /// All configured slots present.
    Complete,
}

/// Quorum decision for one volume inside a container super (spec.md §4.4
/// "enough? decision"): how many of its configured (non-spare, non-failed)
/// slots currently have a disk record backing them.
pub fn assess_quorum(sup: &ContainerSuper, volume_id: u16) -> Result<Admission> {
    let volume = sup
        .volumes
        .iter()
        .find(|v| v.volume_id == volume_id)
        .ok_or_else(|| MdError::Config(format!("no such volume id {}", volume_id)))?;
    let map = volume.maps.last().ok_or_else(|| MdError::MetadataInvariant("volume has no maps".into()))?;

    let present = map
        .ordinal_table
        .iter()
        .filter(|(ordinal, _)| {
            sup.disks
                .get(*ordinal as usize)
                .map(|d| d.status & disk_state::FAILED == 0)
                .unwrap_or(false)
        })
        .count() as u32;
    let required = map.num_members as u32;
    let minimum_for_degraded = minimum_members_for_level(map.level, required);

    if present >= required {
        Ok(Admission::Complete)
    } else if present >= minimum_for_degraded {
        Ok(Admission::Degraded)
    } else {
        Ok(Admission::Incomplete)
    }
}

/// How many present members still make a legal, if degraded, array (spec.md
/// §4.4): one short of full for single-redundancy levels, two short for
/// dual-redundancy, exactly full for levels with no redundancy at all.
fn minimum_members_for_level(level: RaidLevel, total: u32) -> u32 {
    match level {
        RaidLevel::Raid0 | RaidLevel::Container => total,
        RaidLevel::Raid1 => 1,
        RaidLevel::Raid5 => total.saturating_sub(1).max(1),
        RaidLevel::Raid6 => total.saturating_sub(2).max(1),
        RaidLevel::Raid10 => total / 2,
    }
}

/// Cross-witness pruning (Incremental.c: discard an `avail[]` slot whose
/// disk reports a strictly lower event/generation count than the newest
/// witness seen for the same family — it's a stale copy of a disk that was
/// already removed and re-added elsewhere).
pub fn reconcile_event_counts(candidates: &[(u8, u32)]) -> Vec<u8> {
    let newest = candidates.iter().map(|(_, gen)| *gen).max().unwrap_or(0);
    candidates.iter().filter(|(_, gen)| *gen == newest).map(|(ordinal, _)| *ordinal).collect()
}

#[derive(Debug, Clone)]
pub struct IncomingDevice {
    pub path: String,
    pub serial: String,
    pub size_sectors: u64,
    pub recorded_homehost: Option<String>,
}

/// One incremental-assembly step: admit `device`'s super, match it against
/// an identity policy, fold it into `sup`, and report what changed. Bringing
/// the kernel array up (or adding the disk to an already-running one) is the
/// caller's job once this returns `Admission::Degraded`/`Complete`.
pub fn admit<H: MetadataHandler>(
    handler: &H,
    sup: &mut ContainerSuper,
    identity: &HostIdentity,
    device: &IncomingDevice,
    volume_id: u16,
) -> Result<Admission> {
    // spec.md §4.4 step 3: a homehost mismatch degrades trust to "foreign"
    // and assembly continues — it never aborts admission. The foreign flag
    // only matters later, when a name collision forces a `_N` suffix.
    let trusted = identity_matches(identity, device.recorded_homehost.as_deref());

    let already_present = sup.disks.iter().any(|d| d.serial == device.serial);
    if !already_present {
        let mut status = disk_state::CONFIGURED;
        if !trusted {
            status |= disk_state::FOREIGN;
        }
        let disk = Disk {
            serial: Disk::normalize_serial(&device.serial),
            total_blocks: device.size_sectors,
            scsi_id: 0,
            status,
        };
        handler
            .add_to_super(sup, disk)
            .with_context(|| format!("adding incoming device {}", device.path))?;
    }

    assess_quorum(sup, volume_id)
}

/// Bring an admitted volume up: start it directly if quorum is complete,
/// start degraded if the caller accepts that, or leave it queued.
pub fn bring_up<K: KernelRpc>(kernel: &mut K, devnm: &str, admission: Admission, allow_degraded: bool) -> Result<bool> {
    match admission {
        Admission::Complete => {
            kernel.run_array(devnm)?;
            Ok(true)
        }
        Admission::Degraded if allow_degraded => {
            kernel.run_array(devnm)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// A bare, superless device offered for incremental assembly becomes a
/// spare in whatever container it best fits — the spare-migration fallback
/// mentioned in spec.md §4.4 for devices with no recognisable metadata.
pub fn fallback_to_spare<S: MapStore>(store: &mut S, devnm: &str, device: &IncomingDevice) -> Result<()> {
    let mut map = NameMap::parse(&store.read()?)?;
    if map.by_path(&device.path).is_none() {
        map.claim(devnm.to_string(), 0, Uuid::new_v4(), device.path.clone())?;
        store.atomic_write(&map.serialize())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcore::geometry::MIB;
    use crate::mdcore::imsm::{map_state, ImsmHandler, Map, Volume, WriteHolePolicy};
    use crate::mdcore::namemap::MemoryMapStore;

    fn volume_with_members(level: RaidLevel, n: u8) -> ContainerSuper {
        let handler = ImsmHandler;
        let mut sup = handler.init_super(1);
        let map = Map {
            pba_of_lba0: 0,
            blocks_per_member: 10 * MIB,
            level,
            num_domains: level.domain_count() as u8,
            num_members: n,
            map_state: map_state::NORMAL,
            blocks_per_strip: 256,
            failed_disk_num: None,
            ordinal_table: (0..n as u32).map(|i| (i, false)).collect(),
        };
        let volume = Volume {
            name: "vol0".into(),
            volume_id: 1,
            array_size: 10 * MIB * (n as u64 - 1),
            status: 0,
            write_hole_policy: WriteHolePolicy::Off,
            migrating: false,
            migr_type: 0,
            maps: vec![map],
        };
        sup.volumes.push(volume);
        sup
    }

    #[test]
    fn quorum_incomplete_with_no_disks_present() {
        let sup = volume_with_members(RaidLevel::Raid5, 4);
        assert_eq!(assess_quorum(&sup, 1).unwrap(), Admission::Incomplete);
    }

    #[test]
    fn quorum_degraded_one_short_of_raid5() {
        let mut sup = volume_with_members(RaidLevel::Raid5, 4);
        for i in 0..3 {
            sup.disks.push(Disk { serial: format!("S{}", i), total_blocks: 100 * MIB, scsi_id: 0, status: disk_state::CONFIGURED });
        }
        assert_eq!(assess_quorum(&sup, 1).unwrap(), Admission::Degraded);
    }

    #[test]
    fn quorum_complete_when_all_present() {
        let mut sup = volume_with_members(RaidLevel::Raid5, 4);
        for i in 0..4 {
            sup.disks.push(Disk { serial: format!("S{}", i), total_blocks: 100 * MIB, scsi_id: 0, status: disk_state::CONFIGURED });
        }
        assert_eq!(assess_quorum(&sup, 1).unwrap(), Admission::Complete);
    }

    #[test]
    fn reconcile_keeps_only_newest_generation() {
        let candidates = vec![(0u8, 5u32), (1, 7), (2, 7)];
        let mut kept = reconcile_event_counts(&candidates);
        kept.sort();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn admit_degrades_trust_instead_of_rejecting_on_homehost_mismatch() {
        let handler = ImsmHandler;
        let mut sup = volume_with_members(RaidLevel::Raid1, 2);
        let identity = HostIdentity { homehost: Some("thishost".into()) };
        let device = IncomingDevice {
            path: "/dev/sda".into(),
            serial: "S0".into(),
            size_sectors: 100 * MIB,
            recorded_homehost: Some("otherhost".into()),
        };
        let admission = admit(&handler, &mut sup, &identity, &device, 1).unwrap();
        assert_eq!(admission, Admission::Degraded);
        let disk = sup.disks.iter().find(|d| d.serial == "S0").unwrap();
        assert_ne!(disk.status & disk_state::FOREIGN, 0);
    }

    #[test]
    fn fallback_to_spare_claims_bare_device_once() {
        let mut store = MemoryMapStore::default();
        let device = IncomingDevice { path: "/dev/sdb".into(), serial: "S1".into(), size_sectors: 10 * MIB, recorded_homehost: None };
        fallback_to_spare(&mut store, "md9", &device).unwrap();
        fallback_to_spare(&mut store, "md9", &device).unwrap();
        let map = NameMap::parse(&store.contents).unwrap();
        assert_eq!(map.entries().iter().filter(|e| e.path == "/dev/sdb").count(), 1);
    }
}
