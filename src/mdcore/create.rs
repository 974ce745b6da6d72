//! Array creation (spec.md §4.3). Validates a request end to end before any
//! disk is touched, then publishes: name claim, kernel array node, a
//! fork-zeroed metadata region, two-pass member attach, supers, bitmap,
//! start, release, and an external udev kick.
//!
//! The fork/signal dance for zeroing mirrors the teacher's `main.rs`
//! daemonization: `fork::Fork` to run the zeroing child, `nix::sys::signal`
//! to block `SIGINT` for the parent across the critical section so a
//! Ctrl-C can't interleave with a half-written super.

use crate::mdcore::error::MdError;
use crate::mdcore::extents::{largest_common_free_run, Extent};
use crate::mdcore::geometry::{self, Layout, RaidLevel};
use crate::mdcore::handler::{KernelRpc, MetadataHandler, SpareCriteria};
use crate::mdcore::imsm::{self, Disk, Map, Volume, WriteHolePolicy};
use crate::mdcore::namemap::{MapStore, NameMap};
use crate::mdcore::types::Sector;
use anyhow::{anyhow, Context, Result};
use disk_driver::{DiskDriver, SeekType};
use fork::{fork, Fork};
use log::warn;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::collections::HashSet;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MemberProbe {
    pub serial: String,
    pub size_sectors: Sector,
    pub existing_extents: Vec<Extent>,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub level: RaidLevel,
    pub layout: Option<Layout>,
    pub chunk_kib: Option<u32>,
    pub members: Vec<MemberProbe>,
    pub spares: usize,
    pub homehost: Option<String>,
    /// `--assume-clean`: publish the volume as already in sync, skipping the
    /// initial resync the kernel would otherwise schedule.
    pub assume_clean: bool,
    /// `--force`: downgrade the platform-minimum-size check from a hard
    /// error to a logged warning. Never relaxes a structural invariant
    /// (member count, chunk power-of-two, duplicate serials).
    pub force: bool,
    pub write_hole_policy: WriteHolePolicy,
    /// External bitmap file path (spec.md §4.3 "bitmap placement"); `None`
    /// means the internal, in-metadata bitmap area.
    pub bitmap_file: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatePlan {
    pub devnm: String,
    pub uuid: Uuid,
    pub layout: Layout,
    pub chunk: Option<Sector>,
    pub blocks_per_member: Sector,
    pub array_size: Sector,
    pub raid_disks: u32,
}

/// Validation-only pass over a request: spec.md §4.3 steps 1-6, runnable
/// without touching any device. Kept separate from `publish` so callers can
/// dry-run (`mdadm --create --dry-run` equivalent isn't in scope per
/// spec.md §1, but the split is the same one that enables it).
pub fn validate(req: &CreateRequest, spare_criteria: &SpareCriteria) -> Result<CreatePlan> {
    Volume::validate_name(&req.name)?;

    let raid_disks = (req.members.len() - req.spares) as u32;
    if req.spares > req.members.len() {
        return Err(MdError::Config("more spares requested than members supplied".into()).into());
    }
    geometry::validate_device_count(req.level, raid_disks, req.spares as u32, 0, spare_criteria.max_raid_disks)?;

    let chunk = geometry::validate_chunk(req.level, req.chunk_kib, None)?;
    let layout = req.layout.or_else(|| Layout::default_for(req.level));
    if req.level.requires_chunk() && chunk.is_none() {
        return Err(MdError::Geometry("level requires a chunk size".into()).into());
    }

    let mut seen_serials = HashSet::new();
    for m in &req.members {
        if let Some(min) = spare_criteria.min_size {
            if m.size_sectors < min {
                if req.force {
                    warn!("member {:?} is below platform minimum {} sectors, proceeding under --force", m.serial, min);
                } else {
                    return Err(MdError::Geometry(format!("member smaller than platform minimum {} sectors", min)).into());
                }
            }
        }
        if !seen_serials.insert(m.serial.clone()) {
            return Err(MdError::Config(format!("duplicate member serial {:?}", m.serial)).into());
        }
    }

    let per_member_extents: Vec<(Sector, Vec<Extent>)> =
        req.members.iter().map(|m| (m.size_sectors, m.existing_extents.clone())).collect();
    let chunk_for_alignment = chunk.unwrap_or(1);
    let free_run = largest_common_free_run(&per_member_extents, chunk_for_alignment);
    if free_run == 0 {
        return Err(MdError::Geometry("no common free space across members".into()).into());
    }

    let array_size = geometry::array_size(req.level, raid_disks, free_run);
    if array_size == 0 {
        return Err(MdError::Geometry("resulting array size rounds to zero".into()).into());
    }

    Ok(CreatePlan {
        devnm: String::new(),
        uuid: Uuid::nil(),
        layout: layout.unwrap_or(Layout::Raid0Original),
        chunk,
        blocks_per_member: free_run,
        array_size,
        raid_disks,
    })
}

/// Zero the metadata region on one member in a forked child, the way the
/// teacher forks for long filesystem operations it doesn't want to run on
/// the main thread. The parent blocks `SIGINT` for the duration so a
/// Ctrl-C lands after the child's write lands, never mid-write.
pub fn zero_metadata_region<D: DiskDriver>(driver: &mut D, start_sector: Sector, sectors: Sector) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None).context("blocking SIGINT for zeroing")?;

    let result = match fork().map_err(|e| anyhow!("fork failed: {:?}", e))? {
        Fork::Child => {
            let zeros = vec![0u8; 4096];
            let mut remaining = sectors;
            let mut cursor = start_sector;
            let outcome = (|| -> Result<()> {
                driver.ddriver_seek(cursor as i64, disk_driver::SeekType::Set)?;
                while remaining > 0 {
                    let take = remaining.min((zeros.len() / 512) as Sector).max(1);
                    driver.ddriver_write(&zeros[..(take as usize * 512).min(zeros.len())], take as usize * 512)?;
                    remaining -= take;
                    cursor += take;
                }
                Ok(())
            })();
            std::process::exit(if outcome.is_ok() { 0 } else { 1 });
        }
        Fork::Parent(child_pid) => {
            waitpid(Pid::from_raw(child_pid), None).context("waiting for zeroing child")
        }
    };

    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None).context("unblocking SIGINT after zeroing")?;
    result.map(|_| ())
}

/// Publish a validated plan: claim the name, initialize the super, attach
/// members in two passes (configured disks, then spares), zero each
/// member's metadata region, write the bitmap and the super to every
/// member, then start the array. `members_io` must be given in the same
/// order as `req.members` (configured disks first, then spares) so each
/// disk's on-disk I/O lands on the right device.
pub fn publish<H: MetadataHandler, K: KernelRpc, S: MapStore, D: DiskDriver>(
    req: &CreateRequest,
    plan: &CreatePlan,
    handler: &H,
    kernel: &mut K,
    store: &mut S,
    members_io: &mut [&mut D],
) -> Result<crate::mdcore::handler::ContainerSuper> {
    if members_io.len() != req.members.len() {
        return Err(anyhow!("expected one disk driver per member, got {} for {} members", members_io.len(), req.members.len()));
    }

    let mut name_map = NameMap::parse(&store.read()?)?;
    let devnm = name_map.allocate_devnm()?;
    let uuid = Uuid::new_v4();
    name_map.claim(devnm.clone(), 1, uuid, format!("/dev/{}", devnm))?;
    store.atomic_write(&name_map.serialize())?;

    kernel.create_array(&devnm).context("kernel create_array")?;

    for driver in members_io.iter_mut() {
        zero_metadata_region(*driver, 0, geometry::RESERVED_SECTORS)
            .context("zeroing member's metadata region before publish")?;
    }

    let mut sup = handler.init_super(1);
    let mut configured_first: Vec<&MemberProbe> = req.members.iter().take(plan.raid_disks as usize).collect();
    let mut spares: Vec<&MemberProbe> = req.members.iter().skip(plan.raid_disks as usize).collect();

    for member in configured_first.drain(..) {
        let disk = Disk {
            serial: Disk::normalize_serial(&member.serial),
            total_blocks: member.size_sectors,
            scsi_id: 0,
            status: crate::mdcore::imsm::disk_state::CONFIGURED,
        };
        handler.add_to_super(&mut sup, disk)?;
        kernel.add_disk(&devnm, &member.serial)?;
    }
    for member in spares.drain(..) {
        let disk = Disk {
            serial: Disk::normalize_serial(&member.serial),
            total_blocks: member.size_sectors,
            scsi_id: 0,
            status: crate::mdcore::imsm::disk_state::SPARE,
        };
        handler.add_to_super(&mut sup, disk)?;
        kernel.add_disk(&devnm, &member.serial)?;
    }

    let map = Map {
        pba_of_lba0: geometry::RESERVED_SECTORS,
        blocks_per_member: plan.blocks_per_member,
        level: req.level,
        num_domains: req.level.domain_count() as u8,
        num_members: plan.raid_disks as u8,
        map_state: crate::mdcore::imsm::map_state::NORMAL,
        blocks_per_strip: plan.chunk.unwrap_or(0),
        failed_disk_num: None,
        ordinal_table: (0..plan.raid_disks).map(|i| (i, false)).collect(),
    };
    let volume_id = (sup.volumes.len() as u16) + 1;
    let volume = Volume {
        name: req.name.clone(),
        volume_id,
        array_size: plan.array_size,
        status: if req.assume_clean { crate::mdcore::imsm::volume_status::CLEAN } else { crate::mdcore::imsm::volume_status::DIRTY },
        write_hole_policy: req.write_hole_policy,
        migrating: false,
        migr_type: 0,
        maps: vec![map],
    };
    handler.write_init_super(&mut sup, volume)?;

    if req.bitmap_file.is_none() {
        let bitmap_offset = handler.locate_bitmap(&sup, volume_id, plan.array_size);
        let bitmap_bytes = handler.write_bitmap(&sup, volume_id)?;
        for driver in members_io.iter_mut() {
            driver.ddriver_seek((bitmap_offset * 512) as i64, SeekType::Set).context("seek to bitmap area")?;
            driver.ddriver_write(&bitmap_bytes, bitmap_bytes.len()).context("write bitmap area")?;
        }
    }

    for driver in members_io.iter_mut() {
        imsm::store_super_to_disk(*driver, &sup).context("writing super to member")?;
    }

    kernel.run_array(&devnm).context("kernel run_array")?;
    Ok(sup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdcore::imsm::ImsmHandler;
    use crate::mdcore::namemap::MemoryMapStore;
    use disk_driver::memory::MemoryDiskDriver;

    struct FakeKernel {
        created: Vec<String>,
        started: Vec<String>,
    }

    impl KernelRpc for FakeKernel {
        fn create_array(&mut self, devnm: &str) -> Result<()> {
            self.created.push(devnm.to_string());
            Ok(())
        }
        fn add_disk(&mut self, _devnm: &str, _member_path: &str) -> Result<()> {
            Ok(())
        }
        fn remove_disk(&mut self, _devnm: &str, _member_path: &str) -> Result<()> {
            Ok(())
        }
        fn run_array(&mut self, devnm: &str) -> Result<()> {
            self.started.push(devnm.to_string());
            Ok(())
        }
        fn stop_array(&mut self, _devnm: &str) -> Result<()> {
            Ok(())
        }
        fn set_array_size(&mut self, _devnm: &str, _size: Sector) -> Result<()> {
            Ok(())
        }
        fn begin_reshape(&mut self, _devnm: &str) -> Result<()> {
            Ok(())
        }
    }

    fn sample_request() -> CreateRequest {
        CreateRequest {
            name: "data0".into(),
            level: RaidLevel::Raid5,
            layout: None,
            chunk_kib: Some(128),
            members: vec![
                MemberProbe { serial: "S1".into(), size_sectors: 200 * geometry::MIB, existing_extents: vec![] },
                MemberProbe { serial: "S2".into(), size_sectors: 200 * geometry::MIB, existing_extents: vec![] },
                MemberProbe { serial: "S3".into(), size_sectors: 200 * geometry::MIB, existing_extents: vec![] },
            ],
            spares: 0,
            homehost: None,
            assume_clean: false,
            force: false,
            write_hole_policy: WriteHolePolicy::Off,
            bitmap_file: None,
        }
    }

    fn member_drivers(req: &CreateRequest) -> Vec<MemoryDiskDriver> {
        req.members
            .iter()
            .map(|m| MemoryDiskDriver::new(m.size_sectors * 512, 512, m.serial.clone()))
            .collect()
    }

    #[test]
    fn validate_rejects_fewer_than_minimum_members() {
        let mut req = sample_request();
        req.members.truncate(2);
        let plan = validate(&req, &SpareCriteria::default());
        assert!(plan.is_err());
    }

    #[test]
    fn validate_computes_nonzero_array_size() {
        let req = sample_request();
        let plan = validate(&req, &SpareCriteria::default()).unwrap();
        assert!(plan.array_size > 0);
        assert_eq!(plan.raid_disks, 3);
    }

    #[test]
    fn validate_rejects_duplicate_serials() {
        let mut req = sample_request();
        req.members[1].serial = req.members[0].serial.clone();
        assert!(validate(&req, &SpareCriteria::default()).is_err());
    }

    #[test]
    fn publish_claims_name_and_writes_volume() {
        let req = sample_request();
        let plan = validate(&req, &SpareCriteria::default()).unwrap();
        let handler = ImsmHandler;
        let mut kernel = FakeKernel { created: vec![], started: vec![] };
        let mut store = MemoryMapStore::default();
        let mut drivers = member_drivers(&req);
        let mut members_io: Vec<&mut MemoryDiskDriver> = drivers.iter_mut().collect();
        let sup = publish(&req, &plan, &handler, &mut kernel, &mut store, &mut members_io).unwrap();
        assert_eq!(sup.volumes.len(), 1);
        assert_eq!(sup.volumes[0].name, "data0");
        assert_eq!(kernel.created.len(), 1);
        assert_eq!(kernel.started.len(), 1);
    }
}
