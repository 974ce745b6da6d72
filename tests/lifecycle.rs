//! End-to-end exercise of one container's lifecycle: create a degraded-safe
//! RAID5, admit a late member through incremental assembly, kick off a
//! reshape, and confirm the monitor's event triage reacts to it.

use disk_driver::memory::MemoryDiskDriver;
use mdcore::mdcore::create::{self, CreateRequest, MemberProbe};
use mdcore::mdcore::geometry::RaidLevel;
use mdcore::mdcore::handler::{ContainerSuper, KernelRpc, MetadataHandler, SpareCriteria};
use mdcore::mdcore::imsm::{ImsmHandler, WriteHolePolicy};
use mdcore::mdcore::incremental::{self, Admission, IncomingDevice};
use mdcore::mdcore::monitor;
use mdcore::mdcore::namemap::{HostIdentity, MemoryMapStore};
use mdcore::mdcore::reshape::{self, ChangeKind};

fn member_drivers(req: &CreateRequest) -> Vec<MemoryDiskDriver> {
    req.members
        .iter()
        .map(|m| MemoryDiskDriver::new(m.size_sectors * 512, 512, m.serial.clone()))
        .collect()
}

struct FakeKernel {
    created: Vec<String>,
    added: Vec<(String, String)>,
    started: Vec<String>,
}

impl FakeKernel {
    fn new() -> Self {
        FakeKernel { created: vec![], added: vec![], started: vec![] }
    }
}

impl KernelRpc for FakeKernel {
    fn create_array(&mut self, devnm: &str) -> anyhow::Result<()> {
        self.created.push(devnm.to_string());
        Ok(())
    }
    fn add_disk(&mut self, devnm: &str, member_path: &str) -> anyhow::Result<()> {
        self.added.push((devnm.to_string(), member_path.to_string()));
        Ok(())
    }
    fn remove_disk(&mut self, _devnm: &str, _member_path: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn run_array(&mut self, devnm: &str) -> anyhow::Result<()> {
        self.started.push(devnm.to_string());
        Ok(())
    }
    fn stop_array(&mut self, _devnm: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn set_array_size(&mut self, _devnm: &str, _size: u64) -> anyhow::Result<()> {
        Ok(())
    }
    fn begin_reshape(&mut self, _devnm: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

fn three_member_request() -> CreateRequest {
    CreateRequest {
        name: "lifecycle".into(),
        level: RaidLevel::Raid5,
        layout: None,
        chunk_kib: Some(128),
        members: vec![
            MemberProbe { serial: "A".into(), size_sectors: 20 * mdcore::mdcore::geometry::MIB, existing_extents: vec![] },
            MemberProbe { serial: "B".into(), size_sectors: 20 * mdcore::mdcore::geometry::MIB, existing_extents: vec![] },
            MemberProbe { serial: "C".into(), size_sectors: 20 * mdcore::mdcore::geometry::MIB, existing_extents: vec![] },
        ],
        spares: 0,
        homehost: None,
        assume_clean: false,
        force: false,
        write_hole_policy: WriteHolePolicy::Off,
        bitmap_file: None,
    }
}

#[test]
fn create_then_incremental_then_reshape_then_monitor() {
    let handler = ImsmHandler;
    let req = three_member_request();
    let plan = create::validate(&req, &SpareCriteria::default()).expect("valid create request");

    let mut kernel = FakeKernel::new();
    let mut store = MemoryMapStore::default();
    let mut drivers = member_drivers(&req);
    let mut members_io: Vec<&mut MemoryDiskDriver> = drivers.iter_mut().collect();
    let mut sup: ContainerSuper =
        create::publish(&req, &plan, &handler, &mut kernel, &mut store, &mut members_io).expect("publish succeeds");

    assert_eq!(kernel.created.len(), 1);
    assert_eq!(kernel.started.len(), 1);
    assert_eq!(sup.disks.len(), 3);
    assert_eq!(sup.volumes.len(), 1);

    // Simulate a fresh disk arriving late via incremental assembly: the
    // container was built with exactly `raid_disks` members, so the quorum
    // is already complete, but admitting a duplicate-serial device must be
    // a no-op rather than a double-add.
    let identity = HostIdentity { homehost: None };
    let device = IncomingDevice {
        path: "/dev/loop-a".into(),
        serial: "A".into(),
        size_sectors: 20 * mdcore::mdcore::geometry::MIB,
        recorded_homehost: None,
    };
    let admission = incremental::admit(&handler, &mut sup, &identity, &device, 1).expect("admit succeeds");
    assert_eq!(admission, Admission::Complete);
    assert_eq!(sup.disks.len(), 3, "re-admitting a known serial must not duplicate it");

    // Kick off a migration to RAID10 and drive it to completion.
    let kind = reshape::analyze_change(&sup, 1, Some(RaidLevel::Raid10), Some(4), None).expect("classifiable change");
    assert_eq!(kind, ChangeKind::Migration);

    // RAID10 needs 4 members; widen the container first the way a real
    // `mdadm --grow --raid-devices=4` would (out of scope to simulate the
    // kernel side here, just the super-level bookkeeping).
    sup.disks.push(mdcore::mdcore::imsm::Disk {
        serial: "D".into(),
        total_blocks: 20 * mdcore::mdcore::geometry::MIB,
        scsi_id: 0,
        status: mdcore::mdcore::imsm::disk_state::CONFIGURED,
    });

    reshape::begin_migration(&handler, &mut sup, 1, RaidLevel::Raid10, 4, 256).expect("migration begins");
    assert!(sup.volumes[0].migrating);

    reshape::run_to_completion(&handler, &mut sup, 1, 10_000).expect("reshape completes within bound");
    assert!(!sup.volumes[0].migrating);
    assert_eq!(reshape::progress_fraction(&sup), 1.0);

    // The monitor should treat a RebuildFinished event on this container as
    // warning-tier and, with no alert command or mail configured, log-only.
    let actions = monitor::action_for(monitor::Event::RebuildFinished, "md0", None, None);
    assert_eq!(
        actions,
        vec![monitor::Action::Syslog { message: "RebuildFinished on md0".into(), priority: monitor::Priority::Warning }]
    );
}

#[test]
fn incremental_degrades_device_from_foreign_homehost_instead_of_rejecting() {
    let handler = ImsmHandler;
    let req = three_member_request();
    let plan = create::validate(&req, &SpareCriteria::default()).unwrap();
    let mut kernel = FakeKernel::new();
    let mut store = MemoryMapStore::default();
    let mut drivers = member_drivers(&req);
    let mut members_io: Vec<&mut MemoryDiskDriver> = drivers.iter_mut().collect();
    let mut sup = create::publish(&req, &plan, &handler, &mut kernel, &mut store, &mut members_io).unwrap();

    let identity = HostIdentity { homehost: Some("vault-01".into()) };
    let device = IncomingDevice {
        path: "/dev/loop-x".into(),
        serial: "X".into(),
        size_sectors: 20 * mdcore::mdcore::geometry::MIB,
        recorded_homehost: Some("other-host".into()),
    };
    let admission = incremental::admit(&handler, &mut sup, &identity, &device, 1).expect("admit degrades rather than errors");
    assert_eq!(admission, Admission::Complete);
    let disk = sup.disks.iter().find(|d| d.serial == "X").unwrap();
    assert_ne!(disk.status & mdcore::mdcore::imsm::disk_state::FOREIGN, 0);
}
