//! Metadata-handler abstraction (spec.md §4.1) and the two external-interface
//! seams it's built on: a kernel RPC surface standing in for `md` ioctls, and
//! a sysfs-tree surface standing in for `/sys/block/mdX/md/*` attribute
//! files. Both are traits so tests can swap a `MemoryDiskDriver`-backed fake
//! for the real kernel the way the teacher's `DiskDriver` trait lets
//! `rfs_lib` run against a `MemoryDiskDriver` instead of a loopback file.

use crate::mdcore::geometry::RaidLevel;
use crate::mdcore::imsm::{BadBlockLog, Disk, MigrationRecord, Volume, WriteHolePolicy};
use crate::mdcore::types::Sector;
use anyhow::Result;
use std::collections::BTreeMap;

/// Every metadata format this core can speak. Closed on purpose (spec.md
/// §4.1: "the set of formats is closed, new ones are not pluggable at
/// runtime") — adding one is a match-arm change across the whole module, not
/// a registration call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Imsm,
}

/// One container's worth of parsed superblock state, handed back by
/// `load_super` and consumed by every other trait method. Owns no file
/// handles; purely data, the same way the teacher's `Ext2FileSystem` keeps
/// parsed superblock/group-desc state separate from the open `DiskDriver`.
#[derive(Debug, Clone)]
pub struct ContainerSuper {
    pub format: MetadataFormat,
    pub family_num: u32,
    pub orig_family_num: u32,
    pub generation_num: u32,
    pub attributes: u32,
    pub disks: Vec<Disk>,
    pub volumes: Vec<Volume>,
    pub bbm_log: BadBlockLog,
    pub migration: Option<MigrationRecord>,
    pub native_sector_size: u32,
}

/// What `compare_super` decides between two supers claiming the same
/// container (spec.md §4.1 "compare_super").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperOrdering {
    SameFamily,
    ForeignFamily,
    StaleGeneration,
}

/// Closed set of in-place super mutations (spec.md §4.1 "update_super"):
/// every caller names *what* changed instead of handing over a whole new
/// super, so the handler can apply format-specific side effects (checksum
/// recompute, bbm renumbering) exactly once.
#[derive(Debug, Clone)]
pub enum UpdateKind {
    DiskAdded { disk: Disk },
    DiskRemoved { ordinal: u8 },
    DiskFailed { ordinal: u8 },
    VolumeCreated { volume: Volume },
    VolumeGrown { volume_id: u16, new_array_size: Sector },
    BadBlockRecorded { ordinal: u8, lba: Sector, len: u32 },
    BadBlockCleared { ordinal: u8, lba: Sector, len: u32 },
    GenerationBumped,
    /// Promote a spare slot to a configured member (spec.md §4.1
    /// "activate_spare").
    ActivateSpare { ordinal: u8 },
    /// Drop a volume entirely (spec.md §4.1 "kill_array").
    KillArray { volume_id: u16 },
    /// Rename a volume in place (spec.md §4.1 "rename_array").
    RenameArray { volume_id: u16, new_name: String },
    /// Grow or shrink the container's own disk set, independent of any one
    /// volume's map (spec.md §4.1 "reshape_container_disks").
    ReshapeContainerDisks { added: Vec<Disk> },
    /// Stamp a volume as migrating: push the destination map and the
    /// migration record in one commit (spec.md §4.1 "reshape_migration").
    ReshapeMigration { volume_id: u16, new_level: RaidLevel, new_raid_disks: u32, blocks_per_strip: Sector, migration: MigrationRecord },
    /// Takeover: same data layout, different redundancy scheme, no map push
    /// (spec.md §4.1 "takeover").
    Takeover { volume_id: u16, new_level: RaidLevel, new_raid_disks: u32 },
    /// Advance (or roll back) the migration record's checkpoint position
    /// without touching any other field (spec.md §4.1
    /// "migration_checkpoint").
    MigrationCheckpoint { current_migr_unit: u32 },
    /// Change a volume's write-hole policy (spec.md §4.1 "rwh_policy").
    RwhPolicy { volume_id: u16, policy: WriteHolePolicy },
}

/// Append-only queue of pending updates (spec.md §4.1 "update queue"):
/// callers record what changed; only the array monitor actually commits it
/// to a super, one `update_super` call per queued entry, in order.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    pending: Vec<UpdateKind>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: UpdateKind) {
        self.pending.push(update);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Vec<UpdateKind> {
        std::mem::take(&mut self.pending)
    }
}

/// Owns one container's super plus the queue of updates not yet applied to
/// it. The monitor loop is the only caller that drains the queue; every
/// other component just pushes onto it (spec.md §4.1 "update queue").
pub struct ArrayMonitor<'h, H: MetadataHandler> {
    pub sup: ContainerSuper,
    pub queue: UpdateQueue,
    handler: &'h H,
}

impl<'h, H: MetadataHandler> ArrayMonitor<'h, H> {
    pub fn new(handler: &'h H, sup: ContainerSuper) -> Self {
        Self { sup, queue: UpdateQueue::new(), handler }
    }

    pub fn queue_update(&mut self, update: UpdateKind) {
        self.queue.push(update);
    }

    /// Apply every queued update in order, returning how many were applied.
    pub fn drain_and_apply(&mut self) -> Result<usize> {
        let pending = self.queue.drain();
        let applied = pending.len();
        for update in pending {
            self.handler.update_super(&mut self.sup, update)?;
        }
        Ok(applied)
    }
}

/// Platform/OROM-sourced bounds a handler folds into its own validation
/// (spec.md §4.3 step 8 collaborator, deliberately left opaque — see
/// SPEC_FULL.md "Supplemented features").
#[derive(Debug, Clone, Copy, Default)]
pub struct SpareCriteria {
    pub min_size: Option<Sector>,
    pub max_raid_disks: Option<u32>,
}

/// Summary row used by `container_content` / reporting commands (spec.md
/// §4.1, §6).
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub volume_id: u16,
    pub name: String,
    pub level: RaidLevel,
    pub array_size: Sector,
    pub degraded: bool,
    pub resyncing: bool,
}

/// The seam every format plugs into. One implementor (`imsm::ImsmHandler`,
/// built directly on the `imsm` module's codec functions) lives in this
/// crate; the trait exists so `create`/`incremental`/`reshape` never match on
/// `MetadataFormat` themselves.
pub trait MetadataHandler {
    fn format(&self) -> MetadataFormat;

    /// Cheap sniff: does this byte-range look like our signature? Used
    /// before the expensive `load_super` parse (spec.md §4.1
    /// "match_by_descriptor").
    fn match_by_descriptor(&self, anchor_bytes: &[u8]) -> bool;

    fn load_super(&self, anchor_bytes: &[u8], native_sector_size: u32) -> Result<ContainerSuper>;

    /// Serialize `sup` back into a byte buffer ready to be written at the
    /// container's anchor offset, checksum included.
    fn store_super(&self, sup: &ContainerSuper) -> Result<Vec<u8>>;

    fn compare_super(&self, ours: &ContainerSuper, theirs: &ContainerSuper) -> SuperOrdering;

    /// Build a brand-new super for a freshly created container (spec.md
    /// §4.3 step 5 "init_super").
    fn init_super(&self, family_num: u32) -> ContainerSuper;

    fn add_to_super(&self, sup: &mut ContainerSuper, disk: Disk) -> Result<()>;

    /// Volume-create side of §4.3 step 7: append a volume record to an
    /// already-initialized container super.
    fn write_init_super(&self, sup: &mut ContainerSuper, volume: Volume) -> Result<()>;

    fn free_super(&self, sup: ContainerSuper) {
        drop(sup);
    }

    fn container_content(&self, sup: &ContainerSuper) -> Vec<VolumeInfo>;

    fn validate_geometry(
        &self,
        level: RaidLevel,
        raid_disks: u32,
        chunk_kib: Option<u32>,
        spare_criteria: &SpareCriteria,
    ) -> Result<()>;

    fn getinfo_super(&self, sup: &ContainerSuper, volume_id: u16) -> Option<VolumeInfo>;

    fn update_super(&self, sup: &mut ContainerSuper, change: UpdateKind) -> Result<()>;

    /// Advance one reshape checkpoint; returns `true` when the reshape is
    /// complete (spec.md §4.5 "manage_reshape").
    fn manage_reshape(&self, sup: &mut ContainerSuper, volume_id: u16) -> Result<bool>;

    fn get_spare_criteria(&self, sup: &ContainerSuper) -> SpareCriteria;

    fn write_bitmap(&self, sup: &ContainerSuper, volume_id: u16) -> Result<Vec<u8>>;

    fn locate_bitmap(&self, sup: &ContainerSuper, volume_id: u16, data_end: Sector) -> Sector;
}

/// Stand-in for the `md` driver's ioctl surface (spec.md §6 "External
/// Interfaces"). Mirrors the shape of the teacher's `DiskDriver` trait:
/// a small, synchronous, mockable capability interface rather than a raw
/// syscall wrapper sprinkled through the business logic.
pub trait KernelRpc {
    fn create_array(&mut self, devnm: &str) -> Result<()>;
    fn add_disk(&mut self, devnm: &str, member_path: &str) -> Result<()>;
    fn remove_disk(&mut self, devnm: &str, member_path: &str) -> Result<()>;
    fn run_array(&mut self, devnm: &str) -> Result<()>;
    fn stop_array(&mut self, devnm: &str) -> Result<()>;
    fn set_array_size(&mut self, devnm: &str, size: Sector) -> Result<()>;
    fn begin_reshape(&mut self, devnm: &str) -> Result<()>;
}

/// Stand-in for `/sys/block/mdX/md/*`: a small key-value store with a
/// notification channel, modeled as a plain map plus a pending-event queue so
/// tests can assert on what the monitor loop would have read.
pub trait SysfsTree {
    fn read_attr(&self, devnm: &str, attr: &str) -> Option<String>;
    fn write_attr(&mut self, devnm: &str, attr: &str, value: &str) -> Result<()>;
    /// Drains events queued since the last poll (spec.md §4.6 "Event
    /// detection").
    fn poll_events(&mut self, devnm: &str) -> Vec<String>;
}

/// In-memory `SysfsTree` used by tests and by `monitor.rs`'s own unit tests;
/// not wired to any real sysfs.
#[derive(Debug, Default)]
pub struct FakeSysfsTree {
    attrs: BTreeMap<(String, String), String>,
    pending_events: BTreeMap<String, Vec<String>>,
}

impl FakeSysfsTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, devnm: &str, event: &str) {
        self.pending_events.entry(devnm.to_string()).or_default().push(event.to_string());
    }
}

impl SysfsTree for FakeSysfsTree {
    fn read_attr(&self, devnm: &str, attr: &str) -> Option<String> {
        self.attrs.get(&(devnm.to_string(), attr.to_string())).cloned()
    }

    fn write_attr(&mut self, devnm: &str, attr: &str, value: &str) -> Result<()> {
        self.attrs.insert((devnm.to_string(), attr.to_string()), value.to_string());
        Ok(())
    }

    fn poll_events(&mut self, devnm: &str) -> Vec<String> {
        self.pending_events.remove(devnm).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_sysfs_round_trips_attrs() {
        let mut tree = FakeSysfsTree::new();
        tree.write_attr("md127", "array_state", "clean").unwrap();
        assert_eq!(tree.read_attr("md127", "array_state").as_deref(), Some("clean"));
    }

    #[test]
    fn fake_sysfs_drains_events_once() {
        let mut tree = FakeSysfsTree::new();
        tree.push_event("md127", "DeviceDisappeared");
        assert_eq!(tree.poll_events("md127"), vec!["DeviceDisappeared".to_string()]);
        assert!(tree.poll_events("md127").is_empty());
    }

    #[test]
    fn array_monitor_applies_queued_updates_in_order_then_empties_queue() {
        use crate::mdcore::imsm::{disk_state, ImsmHandler};

        let handler = ImsmHandler;
        let sup = handler.init_super(1);
        let mut monitor = ArrayMonitor::new(&handler, sup);

        monitor.queue_update(UpdateKind::DiskAdded {
            disk: Disk { serial: "S0".into(), total_blocks: 1000, scsi_id: 0, status: disk_state::CONFIGURED },
        });
        monitor.queue_update(UpdateKind::DiskAdded {
            disk: Disk { serial: "S1".into(), total_blocks: 1000, scsi_id: 0, status: disk_state::CONFIGURED },
        });
        assert_eq!(monitor.queue.len(), 2);

        let applied = monitor.drain_and_apply().unwrap();
        assert_eq!(applied, 2);
        assert!(monitor.queue.is_empty());
        assert_eq!(monitor.sup.disks.len(), 2);
    }
}
