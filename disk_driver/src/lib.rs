//! Low-level access to the block devices that back RAID members.
//!
//! Mirrors the shape of a userspace disk driver: open/seek/read/write plus a
//! narrow `ioctl` for the handful of out-of-band queries the metadata engine
//! needs (device size, logical sector size, bad-block reset). Real devices
//! and RAID members never go through anything richer than this — the kernel
//! `md` driver and the IMSM anchor codec are the layers that add meaning.

use anyhow::Result;

pub mod file;
pub mod memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekType {
    Set,
    Cur,
    End,
}

/// Out-of-band queries a `DiskDriver` answers through `ddriver_ioctl`.
pub const IOC_REQ_DEVICE_SIZE: u32 = 1;
pub const IOC_REQ_DEVICE_STATE: u32 = 2;
pub const IOC_REQ_DEVICE_RESET: u32 = 3;
pub const IOC_REQ_DEVICE_IO_SZ: u32 = 4;

#[derive(Default, Debug, Clone, Copy)]
pub struct DiskStats {
    pub read_cnt: u64,
    pub write_cnt: u64,
    pub seek_cnt: u64,
}

/// Attributes a `BlockDevice` reports once opened (spec.md §3 `BlockDevice`).
#[derive(Debug, Clone)]
pub struct DiskConst {
    /// Kernel major/minor pair, when known (not meaningful for plain files).
    pub major: i32,
    pub minor: i32,
    /// Device-reported serial number, already trimmed/remapped by the caller.
    pub serial: String,
    /// Total size of the device in bytes.
    pub layout_size: u64,
    /// Reported logical sector size: 512 or 4096.
    pub iounit_size: u32,
}

impl Default for DiskConst {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            serial: String::new(),
            layout_size: 0,
            iounit_size: 512,
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct DiskInfo {
    pub stats: DiskStats,
    pub consts: DiskConst,
}

impl DiskConst {
    /// Total size expressed as a count of native sectors.
    pub fn sector_count(&self) -> u64 {
        self.layout_size / self.iounit_size as u64
    }
}

/// Abstract interface over one block device backing a RAID member.
///
/// Every operation is a thin, typed RPC — deliberately no richer than what
/// the kernel `md` driver itself exposes over ioctl (spec.md §6).
pub trait DiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()>;
    fn ddriver_close(&mut self) -> Result<()>;
    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64>;
    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize>;
    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize>;
    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()>;
    fn ddriver_reset(&mut self) -> Result<()>;

    fn info(&self) -> &DiskInfo;

    fn size_bytes(&self) -> u64 {
        self.info().consts.layout_size
    }

    fn sector_size(&self) -> u32 {
        self.info().consts.iounit_size
    }
}

#[cfg(test)]
pub(crate) fn driver_tester(driver: &mut dyn DiskDriver) -> Result<()> {
    driver.ddriver_open("test")?;
    let mut buf = [0u8; 4];
    driver.ddriver_ioctl(IOC_REQ_DEVICE_IO_SZ, &mut buf)?;
    Ok(())
}
