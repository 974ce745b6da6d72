use crate::{DiskConst, DiskDriver, DiskInfo, SeekType, IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_RESET,
            IOC_REQ_DEVICE_SIZE, IOC_REQ_DEVICE_STATE};
use anyhow::{anyhow, Result};

/// An in-memory stand-in for a block device, used by unit and integration
/// tests so the metadata engine can be exercised without root or a real
/// loopback device.
pub struct MemoryDiskDriver {
    pub info: DiskInfo,
    mem: Vec<u8>,
    pointer: usize,
}

impl MemoryDiskDriver {
    pub fn new(size_bytes: usize, sector_size: u32, serial: &str) -> Self {
        Self {
            info: DiskInfo {
                stats: Default::default(),
                consts: DiskConst {
                    layout_size: size_bytes as u64,
                    iounit_size: sector_size,
                    serial: serial.to_string(),
                    ..Default::default()
                },
            },
            mem: vec![0u8; size_bytes],
            pointer: 0,
        }
    }
}

impl DiskDriver for MemoryDiskDriver {
    fn ddriver_open(&mut self, _path: &str) -> Result<()> {
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        self.pointer = match whence {
            SeekType::Set => offset as usize,
            SeekType::Cur => (self.pointer as i64 + offset) as usize,
            SeekType::End => (self.mem.len() as i64 - offset) as usize,
        };
        Ok(self.pointer as u64)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        self.info.stats.write_cnt += 1;
        if self.pointer + size > self.mem.len() {
            return Err(anyhow!("write past end of device"));
        }
        self.mem[self.pointer..self.pointer + size].copy_from_slice(&buf[..size]);
        self.pointer += size;
        Ok(size)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        self.info.stats.read_cnt += 1;
        if self.pointer + size > self.mem.len() {
            return Err(anyhow!("read past end of device"));
        }
        buf[..size].copy_from_slice(&self.mem[self.pointer..self.pointer + size]);
        self.pointer += size;
        Ok(size)
    }

    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        match cmd {
            IOC_REQ_DEVICE_SIZE => {
                arg[0..8].copy_from_slice(&(self.mem.len() as u64).to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_STATE => {
                arg[0..8].copy_from_slice(&self.info.stats.write_cnt.to_le_bytes());
                arg[8..16].copy_from_slice(&self.info.stats.read_cnt.to_le_bytes());
                Ok(())
            }
            IOC_REQ_DEVICE_RESET => self.ddriver_reset(),
            IOC_REQ_DEVICE_IO_SZ => {
                arg[0..4].copy_from_slice(&self.info.consts.iounit_size.to_le_bytes());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn ddriver_reset(&mut self) -> Result<()> {
        self.mem.iter_mut().for_each(|b| *b = 0);
        self.info.stats = Default::default();
        self.pointer = 0;
        Ok(())
    }

    fn info(&self) -> &DiskInfo {
        &self.info
    }
}
