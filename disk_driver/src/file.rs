use crate::{DiskConst, DiskDriver, DiskInfo, SeekType, IOC_REQ_DEVICE_IO_SZ, IOC_REQ_DEVICE_RESET,
            IOC_REQ_DEVICE_SIZE, IOC_REQ_DEVICE_STATE};
use anyhow::{anyhow, Context, Result};
use log::*;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;

/// `BLKGETSIZE64`/`BLKSSZGET` — same numeric values the kernel block layer
/// exposes for querying a real block device; unused on plain backing files.
const BLKGETSIZE64: u64 = 0x80081272;
const BLKSSZGET: u64 = 0x1268;

/// A `DiskDriver` backed by a real path: either a block-special device or a
/// plain file standing in for one (used heavily by tests and by `mdadm`'s
/// own "loop over regular files" workflow).
pub struct FileDiskDriver {
    pub info: DiskInfo,
    file: Option<File>,
    pointer: u64,
}

impl FileDiskDriver {
    pub fn new(path: &str) -> Self {
        let mut me = Self {
            info: DiskInfo::default(),
            file: None,
            pointer: 0,
        };
        if !path.is_empty() {
            if let Err(e) = me.ddriver_open(path) {
                warn!("FileDiskDriver::new({}) deferred open failed: {}", path, e);
            }
        }
        me
    }

    fn is_block_device(file: &File) -> Result<bool> {
        Ok(file.metadata()?.file_type().is_block_device())
    }

    /// Query real geometry via ioctl when `path` names a block-special
    /// device; fall back to the file's length and a 512-byte sector for
    /// plain files (loopback testing).
    fn probe_geometry(file: &File) -> Result<(u64, u32)> {
        if Self::is_block_device(file)? {
            let fd = file.as_raw_fd();
            let mut size: u64 = 0;
            let mut sector: u32 = 0;
            let rc = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };
            if rc != 0 {
                return Err(anyhow!("BLKGETSIZE64 failed: {}", std::io::Error::last_os_error()));
            }
            let rc = unsafe { libc::ioctl(fd, BLKSSZGET as _, &mut sector as *mut u32) };
            if rc != 0 {
                return Err(anyhow!("BLKSSZGET failed: {}", std::io::Error::last_os_error()));
            }
            Ok((size, sector))
        } else {
            Ok((file.metadata()?.len(), 512))
        }
    }
}

impl DiskDriver for FileDiskDriver {
    fn ddriver_open(&mut self, path: &str) -> Result<()> {
        debug!("FileDiskDriver open: {}", path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening block device {}", path))?;
        let (layout_size, iounit_size) = Self::probe_geometry(&file)?;
        self.info.consts = DiskConst {
            major: 0,
            minor: 0,
            serial: String::new(),
            layout_size,
            iounit_size,
        };
        self.file = Some(file);
        self.pointer = 0;
        Ok(())
    }

    fn ddriver_close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }

    fn ddriver_seek(&mut self, offset: i64, whence: SeekType) -> Result<u64> {
        self.info.stats.seek_cnt += 1;
        let file = self.file.as_mut().ok_or_else(|| anyhow!("device not open"))?;
        let pos = match whence {
            SeekType::Set => SeekFrom::Start(offset as u64),
            SeekType::Cur => SeekFrom::Current(offset),
            SeekType::End => SeekFrom::End(-offset),
        };
        self.pointer = file.seek(pos)?;
        Ok(self.pointer)
    }

    fn ddriver_write(&mut self, buf: &[u8], size: usize) -> Result<usize> {
        self.info.stats.write_cnt += 1;
        let file = self.file.as_mut().ok_or_else(|| anyhow!("device not open"))?;
        file.write_all(&buf[..size])?;
        self.pointer += size as u64;
        Ok(size)
    }

    fn ddriver_read(&mut self, buf: &mut [u8], size: usize) -> Result<usize> {
        self.info.stats.read_cnt += 1;
        let file = self.file.as_mut().ok_or_else(|| anyhow!("device not open"))?;
        file.read_exact(&mut buf[..size])?;
        self.pointer += size as u64;
        Ok(size)
    }

    fn ddriver_ioctl(&mut self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        match cmd {
            IOC_REQ_DEVICE_SIZE => {
                arg[0..8].copy_from_slice(&self.info.consts.layout_size.to_le_bytes());
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
        self.info.stats = Default::default();
        self.pointer = 0;
        Ok(())
    }

    fn info(&self) -> &DiskInfo {
        &self.info
    }
}
