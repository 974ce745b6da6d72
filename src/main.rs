//! Thin CLI front-end. Full command-line ergonomics are out of scope (the
//! spec scopes this core to the library operations, not a `mdadm`-compatible
//! argument grammar); this binary wires just enough `clap` plumbing to drive
//! `create::validate` against real block devices so the library is runnable
//! outside its test suite, the same relationship the teacher's `main.rs` has
//! to `rfs_lib`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use disk_driver::file::FileDiskDriver;
use disk_driver::DiskDriver;
use log::info;
use mdcore::mdcore::config::Config;
use mdcore::mdcore::create::{self, CreateRequest, MemberProbe};
use mdcore::mdcore::geometry::RaidLevel;
use mdcore::mdcore::handler::{KernelRpc, SpareCriteria};
use mdcore::mdcore::imsm::{ImsmHandler, WriteHolePolicy};
use mdcore::mdcore::namemap::MapStore;
use std::fs;

#[derive(Parser)]
#[command(name = "mdcore", about = "Userspace RAID array core (IMSM container format)")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a create request against real devices, then publish it:
    /// claim a devnm, write supers and bitmap to every member, and ask the
    /// kernel to run the array.
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        level: String,
        #[arg(long)]
        chunk_kib: Option<u32>,
        #[arg(long, default_value_t = 0)]
        spares: usize,
        #[arg(long)]
        assume_clean: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        bitmap_file: Option<String>,
        devices: Vec<String>,
    },
}

/// `MapStore` backed by a real file on disk, standing in for
/// `/run/mdadm/map`.
struct FileMapStore {
    path: String,
}

impl MapStore for FileMapStore {
    fn read(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path)),
        }
    }
    fn atomic_write(&mut self, contents: &str) -> Result<()> {
        let tmp_path = format!("{}.tmp", self.path);
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&tmp_path, contents).with_context(|| format!("writing {}", tmp_path))?;
        fs::rename(&tmp_path, &self.path).with_context(|| format!("renaming {} to {}", tmp_path, self.path))?;
        Ok(())
    }
}

/// `KernelRpc` that logs each control operation instead of issuing the
/// real `ioctl`s: the core treats the kernel as a typed RPC seam, and this
/// binary's job is to exercise metadata publication, not to drive an
/// actual `md` module.
struct LoggingKernelRpc;

impl KernelRpc for LoggingKernelRpc {
    fn create_array(&mut self, devnm: &str) -> Result<()> {
        info!("kernel: create_array {}", devnm);
        Ok(())
    }
    fn add_disk(&mut self, devnm: &str, member_path: &str) -> Result<()> {
        info!("kernel: add_disk {} {}", devnm, member_path);
        Ok(())
    }
    fn remove_disk(&mut self, devnm: &str, member_path: &str) -> Result<()> {
        info!("kernel: remove_disk {} {}", devnm, member_path);
        Ok(())
    }
    fn run_array(&mut self, devnm: &str) -> Result<()> {
        info!("kernel: run_array {}", devnm);
        Ok(())
    }
    fn stop_array(&mut self, devnm: &str) -> Result<()> {
        info!("kernel: stop_array {}", devnm);
        Ok(())
    }
    fn set_array_size(&mut self, devnm: &str, size: u64) -> Result<()> {
        info!("kernel: set_array_size {} {}", devnm, size);
        Ok(())
    }
    fn begin_reshape(&mut self, devnm: &str) -> Result<()> {
        info!("kernel: begin_reshape {}", devnm);
        Ok(())
    }
}

fn probe(path: &str) -> Result<MemberProbe> {
    let mut driver = FileDiskDriver::new("");
    driver.ddriver_open(path).with_context(|| format!("opening {}", path))?;
    let probe = MemberProbe {
        serial: path.to_string(),
        size_sectors: driver.size_bytes() / driver.sector_size() as u64,
        existing_extents: Vec::new(),
    };
    driver.ddriver_close()?;
    Ok(probe)
}

fn main() -> Result<()> {
    env_logger::init();
    let config = Config::from_env()?;
    info!("mdcore starting, map file at {}", config.map_path);

    let cli = Cli::parse();
    match cli.command {
        Command::Create { name, level, chunk_kib, spares, assume_clean, force, bitmap_file, devices } => {
            let level = RaidLevel::parse(&level)?;
            let members = devices.iter().map(|d| probe(d)).collect::<Result<Vec<_>>>()?;
            let req = CreateRequest {
                name,
                level,
                layout: None,
                chunk_kib,
                members,
                spares,
                homehost: config.homehost.clone(),
                assume_clean,
                force,
                write_hole_policy: WriteHolePolicy::Off,
                bitmap_file,
            };
            let plan = create::validate(&req, &SpareCriteria::default())?;
            println!(
                "plan: {} devices, array_size={} sectors, blocks_per_member={} sectors, chunk={:?}",
                plan.raid_disks, plan.array_size, plan.blocks_per_member, plan.chunk
            );

            let handler = ImsmHandler;
            let mut kernel = LoggingKernelRpc;
            let mut store = FileMapStore { path: config.map_path.clone() };
            let mut drivers = devices
                .iter()
                .map(|d| {
                    let mut driver = FileDiskDriver::new("");
                    driver.ddriver_open(d).with_context(|| format!("opening {}", d))?;
                    Ok(driver)
                })
                .collect::<Result<Vec<_>>>()?;
            let mut members_io: Vec<&mut FileDiskDriver> = drivers.iter_mut().collect();
            let sup = create::publish(&req, &plan, &handler, &mut kernel, &mut store, &mut members_io)
                .context("publishing array")?;
            println!("published container with {} disks, {} volume(s)", sup.disks.len(), sup.volumes.len());
            for driver in drivers.iter_mut() {
                driver.ddriver_close()?;
            }
        }
    }
    Ok(())
}
