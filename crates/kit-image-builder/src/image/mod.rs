//! SD-card image plumbing: partition tables, loop devices, mounts and the chroot sandbox.
//!
//! Everything here shells out to `parted`, `losetup` and `mount`; the types only make
//! sure whatever was set up is torn down again in reverse order, even on error paths.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

pub mod chroot;

use chroot::host_command;

pub const SECTOR_BYTES: u64 = 512;

const HOST_BINDS: [(&str, &str); 4] = [
    ("/dev", "/dev"),
    ("/sys", "/sys"),
    ("/proc", "/proc"),
    ("/dev/pts", "/dev/pts"),
];

const QEMU_BINARY: &str = "qemu-arm-static";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub number: u32,
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub part_type: String,
    pub fs: String,
}

impl PartitionInfo {
    pub fn offset_bytes(&self) -> u64 {
        self.start * SECTOR_BYTES
    }
}

/// Parse `parted -s <dev> unit s print`. Rows that aren't partition entries are skipped.
pub fn parse_partition_table(output: &str) -> BTreeMap<u32, PartitionInfo> {
    static ROW: OnceLock<Regex> = OnceLock::new();
    let row = ROW.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s+(\d+)s\s+(\d+)s\s+(\d+)s\s+(\S+)\s+(\S+)")
            .expect("partition row regex")
    });

    let mut out = BTreeMap::new();
    for line in output.lines() {
        let Some(c) = row.captures(line) else {
            continue;
        };
        let (Ok(number), Ok(start), Ok(end), Ok(size)) = (
            c[1].parse::<u32>(),
            c[2].parse::<u64>(),
            c[3].parse::<u64>(),
            c[4].parse::<u64>(),
        ) else {
            continue;
        };
        out.insert(
            number,
            PartitionInfo {
                number,
                start,
                end,
                size,
                part_type: c[5].to_string(),
                fs: c[6].to_string(),
            },
        );
    }
    out
}

pub fn read_partition_table(
    ctx: &ExecCtx,
    image: &Path,
    sudo: bool,
) -> Result<BTreeMap<u32, PartitionInfo>> {
    let image_s = image.to_string_lossy();
    let out = ctx.capture_ok(host_command(
        &["parted", "-s", &image_s, "unit", "s", "print"],
        sudo,
    )?)?;
    let table = parse_partition_table(&out);
    if table.is_empty() {
        return Err(Error::msg(format!(
            "no partitions found in {}",
            image.display()
        )));
    }
    Ok(table)
}

fn partition(table: &BTreeMap<u32, PartitionInfo>, number: u32, image: &Path) -> Result<PartitionInfo> {
    table.get(&number).cloned().ok_or_else(|| {
        Error::msg(format!(
            "partition {number} not found in {} (have: {})",
            image.display(),
            table.keys().map(u32::to_string).collect::<Vec<_>>().join(", ")
        ))
    })
}

/// Mounting and chrooting write into root-owned filesystems.
pub fn require_root(what: &str) -> Result<()> {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            return Err(Error::msg(format!("{what} must be run as root")));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub boot_partition: u32,
    pub root_partition: u32,
    /// Extra `(host path, absolute image path)` bind mounts.
    pub binds: Vec<(PathBuf, String)>,
    pub emulator: bool,
    pub sudo: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            boot_partition: 1,
            root_partition: 2,
            binds: Vec::new(),
            emulator: true,
            sudo: false,
        }
    }
}

enum Guard {
    TempDir(tempfile::TempDir),
    Loop(String),
    Mount(PathBuf),
    CreatedDir(PathBuf),
    Emulator {
        qemu: PathBuf,
        preload: Option<(PathBuf, PathBuf)>,
    },
}

/// A partition (or a whole root filesystem with boot and host binds) mounted from an
/// image file. Dropping it unmounts everything; `close` does the same but reports errors.
pub struct MountedImage {
    ctx: ExecCtx,
    sudo: bool,
    root: PathBuf,
    guards: Vec<Guard>,
}

impl MountedImage {
    fn empty(ctx: &ExecCtx, sudo: bool) -> Self {
        Self {
            ctx: ctx.clone(),
            sudo,
            root: PathBuf::new(),
            guards: Vec::new(),
        }
    }

    /// Root partition at a temp dir, boot partition at `<root>/boot`, host binds and,
    /// optionally, the ARM emulator: the layout a chroot into the image needs.
    pub fn open(ctx: &ExecCtx, image: &Path, opts: &MountOptions) -> Result<Self> {
        let table = read_partition_table(ctx, image, opts.sudo)?;
        let root_part = partition(&table, opts.root_partition, image)?;
        let boot_part = partition(&table, opts.boot_partition, image)?;

        let mut m = Self::empty(ctx, opts.sudo);
        let root = m.temp_mountpoint()?;
        m.root = root.clone();
        m.mount_partition(image, root_part.offset_bytes(), &root)?;
        let boot_dir = root.join("boot");
        m.ensure_mountpoint(&boot_dir)?;
        m.mount_partition(image, boot_part.offset_bytes(), &boot_dir)?;

        let extra = opts
            .binds
            .iter()
            .map(|(h, i)| (h.clone(), i.clone()));
        let binds: Vec<(PathBuf, String)> = HOST_BINDS
            .iter()
            .map(|(h, i)| (PathBuf::from(h), i.to_string()))
            .chain(extra)
            .collect();
        for (host, in_image) in binds {
            m.bind(&host, &in_image)?;
        }
        if opts.emulator {
            m.setup_emulator()?;
        }
        ctx.log(&format!("mounted {} at {}", image.display(), m.root.display()));
        Ok(m)
    }

    /// Only the given partition, at a temp dir. Used for boot-partition edits.
    pub fn open_partition(ctx: &ExecCtx, image: &Path, number: u32, sudo: bool) -> Result<Self> {
        let table = read_partition_table(ctx, image, sudo)?;
        let part = partition(&table, number, image)?;
        let mut m = Self::empty(ctx, sudo);
        let root = m.temp_mountpoint()?;
        m.root = root.clone();
        m.mount_partition(image, part.offset_bytes(), &root)?;
        Ok(m)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn close(mut self) -> Result<()> {
        self.release_all()
    }

    fn temp_mountpoint(&mut self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("kit-image-")
            .tempdir()
            .map_err(|e| Error::msg(format!("failed to create mountpoint: {e}")))?;
        let path = dir.path().to_path_buf();
        self.guards.push(Guard::TempDir(dir));
        Ok(path)
    }

    fn mount_partition(&mut self, image: &Path, offset: u64, at: &Path) -> Result<()> {
        let image_s = image.to_string_lossy();
        let offset_s = offset.to_string();
        let dev = self
            .ctx
            .capture_ok(host_command(
                &["losetup", "-f", "--show", "-o", &offset_s, &image_s],
                self.sudo,
            )?)?
            .trim()
            .to_string();
        if dev.is_empty() {
            return Err(Error::msg("losetup did not report a loop device"));
        }
        self.guards.push(Guard::Loop(dev.clone()));

        let at_s = at.to_string_lossy();
        self.ctx
            .run_cmd(host_command(&["mount", &dev, &at_s], self.sudo)?)?;
        self.guards.push(Guard::Mount(at.to_path_buf()));
        Ok(())
    }

    fn ensure_mountpoint(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        // Remember the topmost directory we create so release removes exactly that.
        let mut top = path.to_path_buf();
        while let Some(parent) = top.parent() {
            if parent.exists() {
                break;
            }
            top = parent.to_path_buf();
        }
        fs::create_dir_all(path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", path.display())))?;
        self.guards.push(Guard::CreatedDir(top));
        Ok(())
    }

    fn bind(&mut self, host: &Path, in_image: &str) -> Result<()> {
        if !host.exists() {
            return Err(Error::msg(format!(
                "bind mount source {} does not exist",
                host.display()
            )));
        }
        let rel = in_image.strip_prefix('/').ok_or_else(|| {
            Error::msg(format!("bind mount target '{in_image}' must be absolute"))
        })?;
        crate::modules::util::validate_rel_like_path(rel)?;
        let target = self.root.join(rel);
        self.ensure_mountpoint(&target)?;

        let (host_s, target_s) = (host.to_string_lossy(), target.to_string_lossy());
        self.ctx.log(&format!("bind mount: {host_s} => {target_s}"));
        self.ctx.run_cmd(host_command(
            &["mount", "--bind", &host_s, &target_s],
            self.sudo,
        )?)?;
        self.guards.push(Guard::Mount(target));
        Ok(())
    }

    fn setup_emulator(&mut self) -> Result<()> {
        let src = find_in_path(QEMU_BINARY).ok_or_else(|| {
            Error::msg(format!(
                "{QEMU_BINARY} not found on PATH (install qemu-user-static and binfmt-support)"
            ))
        })?;

        // The Pi preloads an optimised memcpy that breaks networking under QEMU.
        let preload = self.root.join("etc/ld.so.preload");
        let preload = if preload.exists() {
            let backup = preload.with_extension("preload.bak");
            fs::rename(&preload, &backup).map_err(|e| {
                Error::msg(format!("failed to move {} aside: {e}", preload.display()))
            })?;
            Some((preload, backup))
        } else {
            None
        };

        let qemu = self.root.join("usr/bin").join(QEMU_BINARY);
        // Push before copying so a failed copy still restores ld.so.preload.
        self.guards.push(Guard::Emulator {
            qemu: qemu.clone(),
            preload,
        });
        fs::copy(&src, &qemu).map_err(|e| {
            Error::msg(format!(
                "failed to copy {} -> {}: {e}",
                src.display(),
                qemu.display()
            ))
        })?;
        Ok(())
    }

    fn release(&self, guard: Guard) -> Result<()> {
        match guard {
            Guard::TempDir(dir) => dir
                .close()
                .map_err(|e| Error::msg(format!("failed to remove mountpoint: {e}"))),
            Guard::Loop(dev) => self
                .ctx
                .run_cmd(host_command(&["losetup", "-d", &dev], self.sudo)?),
            Guard::Mount(point) => {
                let point_s = point.to_string_lossy();
                self.ctx
                    .run_cmd(host_command(&["umount", &point_s], self.sudo)?)
            }
            Guard::CreatedDir(dir) => fs::remove_dir_all(&dir)
                .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dir.display()))),
            Guard::Emulator { qemu, preload } => {
                let mut res = Ok(());
                if qemu.exists()
                    && let Err(e) = fs::remove_file(&qemu)
                {
                    res = Err(Error::msg(format!("failed to remove {}: {e}", qemu.display())));
                }
                if let Some((orig, backup)) = preload {
                    fs::rename(&backup, &orig).map_err(|e| {
                        Error::msg(format!("failed to restore {}: {e}", orig.display()))
                    })?;
                }
                res
            }
        }
    }

    fn release_all(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(guard) = self.guards.pop() {
            if let Err(e) = self.release(guard) {
                tracing::error!("image teardown: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for MountedImage {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}

/// The root filesystem a provisioning step works on.
pub enum ImageRoot {
    Mounted(MountedImage),
    /// An already unpacked or mounted root; nothing to tear down.
    Dir(PathBuf),
}

impl ImageRoot {
    pub fn path(&self) -> &Path {
        match self {
            ImageRoot::Mounted(m) => m.root(),
            ImageRoot::Dir(p) => p,
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            ImageRoot::Mounted(m) => m.close(),
            ImageRoot::Dir(_) => Ok(()),
        }
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|p| p.is_file())
}
