//! udev-backed enumeration of USB partitions that can act as keyphy
//! authentication devices.

use keyphy_core::error::{KeyphyError, KeyphyResult};
use keyphy_core::provider::{Device, DeviceEnumerator};
use log::{debug, warn};
use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use udev::Enumerator;

pub const MOUNTS_OVERRIDE_ENV: &str = "KEYPHY_MOUNTS_PATH";
const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";
const DEFAULT_SYS_BLOCK: &str = "/sys/class/block";
const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Lists USB partitions carrying a filesystem UUID. Each call re-scans udev
/// and the mount table.
#[derive(Debug, Clone)]
pub struct UdevDeviceEnumerator {
    sys_block: PathBuf,
}

impl Default for UdevDeviceEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl UdevDeviceEnumerator {
    pub fn new() -> Self {
        Self {
            sys_block: PathBuf::from(DEFAULT_SYS_BLOCK),
        }
    }

    pub fn with_sys_block(sys_block: PathBuf) -> Self {
        Self { sys_block }
    }

    fn scan(&self) -> KeyphyResult<Vec<Device>> {
        let mounts = read_mount_table()?;
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem("block")?;
        enumerator.match_property("DEVTYPE", "partition")?;
        enumerator.match_property("ID_BUS", "usb")?;

        let mut devices = Vec::new();
        for device in enumerator.scan_devices()? {
            let Some(uuid) = property(&device, "ID_FS_UUID") else {
                continue;
            };
            let Some(devnode) = device.devnode() else {
                debug!("skipping {} without devnode", device.syspath().display());
                continue;
            };
            let dev_path = devnode.to_string_lossy().into_owned();
            let name = property(&device, "ID_FS_LABEL")
                .or_else(|| property(&device, "ID_MODEL"))
                .unwrap_or(UNKNOWN_DEVICE)
                .to_string();

            let kernel_name = device.sysname().to_string_lossy();
            let mappers = mapper_holders(&self.sys_block, &kernel_name);
            let mount_point = resolve_mount(&mounts, &dev_path, &mappers);

            devices.push(Device {
                uuid: uuid.to_string(),
                name,
                mount_point,
                dev_path,
            });
        }
        Ok(devices)
    }
}

impl DeviceEnumerator for UdevDeviceEnumerator {
    fn list_devices(&self) -> KeyphyResult<Vec<Device>> {
        self.scan()
            .map_err(|err| KeyphyError::Enumeration(err.to_string()))
    }
}

fn property<'a>(device: &'a udev::Device, key: &str) -> Option<&'a str> {
    device
        .property_value(key)
        .and_then(OsStr::to_str)
        .filter(|value| !value.is_empty())
}

/// Device-mapper names stacked on `kernel_name`, e.g. an unlocked LUKS volume.
fn mapper_holders(sys_block: &Path, kernel_name: &str) -> Vec<String> {
    let holders = sys_block.join(kernel_name).join("holders");
    let entries = match fs::read_dir(&holders) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            warn!("failed to read {}: {err}", holders.display());
            return Vec::new();
        }
    };
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|entry| fs::read_to_string(entry.path().join("dm").join("name")).ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort();
    names
}

/// Mount point reported for a partition.
///
/// When an unlocked mapper on top of the partition is mounted, the mapper
/// device path is reported instead so callers can tell the encrypted case
/// apart.
fn resolve_mount(mounts: &str, dev_path: &str, mappers: &[String]) -> Option<String> {
    for mapper in mappers {
        let mapper_path = format!("/dev/mapper/{mapper}");
        if parse_mounts(mounts, &mapper_path).is_some() {
            return Some(mapper_path);
        }
    }
    parse_mounts(mounts, dev_path).map(|path| path.to_string_lossy().into_owned())
}

/// Read `/proc/mounts` or its override for testing purposes.
fn read_mount_table() -> KeyphyResult<String> {
    let path = env::var(MOUNTS_OVERRIDE_ENV).unwrap_or_else(|_| DEFAULT_MOUNTS_PATH.to_string());
    fs::read_to_string(&path)
        .map_err(|err| KeyphyError::Enumeration(format!("read mounts file {path}: {err}")))
}

/// Parse the mount table content and return a matching mountpoint path.
fn parse_mounts(mounts: &str, devnode: &str) -> Option<PathBuf> {
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(device), Some(mountpoint)) = (parts.next(), parts.next()) else {
            continue;
        };
        if device == devnode {
            return Some(PathBuf::from(unescape_mount_field(mountpoint)));
        }
    }
    None
}

/// Convert fstab-style escaped fields back into display strings.
fn unescape_mount_field(input: &str) -> String {
    let mut chars = input.chars().peekable();
    let mut output = String::with_capacity(input.len());

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        let mut oct = String::new();
        while oct.len() < 3 {
            match chars.peek() {
                Some(next) if next.is_digit(8) => {
                    oct.push(*next);
                    chars.next();
                }
                _ => break,
            }
        }
        match u8::from_str_radix(&oct, 8) {
            Ok(value) if oct.len() == 3 => output.push(value as char),
            _ => {
                output.push('\\');
                output.push_str(&oct);
            }
        }
    }

    output
}
