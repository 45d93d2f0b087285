//! Read-only ISO attach via the virtual-disk service. Attached handles are
//! kept in a process-wide table keyed by image path so a later detach can
//! find them again.

use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::Storage::FileSystem::GetLogicalDrives;
use windows::Win32::Storage::Vhd::{
    AttachVirtualDisk, DetachVirtualDisk, OpenVirtualDisk, ATTACH_VIRTUAL_DISK_FLAG_READ_ONLY,
    ATTACH_VIRTUAL_DISK_PARAMETERS, ATTACH_VIRTUAL_DISK_VERSION_1, DETACH_VIRTUAL_DISK_FLAG_NONE,
    OPEN_VIRTUAL_DISK_FLAG_NONE, OPEN_VIRTUAL_DISK_PARAMETERS, OPEN_VIRTUAL_DISK_VERSION_1,
    VIRTUAL_DISK_ACCESS_READ, VIRTUAL_STORAGE_TYPE, VIRTUAL_STORAGE_TYPE_DEVICE_ISO,
    VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
};

static ATTACHED: Mutex<Vec<(PathBuf, isize)>> = Mutex::new(Vec::new());

pub fn attach(image: &Path) -> Result<PathBuf> {
    let before = logical_drive_letters();
    let handle = open_virtual_disk(image)?;
    if let Err(error) = attach_read_only(handle) {
        unsafe {
            CloseHandle(handle);
        }
        return Err(error);
    }
    let letter = match wait_for_new_drive_letter(&before, Duration::from_secs(20)) {
        Ok(letter) => letter,
        Err(error) => {
            unsafe {
                let _ = DetachVirtualDisk(handle, DETACH_VIRTUAL_DISK_FLAG_NONE, 0);
                CloseHandle(handle);
            }
            return Err(error);
        }
    };

    ATTACHED
        .lock()
        .expect("attach table poisoned")
        .push((image.to_path_buf(), handle.0));
    Ok(PathBuf::from(format!("{}:\\", letter)))
}

pub fn detach(image: &Path) -> Result<()> {
    let handle = {
        let mut attached = ATTACHED.lock().expect("attach table poisoned");
        let index = attached
            .iter()
            .position(|(path, _)| path == image)
            .ok_or_else(|| anyhow!("{} is not attached", image.display()))?;
        attached.remove(index).1
    };

    unsafe {
        let handle = HANDLE(handle);
        DetachVirtualDisk(handle, DETACH_VIRTUAL_DISK_FLAG_NONE, 0)
            .ok()
            .map_err(|error| anyhow!("DetachVirtualDisk failed: {:?}", error))?;
        CloseHandle(handle);
    }
    Ok(())
}

fn open_virtual_disk(path: &Path) -> Result<HANDLE> {
    let path_wide = wide(path);
    let storage_type = VIRTUAL_STORAGE_TYPE {
        DeviceId: VIRTUAL_STORAGE_TYPE_DEVICE_ISO,
        VendorId: VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
    };

    let mut handle = HANDLE::default();
    let mut params = OPEN_VIRTUAL_DISK_PARAMETERS::default();
    params.Version = OPEN_VIRTUAL_DISK_VERSION_1;

    unsafe {
        OpenVirtualDisk(
            &storage_type,
            PCWSTR(path_wide.as_ptr()),
            VIRTUAL_DISK_ACCESS_READ,
            OPEN_VIRTUAL_DISK_FLAG_NONE,
            Some(&mut params),
            &mut handle,
        )
        .ok()
        .map_err(|error| anyhow!("OpenVirtualDisk failed: {:?}", error))?;

        if handle == INVALID_HANDLE_VALUE {
            return Err(anyhow!("OpenVirtualDisk returned invalid handle"));
        }
    }

    Ok(handle)
}

fn attach_read_only(handle: HANDLE) -> Result<()> {
    let mut params = ATTACH_VIRTUAL_DISK_PARAMETERS::default();
    params.Version = ATTACH_VIRTUAL_DISK_VERSION_1;

    unsafe {
        AttachVirtualDisk(
            handle,
            None,
            ATTACH_VIRTUAL_DISK_FLAG_READ_ONLY,
            0,
            Some(&mut params),
            None,
        )
        .ok()
        .map_err(|error| anyhow!("AttachVirtualDisk failed: {:?}", error))?;
    }

    Ok(())
}

fn logical_drive_letters() -> Vec<char> {
    unsafe {
        let mask = GetLogicalDrives();
        let mut letters = Vec::new();
        for (idx, letter) in ('A'..='Z').enumerate() {
            if mask & (1u32 << idx) != 0 {
                letters.push(letter);
            }
        }
        letters
    }
}

fn wait_for_new_drive_letter(before: &[char], timeout: Duration) -> Result<char> {
    let before_set: HashSet<char> = before.iter().copied().collect();
    let start = Instant::now();
    loop {
        let now = logical_drive_letters();
        for letter in now {
            if !before_set.contains(&letter) {
                return Ok(letter);
            }
        }
        if start.elapsed() > timeout {
            return Err(anyhow!("timed out waiting for ISO mount"));
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

fn wide(path: &Path) -> Vec<u16> {
    use std::os::windows::prelude::*;
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}
