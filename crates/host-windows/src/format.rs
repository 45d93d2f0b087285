use anyhow::{anyhow, Result};
use bootsmith_core::{FileSystem, PartitionScheme};
use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicI8, Ordering};
use std::time::{Duration, Instant};

use windows::core::{GUID, PCSTR, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, BOOL, BOOLEAN, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, GetLogicalDrives, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ, FILE_GENERIC_WRITE,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::Storage::Ioctl::{
    CREATE_DISK, CREATE_DISK_GPT, CREATE_DISK_MBR, DRIVE_LAYOUT_INFORMATION_EX,
    DRIVE_LAYOUT_INFORMATION_GPT, DRIVE_LAYOUT_INFORMATION_MBR, IOCTL_DISK_CREATE_DISK,
    IOCTL_DISK_SET_DRIVE_LAYOUT_EX, IOCTL_DISK_UPDATE_PROPERTIES, PARTITION_INFORMATION_EX,
    PARTITION_INFORMATION_GPT, PARTITION_INFORMATION_MBR, PARTITION_STYLE_GPT,
    PARTITION_STYLE_MBR,
};
use windows::Win32::System::Ioctl::DeviceIoControl;
use windows::Win32::System::LibraryLoader::{FreeLibrary, GetProcAddress, LoadLibraryW};
use uuid::Uuid;

use crate::win;

const FMIFS_DONE: u32 = 0;
const FMIFS_HARDDISK: u32 = 0x0C;
// FAT32 with LBA addressing.
const MBR_PARTITION_TYPE_FAT32_LBA: u8 = 0x0C;
const ALIGNMENT: u64 = 1024 * 1024;

static FORMAT_RESULT: AtomicI8 = AtomicI8::new(-1);

type FormatExFn = unsafe extern "system" fn(
    PCWSTR,
    u32,
    PCWSTR,
    PCWSTR,
    BOOL,
    u32,
    Option<unsafe extern "system" fn(u32, u32, *mut c_void) -> u32>,
);

pub fn logical_drive_letters() -> Vec<char> {
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

/// Replaces the partition table and lays down a single full-size partition.
pub fn wipe_and_partition(disk_number: u32, scheme: PartitionScheme) -> Result<()> {
    let disk_size = win::disk_size_bytes(disk_number)?;
    let handle = open_physical_drive_rw(disk_number)?;

    let result = match scheme {
        PartitionScheme::Gpt => lay_out_gpt(handle, disk_size),
        PartitionScheme::Mbr => lay_out_mbr(handle, disk_size),
    };

    unsafe {
        CloseHandle(handle);
    }
    result
}

pub fn wait_for_new_drive_letter(before: &[char], timeout: Duration) -> Result<char> {
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
            return Err(anyhow!("timed out waiting for new volume mount"));
        }
        std::thread::sleep(Duration::from_millis(300));
    }
}

fn usable_length(disk_size: u64) -> Result<u64> {
    let usable = disk_size.saturating_sub(ALIGNMENT * 2);
    if usable == 0 {
        return Err(anyhow!("disk too small for partitioning"));
    }
    Ok(usable)
}

fn lay_out_gpt(handle: HANDLE, disk_size: u64) -> Result<()> {
    let disk_id = GUID::from_u128(Uuid::new_v4().as_u128());
    let usable = usable_length(disk_size)?;

    let mut create: CREATE_DISK = unsafe { std::mem::zeroed() };
    create.PartitionStyle = PARTITION_STYLE_GPT;
    unsafe {
        create.Anonymous.Gpt = CREATE_DISK_GPT {
            DiskId: disk_id,
            MaxPartitionCount: 128,
        };
    }
    create_disk(handle, &create)?;

    let mut layout: DRIVE_LAYOUT_INFORMATION_EX = unsafe { std::mem::zeroed() };
    layout.PartitionStyle = PARTITION_STYLE_GPT;
    layout.PartitionCount = 1;
    unsafe {
        layout.Anonymous.Gpt = DRIVE_LAYOUT_INFORMATION_GPT {
            DiskId: disk_id,
            StartingUsableOffset: ALIGNMENT as i64,
            UsableLength: usable as i64,
            MaxPartitionCount: 128,
        };
    }

    let mut entry: PARTITION_INFORMATION_EX = unsafe { std::mem::zeroed() };
    entry.PartitionStyle = PARTITION_STYLE_GPT;
    entry.StartingOffset = ALIGNMENT as i64;
    entry.PartitionLength = usable as i64;
    entry.PartitionNumber = 1;
    entry.RewritePartition = BOOL(1);
    unsafe {
        entry.Anonymous.Gpt = PARTITION_INFORMATION_GPT {
            // Microsoft basic data.
            PartitionType: GUID::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7),
            PartitionId: GUID::from_u128(Uuid::new_v4().as_u128()),
            Attributes: 0,
            Name: [0u16; 36],
        };
        layout.PartitionEntry[0] = entry;
    }

    set_drive_layout(handle, &layout)
}

fn lay_out_mbr(handle: HANDLE, disk_size: u64) -> Result<()> {
    let signature = Uuid::new_v4().as_u128() as u32;
    let usable = usable_length(disk_size)?;

    let mut create: CREATE_DISK = unsafe { std::mem::zeroed() };
    create.PartitionStyle = PARTITION_STYLE_MBR;
    unsafe {
        create.Anonymous.Mbr = CREATE_DISK_MBR {
            Signature: signature,
        };
    }
    create_disk(handle, &create)?;

    let mut layout: DRIVE_LAYOUT_INFORMATION_EX = unsafe { std::mem::zeroed() };
    layout.PartitionStyle = PARTITION_STYLE_MBR;
    layout.PartitionCount = 1;
    unsafe {
        layout.Anonymous.Mbr = DRIVE_LAYOUT_INFORMATION_MBR {
            Signature: signature,
            CheckSum: 0,
        };
    }

    let mut entry: PARTITION_INFORMATION_EX = unsafe { std::mem::zeroed() };
    entry.PartitionStyle = PARTITION_STYLE_MBR;
    entry.StartingOffset = ALIGNMENT as i64;
    entry.PartitionLength = usable as i64;
    entry.PartitionNumber = 1;
    entry.RewritePartition = BOOL(1);
    unsafe {
        entry.Anonymous.Mbr = PARTITION_INFORMATION_MBR {
            PartitionType: MBR_PARTITION_TYPE_FAT32_LBA,
            // Active, so BIOS firmware will hand off to this partition.
            BootIndicator: BOOLEAN(1),
            RecognizedPartition: BOOLEAN(1),
            HiddenSectors: (ALIGNMENT / 512) as u32,
            PartitionId: GUID::from_u128(Uuid::new_v4().as_u128()),
        };
        layout.PartitionEntry[0] = entry;
    }

    set_drive_layout(handle, &layout)
}

fn create_disk(handle: HANDLE, create: &CREATE_DISK) -> Result<()> {
    unsafe {
        let ok = DeviceIoControl(
            handle,
            IOCTL_DISK_CREATE_DISK,
            Some(create as *const _ as *const c_void),
            std::mem::size_of::<CREATE_DISK>() as u32,
            None,
            0,
            None,
            None,
        );
        if !ok.as_bool() {
            return Err(anyhow!("IOCTL_DISK_CREATE_DISK failed"));
        }
    }
    Ok(())
}

fn set_drive_layout(handle: HANDLE, layout: &DRIVE_LAYOUT_INFORMATION_EX) -> Result<()> {
    unsafe {
        let ok = DeviceIoControl(
            handle,
            IOCTL_DISK_SET_DRIVE_LAYOUT_EX,
            Some(layout as *const _ as *const c_void),
            std::mem::size_of::<DRIVE_LAYOUT_INFORMATION_EX>() as u32,
            None,
            0,
            None,
            None,
        );
        if !ok.as_bool() {
            return Err(anyhow!("IOCTL_DISK_SET_DRIVE_LAYOUT_EX failed"));
        }

        let ok = DeviceIoControl(
            handle,
            IOCTL_DISK_UPDATE_PROPERTIES,
            None,
            0,
            None,
            0,
            None,
            None,
        );
        if !ok.as_bool() {
            return Err(anyhow!("IOCTL_DISK_UPDATE_PROPERTIES failed"));
        }
    }
    Ok(())
}

pub fn format_volume(drive_letter: char, fs: FileSystem, label: &str) -> Result<()> {
    FORMAT_RESULT.store(-1, Ordering::SeqCst);

    let module = unsafe { LoadLibraryW(PCWSTR(wide("fmifs.dll").as_ptr())) };
    if module.0 == 0 {
        return Err(anyhow!("failed to load fmifs.dll"));
    }

    let proc = unsafe { GetProcAddress(module, PCSTR(b"FormatEx\0".as_ptr())) };
    if proc.is_none() {
        unsafe { FreeLibrary(module) };
        return Err(anyhow!("FormatEx not found in fmifs.dll"));
    }

    let format_ex: FormatExFn = unsafe { std::mem::transmute(proc) };
    let drive_root = format!("{}:\\", drive_letter);
    let fs_name = fs.as_str().to_string();

    unsafe {
        format_ex(
            PCWSTR(wide(&drive_root).as_ptr()),
            FMIFS_HARDDISK,
            PCWSTR(wide(&fs_name).as_ptr()),
            PCWSTR(wide(label).as_ptr()),
            BOOL(1),
            0,
            Some(format_callback),
        );
        FreeLibrary(module);
    }

    match FORMAT_RESULT.load(Ordering::SeqCst) {
        1 => Ok(()),
        0 => Err(anyhow!("format failed")),
        _ => Err(anyhow!("format did not report completion")),
    }
}

fn open_physical_drive_rw(n: u32) -> Result<HANDLE> {
    let path = format!(r"\\.\PhysicalDrive{}", n);
    let w = wide(&path);

    unsafe {
        let handle = CreateFileW(
            PCWSTR(w.as_ptr()),
            FILE_GENERIC_READ | FILE_GENERIC_WRITE,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            None,
        );

        if handle == INVALID_HANDLE_VALUE {
            return Err(anyhow!("CreateFileW failed for {}", path));
        }

        Ok(handle)
    }
}

unsafe extern "system" fn format_callback(
    command: u32,
    _subcommand: u32,
    data: *mut c_void,
) -> u32 {
    if command == FMIFS_DONE {
        if data.is_null() {
            FORMAT_RESULT.store(0, Ordering::SeqCst);
        } else {
            let success = *(data as *const i32) != 0;
            FORMAT_RESULT.store(if success { 1 } else { 0 }, Ordering::SeqCst);
        }
    }
    1
}

fn wide(s: &str) -> Vec<u16> {
    use std::os::windows::prelude::*;
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}
