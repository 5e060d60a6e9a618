use std::sync::OnceLock;
use windows_sys::Win32::{
    Foundation::{CloseHandle, ERROR_SUCCESS, GetLastError, HANDLE, LUID},
    Security::{
        AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_LOCK_MEMORY_NAME,
        SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    },
    System::{
        Memory::{
            GetLargePageMinimum, MEM_COMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE,
            MEMORY_BASIC_INFORMATION, PAGE_READWRITE, VIRTUAL_ALLOCATION_TYPE, VirtualAlloc,
            VirtualFree, VirtualQuery,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
        Threading::{GetCurrentProcess, OpenProcessToken},
    },
};

use crate::round_up;

fn last_error() -> std::io::Error {
    let error = unsafe { GetLastError() };
    std::io::Error::from_raw_os_error(error as i32)
}

/// Reserves and commits `size` bytes of zero-filled, read-write pages.
///
/// Returns the base address together with the committed capacity, which is
/// `size` rounded up to the regular page size.
///
/// # Safety
///
/// The returned pointer must be released with [`free`].
pub fn allocate(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let capacity = round_up(size.max(1), get_page_size());
    commit(capacity, MEM_COMMIT | MEM_RESERVE)
}

/// Reserves and commits `size` bytes backed by large pages.
///
/// Requires the "Lock pages in memory" user right, see [`try_enable_large_pages`].
///
/// See <https://learn.microsoft.com/en-us/windows/win32/memory/large-page-support>.
pub fn allocate_large_pages(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let capacity = round_up(size.max(1), get_large_page_size());
    commit(capacity, MEM_COMMIT | MEM_RESERVE | MEM_LARGE_PAGES)
}

fn commit(capacity: usize, flags: VIRTUAL_ALLOCATION_TYPE) -> std::io::Result<(*mut u8, usize)> {
    let ptr = unsafe { VirtualAlloc(std::ptr::null(), capacity, flags, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(last_error());
    }
    Ok((ptr as *mut u8, capacity))
}

/// Releases a region returned by [`allocate`].
///
/// # Safety
///
/// - `ptr` must come from [`allocate`].
/// - The region must not be used afterwards.
pub unsafe fn free(ptr: *mut u8, _capacity: usize) -> std::io::Result<()> {
    let result = unsafe { VirtualFree(ptr as _, 0, MEM_RELEASE) };
    if result == 0 {
        return Err(last_error());
    }
    Ok(())
}

/// Releases a region returned by [`allocate_large_pages`].
///
/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn free_large_pages(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    unsafe { free(ptr, capacity) }
}

/// Enables `SeLockMemoryPrivilege` for the current process.
///
/// The privilege persists for the lifetime of the process.
pub fn try_enable_large_pages() -> std::io::Result<()> {
    unsafe {
        let mut token: HANDLE = std::ptr::null_mut();
        if OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        ) == 0
        {
            return Err(last_error());
        }

        let mut luid = LUID {
            LowPart: 0,
            HighPart: 0,
        };
        if LookupPrivilegeValueW(std::ptr::null(), SE_LOCK_MEMORY_NAME, &mut luid) == 0 {
            let err = last_error();
            CloseHandle(token);
            return Err(err);
        }

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES {
                Luid: luid,
                Attributes: SE_PRIVILEGE_ENABLED,
            }],
        };
        let result = AdjustTokenPrivileges(
            token,
            0,
            &privileges,
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        );
        // AdjustTokenPrivileges reports partial success through GetLastError.
        let last = GetLastError();
        CloseHandle(token);

        if result == 0 || last != ERROR_SUCCESS {
            return Err(std::io::Error::from_raw_os_error(last as i32));
        }
        Ok(())
    }
}

fn query(ptr: *mut u8) -> Option<MEMORY_BASIC_INFORMATION> {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            ptr as _,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    (written != 0).then_some(info)
}

/// Returns the committed size of the region starting at `ptr`, as reported by
/// `VirtualQuery`, falling back to `capacity`.
///
/// # Safety
///
/// `ptr` must be the base of a live region.
pub unsafe fn region_size(ptr: *mut u8, capacity: usize) -> usize {
    match query(ptr) {
        Some(info) if info.State == MEM_COMMIT => info.RegionSize,
        _ => capacity,
    }
}

/// Returns `true` if the region at `ptr` is still committed.
pub fn is_mapped(ptr: *mut u8, capacity: usize) -> bool {
    if ptr.is_null() || capacity == 0 {
        return false;
    }
    matches!(query(ptr), Some(info) if info.State == MEM_COMMIT)
}

/// Returns the large page size (`GetLargePageMinimum`), defaulting to 2MB.
pub fn get_large_page_size() -> usize {
    static LARGE_PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *LARGE_PAGE_SIZE.get_or_init(|| match unsafe { GetLargePageMinimum() } {
        0 => 2 * 1024 * 1024,
        size => size,
    })
}

/// Returns the regular page size (`GetSystemInfo`).
pub fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe {
        let mut system_info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut system_info);
        system_info.dwPageSize as usize
    })
}
