use std::sync::OnceLock;

use crate::round_up;

/// Maps `size` bytes of anonymous, zero-filled, read-write memory.
///
/// Returns the base address together with the committed capacity, which is
/// `size` rounded up to the regular page size. A zero `size` maps one page.
///
/// # Safety
///
/// The returned pointer must be released with [`free`] using the returned
/// capacity.
pub fn allocate(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let capacity = round_up(size.max(1), get_page_size());
    map_anonymous(capacity, 0)
}

/// Maps `size` bytes backed by huge pages (`MAP_HUGETLB`).
///
/// Huge pages must be configured by the administrator, e.g. through
/// `/proc/sys/vm/nr_hugepages` or `/proc/sys/vm/nr_overcommit_hugepages`.
/// On non-Linux Unix targets this always fails with `Unsupported`.
///
/// See <https://www.kernel.org/doc/Documentation/vm/hugetlbpage.txt>.
pub fn allocate_large_pages(size: usize) -> std::io::Result<(*mut u8, usize)> {
    let capacity = round_up(size.max(1), get_large_page_size());
    #[cfg(target_os = "linux")]
    {
        map_anonymous(capacity, libc::MAP_HUGETLB)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = capacity;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "large pages are not supported on this platform",
        ))
    }
}

fn map_anonymous(capacity: usize, extra_flags: libc::c_int) -> std::io::Result<(*mut u8, usize)> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if ptr.is_null() || ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }
    Ok((ptr as *mut u8, capacity))
}

/// Unmaps a region returned by [`allocate`].
///
/// # Safety
///
/// - `ptr` must come from [`allocate`] and `capacity` must be the capacity it
///   returned.
/// - The region must not be used afterwards.
pub unsafe fn free(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    let res = unsafe { libc::munmap(ptr as *mut libc::c_void, capacity) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Unmaps a region returned by [`allocate_large_pages`].
///
/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn free_large_pages(ptr: *mut u8, capacity: usize) -> std::io::Result<()> {
    unsafe { free(ptr, capacity) }
}

/// Huge pages are configured administratively on Unix; there is nothing to
/// enable per process.
pub fn try_enable_large_pages() -> std::io::Result<()> {
    Ok(())
}

/// Returns the committed size of the region starting at `ptr`.
///
/// Anonymous mappings are committed whole, so this is the capacity recorded at
/// allocation time.
///
/// # Safety
///
/// `ptr` must be the base of a live mapping of `capacity` bytes.
pub unsafe fn region_size(_ptr: *mut u8, capacity: usize) -> usize {
    capacity
}

/// Returns `true` if `[ptr, ptr + capacity)` is still mapped.
///
/// `msync` reports `ENOMEM` for unmapped ranges, which makes it usable as a
/// cheap liveness probe.
pub fn is_mapped(ptr: *mut u8, capacity: usize) -> bool {
    if ptr.is_null() || capacity == 0 {
        return false;
    }
    unsafe { libc::msync(ptr as *mut libc::c_void, capacity, libc::MS_ASYNC) == 0 }
}

/// Returns the regular page size (`sysconf(_SC_PAGESIZE)`), defaulting to 4KB.
pub fn get_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if res > 0 && (res as usize).is_power_of_two() {
            res as usize
        } else {
            4 * 1024
        }
    })
}

/// Returns the huge page size, defaulting to 2MB when it cannot be determined.
pub fn get_large_page_size() -> usize {
    static SIZE: OnceLock<usize> = OnceLock::new();
    *SIZE.get_or_init(|| read_large_page_size().unwrap_or(2 * 1024 * 1024))
}

/// Parses the `Hugepagesize:    2048 kB` line of `/proc/meminfo`.
fn read_large_page_size() -> std::io::Result<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")?;
    meminfo
        .lines()
        .find(|line| line.starts_with("Hugepagesize:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
        .filter(|size| size.is_power_of_two())
        .ok_or_else(|| std::io::Error::other("failed to read Hugepagesize"))
}
