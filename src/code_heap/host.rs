//! The host memory manager: reserves, commits and releases the raw pages that
//! code heap regions sub-allocate from.
use crate::utils::{
    align_up,
    sync::{AtomicU64, Mutex, Ordering},
    CodeAddr,
};
use std::collections::HashMap;

/// A contiguous reservation handed out by a [`HostMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub base: CodeAddr,
    pub size: usize,
    pub executable: bool,
}

impl Reservation {
    pub fn end(&self) -> CodeAddr {
        self.base + self.size
    }

    pub fn contains_range(&self, addr: CodeAddr, len: usize) -> bool {
        addr >= self.base && addr.checked_add(len).is_some_and(|end| end <= self.end())
    }
}

pub trait HostMemory: Send + Sync {
    fn page_size(&self) -> usize;

    fn reserve(&self, size: usize, executable: bool) -> Option<Reservation>;

    /// Backs `[addr, addr + size)` of `reservation` with memory.
    fn commit(&self, reservation: &Reservation, addr: CodeAddr, size: usize) -> bool;

    fn release(&self, reservation: Reservation);

    /// # Safety
    ///
    /// `[addr, addr + bytes.len())` must lie inside committed memory of a live
    /// reservation from this host, and nothing may be executing from it.
    unsafe fn write(&self, addr: CodeAddr, bytes: &[u8]);

    /// # Safety
    ///
    /// `[addr, addr + out.len())` must lie inside committed memory of a live
    /// reservation from this host.
    unsafe fn read(&self, addr: CodeAddr, out: &mut [u8]);
}

/// Host memory backed by the operating system's virtual memory.
///
/// `reserve` maps address space with no access, `commit` makes a range
/// readable and writable (and executable for executable reservations), and
/// `release` unmaps the whole reservation. An optional byte limit lets callers
/// model an exhausted host.
#[derive(Debug)]
pub struct SystemHostMemory {
    page_size: usize,
    limit: Option<u64>,
    reserved: AtomicU64,
    /// Reservation base to mapped length.
    live: Mutex<HashMap<usize, usize>>,
}

impl Default for SystemHostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHostMemory {
    pub fn new() -> Self {
        Self {
            page_size: os::page_size(),
            limit: None,
            reserved: AtomicU64::new(0),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_limit(mut self, bytes: usize) -> Self {
        self.limit = Some(bytes as u64);
        self
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn live_reservations(&self) -> usize {
        self.live.lock().len()
    }
}

impl HostMemory for SystemHostMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, size: usize, executable: bool) -> Option<Reservation> {
        if size == 0 {
            return None;
        }
        if let Some(limit) = self.limit {
            if self.reserved.load(Ordering::Relaxed) + size as u64 > limit {
                tracing::debug!("host memory limit reached reserving {} bytes", size);
                return None;
            }
        }
        let mapped = align_up(size, self.page_size)?;
        let base = os::reserve(mapped)?;
        self.reserved.fetch_add(size as u64, Ordering::Relaxed);
        self.live.lock().insert(base, mapped);
        Some(Reservation {
            base: CodeAddr(base),
            size,
            executable,
        })
    }

    fn commit(&self, reservation: &Reservation, addr: CodeAddr, size: usize) -> bool {
        let Some(&mapped) = self.live.lock().get(&reservation.base.as_usize()) else {
            return false;
        };
        if size == 0 || !reservation.contains_range(addr, size) {
            return false;
        }
        // Protection changes work on whole pages.
        let start = addr.as_usize() & !(self.page_size - 1);
        let Some(end) = align_up(addr.as_usize() + size, self.page_size) else {
            return false;
        };
        debug_assert!(end - reservation.base.as_usize() <= mapped);
        if !os::commit(start, end - start, reservation.executable) {
            tracing::warn!(
                "committing {} bytes at {:#x} failed: {}",
                end - start,
                start,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    fn release(&self, reservation: Reservation) {
        let Some(mapped) = self.live.lock().remove(&reservation.base.as_usize()) else {
            tracing::warn!("released unknown reservation at {}", reservation.base);
            return;
        };
        self.reserved
            .fetch_sub(reservation.size as u64, Ordering::Relaxed);
        if !os::release(reservation.base.as_usize(), mapped) {
            tracing::warn!(
                "unmapping reservation at {} failed: {}",
                reservation.base,
                std::io::Error::last_os_error()
            );
        }
    }

    unsafe fn write(&self, addr: CodeAddr, bytes: &[u8]) {
        // SAFETY: upheld by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr.as_usize() as *mut u8, bytes.len())
        };
    }

    unsafe fn read(&self, addr: CodeAddr, out: &mut [u8]) {
        // SAFETY: upheld by the caller.
        unsafe {
            std::ptr::copy_nonoverlapping(addr.as_usize() as *const u8, out.as_mut_ptr(), out.len())
        };
    }
}

#[cfg(unix)]
mod os {
    pub(super) fn page_size() -> usize {
        // SAFETY: sysconf has no memory-safety preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            crate::config::DEFAULT_PAGE_SIZE
        }
    }

    pub(super) fn reserve(len: usize) -> Option<usize> {
        // SAFETY: an anonymous private mapping at a kernel-chosen address
        // touches no existing memory.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        (ptr != libc::MAP_FAILED).then_some(ptr as usize)
    }

    pub(super) fn commit(addr: usize, len: usize, executable: bool) -> bool {
        let mut prot = libc::PROT_READ | libc::PROT_WRITE;
        if executable {
            prot |= libc::PROT_EXEC;
        }
        // SAFETY: `[addr, addr + len)` is page aligned and inside a mapping
        // created by `reserve`.
        unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) == 0 }
    }

    pub(super) fn release(addr: usize, len: usize) -> bool {
        // SAFETY: `addr` and `len` describe exactly one mapping from `reserve`,
        // removed from the live set before this call.
        unsafe { libc::munmap(addr as *mut libc::c_void, len) == 0 }
    }
}

#[cfg(windows)]
mod os {
    use windows_sys::Win32::System::{
        Memory::{
            VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
            PAGE_NOACCESS, PAGE_READWRITE,
        },
        SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    };

    pub(super) fn page_size() -> usize {
        // SAFETY: GetSystemInfo only writes into the provided struct.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        info.dwPageSize as usize
    }

    pub(super) fn reserve(len: usize) -> Option<usize> {
        // SAFETY: reserving at a system-chosen address touches no existing memory.
        let ptr = unsafe { VirtualAlloc(std::ptr::null(), len, MEM_RESERVE, PAGE_NOACCESS) };
        (!ptr.is_null()).then_some(ptr as usize)
    }

    pub(super) fn commit(addr: usize, len: usize, executable: bool) -> bool {
        let protect = if executable {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_READWRITE
        };
        // SAFETY: the range lies inside a reservation made by `reserve`.
        let ptr = unsafe { VirtualAlloc(addr as *const _, len, MEM_COMMIT, protect) };
        !ptr.is_null()
    }

    pub(super) fn release(addr: usize, _len: usize) -> bool {
        // SAFETY: `addr` is the base of a reservation made by `reserve`.
        unsafe { VirtualFree(addr as *mut _, 0, MEM_RELEASE) != 0 }
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    pub(super) fn page_size() -> usize {
        crate::config::DEFAULT_PAGE_SIZE
    }

    pub(super) fn reserve(_len: usize) -> Option<usize> {
        None
    }

    pub(super) fn commit(_addr: usize, _len: usize, _executable: bool) -> bool {
        false
    }

    pub(super) fn release(_addr: usize, _len: usize) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let host = SystemHostMemory::new();
        let r = host.reserve(8192, true).unwrap();
        assert_eq!(r.base.as_usize() % host.page_size(), 0);
        assert!(host.commit(&r, r.base, 4096));
        assert!(!host.commit(&r, r.base + 4096, 8192));
        assert_eq!(host.reserved_bytes(), 8192);

        host.release(r);
        assert_eq!(host.reserved_bytes(), 0);
        assert_eq!(host.live_reservations(), 0);
    }

    #[test]
    fn test_committed_memory_is_writable() {
        let host = SystemHostMemory::new();
        let r = host.reserve(3 * host.page_size(), false).unwrap();
        let second_page = r.base + host.page_size();
        assert!(host.commit(&r, second_page, 100));

        let mut out = [0u8; 4];
        // SAFETY: the second page was just committed.
        unsafe {
            host.write(second_page, &[1, 2, 3, 4]);
            host.read(second_page, &mut out);
        }
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(!host.commit(&r, r.base, 4 * host.page_size()));
        host.release(r);
        assert_eq!(host.live_reservations(), 0);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn test_executable_reservation_runs_code() {
        let host = SystemHostMemory::new();
        let r = host.reserve(host.page_size(), true).unwrap();
        assert!(host.commit(&r, r.base, 16));
        // mov eax, 42; ret
        let body = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        // SAFETY: the page is committed and nothing runs from it yet.
        unsafe { host.write(r.base, &body) };

        // SAFETY: the page is committed read/write/execute and holds a
        // complete function with the C calling convention.
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(r.base.as_usize()) };
        assert_eq!(f(), 42);
        host.release(r);
    }

    #[test]
    fn test_limit_rejects_reservation() {
        let host = SystemHostMemory::new().with_limit(4096);
        let r = host.reserve(4096, false).unwrap();
        assert!(host.reserve(4096, false).is_none());
        host.release(r);
        assert!(host.reserve(4096, false).is_some_and(|r| {
            host.release(r);
            true
        }));
    }
}
