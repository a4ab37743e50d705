//! Reserve/commit virtual memory for the code heap.
//!
//! A [`VirtualRegion`] reserves a contiguous address range up front and
//! commits pages on demand as the heap's high-water mark advances. The range
//! never moves, so addresses handed out by the heap stay stable for the
//! region's whole lifetime. Committed memory starts read-write; ranges are
//! flipped to read-execute once the code in them is installed.

use std::fmt;
use std::ptr::NonNull;

// =============================================================================
// Platform-specific imports
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };

    pub const PAGE_SIZE: usize = 4096;

    /// Reserve an address range without committing any pages.
    pub unsafe fn reserve(size: usize) -> *mut u8 {
        unsafe { VirtualAlloc(ptr::null(), size, MEM_RESERVE, PAGE_READWRITE) as *mut u8 }
    }

    /// Commit pages within a reserved range with read-write permissions.
    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        !unsafe { VirtualAlloc(ptr as *mut _, size, MEM_COMMIT, PAGE_READWRITE) }.is_null()
    }

    /// Release the whole reservation.
    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Make committed pages executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old_protect) != 0 }
    }

    /// Make committed pages writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, PAGE_READWRITE, &mut old_protect) != 0 }
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Reserve an address range without committing any pages.
    pub unsafe fn reserve(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Commit pages within a reserved range with read-write permissions.
    pub unsafe fn commit_rw(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }

    /// Release the whole reservation.
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make committed pages executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0 }
    }

    /// Make committed pages writable (remove execute permission).
    pub unsafe fn make_writable(ptr: *mut u8, size: usize) -> bool {
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) == 0 }
    }
}

pub use platform::PAGE_SIZE;

/// Align a size up to the nearest page boundary.
#[inline]
pub const fn align_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from virtual memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    /// The operating system refused the address-range reservation.
    ReserveFailed {
        /// Bytes requested.
        bytes: usize,
    },
    /// Committing pages within the reservation failed.
    CommitFailed {
        /// Bytes requested.
        bytes: usize,
    },
    /// Changing page permissions failed.
    ProtectFailed,
    /// A commit or protection request fell outside the reservation.
    OutOfReservation {
        /// Bytes requested.
        requested: usize,
        /// Bytes reserved.
        reserved: usize,
    },
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::ReserveFailed { bytes } => {
                write!(f, "Failed to reserve {} bytes of address space", bytes)
            }
            RegionError::CommitFailed { bytes } => {
                write!(f, "Failed to commit {} bytes", bytes)
            }
            RegionError::ProtectFailed => write!(f, "Failed to change page permissions"),
            RegionError::OutOfReservation {
                requested,
                reserved,
            } => write!(
                f,
                "Request for {} bytes exceeds the {} byte reservation",
                requested, reserved
            ),
        }
    }
}

impl std::error::Error for RegionError {}

// =============================================================================
// Virtual Region
// =============================================================================

/// A reserved virtual address range with an advancing committed frontier.
pub struct VirtualRegion {
    /// Base of the reservation. Page-aligned, never moves.
    base: NonNull<u8>,
    /// Total reserved bytes (page-aligned).
    reserved: usize,
    /// Committed bytes from the base (page-aligned).
    committed: usize,
}

impl VirtualRegion {
    /// Reserve `reserved` bytes of address space, committing none of it.
    ///
    /// The size is rounded up to the page boundary.
    pub fn reserve(reserved: usize) -> Result<Self, RegionError> {
        let reserved = align_to_page(reserved.max(PAGE_SIZE));
        let raw = unsafe { platform::reserve(reserved) };
        let base = NonNull::new(raw).ok_or(RegionError::ReserveFailed { bytes: reserved })?;
        Ok(VirtualRegion {
            base,
            reserved,
            committed: 0,
        })
    }

    /// Base address of the reservation.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Total reserved bytes.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Committed bytes from the base.
    #[inline]
    pub fn committed(&self) -> usize {
        self.committed
    }

    /// Whether `addr` falls inside the reservation.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.reserved
    }

    /// Extend the committed frontier to cover at least `bytes` from the base.
    ///
    /// Newly committed pages are read-write and zeroed. Already-committed
    /// prefixes are left untouched.
    pub fn commit_to(&mut self, bytes: usize) -> Result<(), RegionError> {
        let target = align_to_page(bytes);
        if target <= self.committed {
            return Ok(());
        }
        if target > self.reserved {
            return Err(RegionError::OutOfReservation {
                requested: target,
                reserved: self.reserved,
            });
        }
        let grow = target - self.committed;
        let at = unsafe { self.base.as_ptr().add(self.committed) };
        if !unsafe { platform::commit_rw(at, grow) } {
            return Err(RegionError::CommitFailed { bytes: grow });
        }
        self.committed = target;
        Ok(())
    }

    /// Flip a committed page range to read-execute.
    pub fn mark_executable(&mut self, offset: usize, len: usize) -> Result<(), RegionError> {
        let (at, span) = self.page_range(offset, len)?;
        if unsafe { platform::make_executable(at, span) } {
            Ok(())
        } else {
            Err(RegionError::ProtectFailed)
        }
    }

    /// Flip a committed page range back to read-write.
    pub fn mark_writable(&mut self, offset: usize, len: usize) -> Result<(), RegionError> {
        let (at, span) = self.page_range(offset, len)?;
        if unsafe { platform::make_writable(at, span) } {
            Ok(())
        } else {
            Err(RegionError::ProtectFailed)
        }
    }

    /// Widen `[offset, offset + len)` to page granularity within the
    /// committed frontier.
    fn page_range(&self, offset: usize, len: usize) -> Result<(*mut u8, usize), RegionError> {
        let start = offset & !(PAGE_SIZE - 1);
        let end = align_to_page(offset + len);
        if end > self.committed {
            return Err(RegionError::OutOfReservation {
                requested: end,
                reserved: self.committed,
            });
        }
        Ok((unsafe { self.base.as_ptr().add(start) }, end - start))
    }
}

impl Drop for VirtualRegion {
    fn drop(&mut self) {
        unsafe {
            platform::release(self.base.as_ptr(), self.reserved);
        }
    }
}

impl fmt::Debug for VirtualRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("base", &self.base)
            .field("reserved", &self.reserved)
            .field("committed", &self.committed)
            .finish()
    }
}

// SAFETY: the region exclusively owns its reservation; synchronization is
// managed by the owner.
unsafe impl Send for VirtualRegion {}
