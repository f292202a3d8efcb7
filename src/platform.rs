//! OS page reservation.
//!
//! The page heap never talks to the OS directly; it goes through a
//! [`PageSource`]. [`OsPages`] is the real implementation: anonymous `mmap`
//! on unix, page-aligned `std::alloc` elsewhere. Fresh pages are always zero.

use core::ptr::NonNull;

use crate::PAGE_SIZE;

/// Source of page-aligned memory.
///
/// # Safety
///
/// `reserve` must return memory that is page aligned, zero filled, readable
/// and writable for `bytes` bytes, and not aliased by anything else until it
/// is passed back to `unreserve`.
pub unsafe trait PageSource: Send + Sync {
    /// Reserve `bytes` (a multiple of [`PAGE_SIZE`]). `None` means the OS said no.
    fn reserve(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Tell the OS the contents of a reserved range are no longer needed.
    /// The range stays reserved. Returns true when the range now reads back
    /// as zero, false when the old contents may still be there.
    ///
    /// # Safety
    ///
    /// The range must lie inside one reservation and hold no live objects.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> bool;

    /// Give a whole reservation back.
    ///
    /// # Safety
    ///
    /// `ptr` and `bytes` must be exactly what `reserve` returned/was given,
    /// and nothing may use the range afterwards.
    unsafe fn unreserve(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Pages straight from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        unsafe impl PageSource for OsPages {
            fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
                debug_assert!(bytes % PAGE_SIZE == 0);
                // SAFETY: anonymous private mapping, no file descriptor involved.
                let p = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        bytes,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if p == libc::MAP_FAILED {
                    return None;
                }
                NonNull::new(p.cast::<u8>())
            }

            unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> bool {
                let rc = unsafe { libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_DONTNEED) };
                if rc != 0 {
                    tracing::debug!(ptr = ?ptr, bytes, "madvise refused to release pages");
                    return false;
                }
                // Only Linux guarantees zero-fill for dropped private anonymous pages.
                cfg!(target_os = "linux")
            }

            unsafe fn unreserve(&self, ptr: NonNull<u8>, bytes: usize) {
                unsafe { libc::munmap(ptr.as_ptr().cast(), bytes) };
            }
        }
    } else {
        use std::alloc::{self, Layout};

        unsafe impl PageSource for OsPages {
            fn reserve(&self, bytes: usize) -> Option<NonNull<u8>> {
                let layout = Layout::from_size_align(bytes, PAGE_SIZE).ok()?;
                // SAFETY: `bytes` is a non-zero multiple of the page size.
                NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
            }

            unsafe fn release(&self, _ptr: NonNull<u8>, _bytes: usize) -> bool {
                // No portable way to drop page contents; the pages stay committed.
                false
            }

            unsafe fn unreserve(&self, ptr: NonNull<u8>, bytes: usize) {
                let layout = Layout::from_size_align(bytes, PAGE_SIZE)
                    .unwrap_or_else(|_| crate::error::throw!("bad reservation size {}", bytes));
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
            }
        }
    }
}
