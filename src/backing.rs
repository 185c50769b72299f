use std::{alloc::Layout, ptr::NonNull};

use crate::Pointer;

/// Abstraction over the page-granularity allocator underneath us. The bucket
/// engine and the large allocation path only need to obtain and release
/// naturally aligned byte ranges, they don't care about the APIs offered by
/// the underlying kernel or libraries.
///
/// All lengths are rounded up to whole pages internally, so a caller that
/// frees with a different length than it allocated with is fine as long as
/// both round to the same number of pages (which is exactly what an accepted
/// [`BackingAllocator::resize`] guarantees).
pub trait BackingAllocator {
    /// Requests a memory region where `layout.size()` bytes can be written
    /// safely, aligned to `layout.align()`. Returns `None` when the system
    /// refuses.
    fn allocate(&self, layout: Layout) -> Pointer<u8>;

    /// Attempts to resize the region at `address` to `new_size` bytes
    /// **without moving it**. Returns `false` and changes nothing when the
    /// region cannot be resized in place.
    ///
    /// # Safety
    ///
    /// `address` and `layout` must describe a live region previously returned
    /// by [`BackingAllocator::allocate`] (possibly already resized).
    unsafe fn resize(&self, address: NonNull<u8>, layout: Layout, new_size: usize) -> bool;

    /// Returns the region at `address` to the system.
    ///
    /// # Safety
    ///
    /// Same contract as [`BackingAllocator::resize`], and the region must not
    /// be used afterwards.
    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout);

    /// Virtual memory page size in bytes. Constant for a process.
    fn page_size(&self) -> usize;
}

/// Rounds `size` up to a multiple of `page_size`. `None` on overflow, which
/// the callers surface as an ordinary allocation failure.
#[inline]
fn round_to_pages(size: usize, page_size: usize) -> Option<usize> {
    Some(size.checked_add(page_size - 1)? & !(page_size - 1))
}

/// Pages straight from the kernel: `mmap` on unix, `VirtualAlloc` on
/// Windows, and `std::alloc` when running under Miri (no FFI there).
#[derive(Default)]
pub struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time, so the first query
/// caches it.
#[cfg(not(miri))]
mod page_size_cache {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    #[inline]
    pub(super) fn get(query: fn() -> usize) -> usize {
        match PAGE_SIZE.load(Ordering::Relaxed) {
            0 => {
                let size = query();
                PAGE_SIZE.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::{alloc::Layout, ptr, ptr::NonNull};

    use super::{page_size_cache, round_to_pages, BackingAllocator, Platform};
    use crate::Pointer;

    /// Calls `mmap` and returns the resulting address or `None` if it fails.
    /// `length` must be a multiple of the page size.
    unsafe fn mmap(length: usize) -> Pointer<u8> {
        // Memory protection. Read-Write only.
        let protection = libc::PROT_READ | libc::PROT_WRITE;

        // Memory should be private to our process and not mapped to any file.
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        // For all the configuration options that `mmap` accepts see
        // https://man7.org/linux/man-pages/man2/mmap.2.html
        match libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) {
            libc::MAP_FAILED => None,
            address => Some(NonNull::new_unchecked(address).cast()),
        }
    }

    unsafe fn munmap(address: usize, length: usize) {
        if libc::munmap(address as *mut libc::c_void, length) != 0 {
            // TODO: What should we do here? Panic? Memory region is still
            // valid here, it wasn't unmapped.
        }
    }

    impl BackingAllocator for Platform {
        fn allocate(&self, layout: Layout) -> Pointer<u8> {
            let page_size = self.page_size();
            let length = round_to_pages(layout.size(), page_size)?;

            // `mmap` only guarantees page alignment. For anything stricter we
            // map `align` extra bytes and unmap the misaligned head and the
            // leftover tail.
            let align = layout.align();
            if align <= page_size {
                return unsafe { mmap(length) };
            }

            let padded = length.checked_add(align)?;

            unsafe {
                let address = mmap(padded)?;
                let base = address.as_ptr() as usize;
                let aligned = (base + align - 1) & !(align - 1);

                let lead = aligned - base;
                if lead > 0 {
                    munmap(base, lead);
                }

                let trail = padded - lead - length;
                if trail > 0 {
                    munmap(aligned + length, trail);
                }

                Some(NonNull::new_unchecked(aligned as *mut u8))
            }
        }

        unsafe fn resize(&self, address: NonNull<u8>, layout: Layout, new_size: usize) -> bool {
            let page_size = self.page_size();

            let (Some(old_length), Some(new_length)) = (
                round_to_pages(layout.size(), page_size),
                round_to_pages(new_size, page_size),
            ) else {
                return false;
            };

            // Growing in place would require the pages after the region to be
            // free, which we cannot know without racing other mappers. Equal
            // page counts already span the new size, and shrinking just gives
            // the tail pages back.
            if new_length == old_length {
                return true;
            }

            if new_length < old_length {
                munmap(address.as_ptr() as usize + new_length, old_length - new_length);
                return true;
            }

            false
        }

        unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
            // The length rounds to the same page count the region was created
            // (or last accepted a resize) with.
            if let Some(length) = round_to_pages(layout.size(), self.page_size()) {
                munmap(address.as_ptr() as usize, length);
            }
        }

        fn page_size(&self) -> usize {
            page_size_cache::get(|| unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize })
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{alloc::Layout, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{page_size_cache, round_to_pages, BackingAllocator, Platform};
    use crate::Pointer;

    unsafe fn virtual_alloc(at: Option<*const core::ffi::c_void>, length: usize) -> Pointer<u8> {
        // Similar to mmap on Linux, Read-Write only. Memory has to be
        // reserved first and then committed in order to become usable; we do
        // both with one single call.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        let address = Memory::VirtualAlloc(at, length, flags, protection);

        NonNull::new(address.cast())
    }

    impl BackingAllocator for Platform {
        fn allocate(&self, layout: Layout) -> Pointer<u8> {
            let page_size = self.page_size();
            let length = round_to_pages(layout.size(), page_size)?;

            let align = layout.align();
            if align <= page_size {
                return unsafe { virtual_alloc(None, length) };
            }

            // `VirtualFree` cannot release subranges, so the unix trick of
            // unmapping the misaligned head doesn't work here. Instead we
            // reserve an oversized range to learn where an aligned block
            // would fit, release it, and grab that exact address. Another
            // thread can steal the address between the two calls, hence the
            // retries.
            let padded = length.checked_add(align)?;
            for _ in 0..4 {
                unsafe {
                    let probe = virtual_alloc(None, padded)?;
                    let aligned = (probe.as_ptr() as usize + align - 1) & !(align - 1);
                    self.deallocate(probe, Layout::from_size_align(padded, 1).ok()?);

                    if let Some(address) =
                        virtual_alloc(Some(aligned as *const core::ffi::c_void), length)
                    {
                        return Some(address);
                    }
                }
            }

            None
        }

        unsafe fn resize(&self, _address: NonNull<u8>, layout: Layout, new_size: usize) -> bool {
            let page_size = self.page_size();

            // Only resizes that keep the reservation identical can be done in
            // place; `VirtualFree` has no way to return just the tail.
            match (
                round_to_pages(layout.size(), page_size),
                round_to_pages(new_size, page_size),
            ) {
                (Some(old_length), Some(new_length)) => new_length == old_length,
                _ => false,
            }
        }

        unsafe fn deallocate(&self, address: NonNull<u8>, _layout: Layout) {
            // We can skip decommitting by specifying length of 0 and
            // MEM_RELEASE flag. See the docs for details:
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            if !Memory::VirtualFree(address, length, flags).as_bool() {
                // TODO: Release failed, don't know what to do here yet. Same
                // problem as munmap on Linux.
            }
        }

        fn page_size(&self) -> usize {
            page_size_cache::get(|| unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            })
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so the global allocator mocks the kernel.

    use std::{alloc::Layout, ptr::NonNull};

    use super::{BackingAllocator, Platform, SystemBacking};
    use crate::Pointer;

    impl BackingAllocator for Platform {
        fn allocate(&self, layout: Layout) -> Pointer<u8> {
            SystemBacking::default().allocate(layout)
        }

        unsafe fn resize(&self, address: NonNull<u8>, layout: Layout, new_size: usize) -> bool {
            SystemBacking::default().resize(address, layout, new_size)
        }

        unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
            SystemBacking::default().deallocate(address, layout)
        }

        fn page_size(&self) -> usize {
            SystemBacking::default().page_size()
        }
    }
}

/// Backing allocator on top of `std::alloc`, pretending its allocations are
/// pages. Useful for tests (they run anywhere, including under Miri, and the
/// global allocator reports our mistakes) and as a fallback on systems where
/// we don't talk to the kernel directly.
pub struct SystemBacking {
    page_size: usize,
}

impl SystemBacking {
    /// Pretend page size used by [`Default`].
    pub const DEFAULT_PAGE_SIZE: usize = 4096;

    pub fn with_page_size(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two());
        Self { page_size }
    }

    /// The layout we actually hand to `std::alloc`: length in whole pages,
    /// alignment at least one page. Both `allocate` and `deallocate` derive
    /// it the same way, so a free with a length that rounds like the original
    /// request reconstructs the original layout.
    fn page_layout(&self, layout: Layout) -> Option<Layout> {
        let size = round_to_pages(layout.size(), self.page_size)?;
        let align = layout.align().max(self.page_size);

        Layout::from_size_align(size, align).ok()
    }
}

impl Default for SystemBacking {
    fn default() -> Self {
        Self::with_page_size(Self::DEFAULT_PAGE_SIZE)
    }
}

impl BackingAllocator for SystemBacking {
    fn allocate(&self, layout: Layout) -> Pointer<u8> {
        let layout = self.page_layout(layout)?;

        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn resize(&self, _address: NonNull<u8>, layout: Layout, new_size: usize) -> bool {
        // `std::alloc` has no in-place resize and no partial free, so only
        // size changes within the same page count can be accepted.
        match (
            round_to_pages(layout.size(), self.page_size),
            round_to_pages(new_size, self.page_size),
        ) {
            (Some(old_length), Some(new_length)) => new_length == old_length,
            _ => false,
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
        // Unwrap: `allocate` succeeded with this layout, so it is valid.
        let layout = self.page_layout(layout).unwrap();

        std::alloc::dealloc(address.as_ptr(), layout);
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
