use lock_api::{GuardNoSend, RawMutex};

use crate::backing::{BackingAllocator, Platform};

/// Compile time configuration of [`crate::Guardalloc`]. Every switch is an
/// associated constant so the compiler can erase the branches of features
/// that are turned off, the same way it erases the no-op mutex.
///
/// The safety features compose. `SAFETY` alone catches size and alignment
/// lies at free time, `RETAIN_METADATA` extends double free detection past
/// the death of a bucket, and `NEVER_UNMAP` keeps freed pages mapped so a
/// stale read hits memory that no live allocation owns. The combination of
/// all three is the most paranoid (and most expensive) mode.
pub trait Config {
    /// How many frames to record per allocation and free stack trace. 0
    /// disables trace capture entirely, which also shrinks every bucket
    /// header.
    const STACK_TRACE_FRAMES: usize = 8;

    /// Track the total of user-requested bytes and refuse allocations past
    /// [`crate::Guardalloc::set_requested_memory_limit`].
    const ENABLE_MEMORY_LIMIT: bool = false;

    /// Store the requested length and alignment of every live slot and check
    /// them again on resize and free.
    const SAFETY: bool = true;

    /// Never return pages to the backing allocator on free. Use-after-free
    /// then points at memory no live allocation owns. Implies leaking unless
    /// combined with `RETAIN_METADATA`, which releases the withheld pages at
    /// [`crate::Guardalloc::deinit`].
    const NEVER_UNMAP: bool = false;

    /// Keep the metadata of freed allocations around so a second free of the
    /// same address can still be diagnosed with both stack traces. Adds
    /// [`crate::Guardalloc::flush_retained_metadata`] to drop it on demand.
    const RETAIN_METADATA: bool = false;

    /// Log a `trace!` record for every allocation, resize and free.
    const VERBOSE_LOG: bool = false;

    /// The mutex guarding all allocator state. Pick [`parking_lot::RawMutex`]
    /// (or any other [`lock_api::RawMutex`]) for thread safe use, or
    /// [`SingleThreaded`] to compile the locking away.
    type Mutex: RawMutex;

    /// Where pages come from. [`Platform`] talks to the kernel;
    /// [`crate::SystemBacking`] runs on `std::alloc` for tests and Miri.
    type Backing: BackingAllocator + Default;
}

/// Thread safe configuration with all checks on and the platform page
/// allocator underneath. This is what you want unless you are tuning
/// something specific.
pub struct DefaultConfig;

impl Config for DefaultConfig {
    type Mutex = parking_lot::RawMutex;
    type Backing = Platform;
}

/// No-op stand-in for the allocator mutex. Acquire and release compile to
/// nothing, so a single threaded program pays nothing for the locking
/// discipline.
///
/// The type system cannot see that this makes the allocator unfit for
/// sharing (the wrapping [`lock_api::Mutex`] is still `Sync`), so a config
/// using this mutex must keep the allocator on one thread.
pub struct SingleThreaded;

unsafe impl RawMutex for SingleThreaded {
    const INIT: Self = SingleThreaded;

    type GuardMarker = GuardNoSend;

    #[inline]
    fn lock(&self) {}

    #[inline]
    fn try_lock(&self) -> bool {
        true
    }

    #[inline]
    unsafe fn unlock(&self) {}
}
