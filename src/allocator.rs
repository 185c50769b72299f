use std::{
    alloc::{AllocError, Allocator, Layout},
    collections::BTreeMap,
    ptr::{self, NonNull},
};

use lock_api::Mutex;
use log::{error, trace};

use crate::{
    backing::BackingAllocator,
    bucket::{Bucket, TraceKind},
    config::Config,
    large::{LargeAllocation, LargeTable},
    size_class, trace, AllocResult,
};

/// Byte written over freed memory and abandoned resize tails, so code that
/// keeps reading a stale pointer sees garbage instead of its old data.
const UNDEFINED_FILL: u8 = 0xAA;

/// What [`Guardalloc::deinit`] found when it walked the remaining state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// Every allocation was freed.
    Ok,
    /// At least one allocation is still live; each one was logged with its
    /// allocation stack trace.
    Leak,
}

/// One size class worth of bucket state.
struct SizeClass {
    /// Buckets of this class keyed by page base address, which is what makes
    /// "which bucket owns this pointer?" an ordered-map lookup instead of a
    /// list walk.
    buckets: BTreeMap<usize, Bucket>,
    /// Page base of the bucket receiving new allocations. New slots come
    /// from here and nowhere else until it runs out of never-used slots.
    current: Option<usize>,
}

impl SizeClass {
    fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            current: None,
        }
    }
}

/// Where a pointer handed to resize or free turned out to live.
enum Location {
    /// In a live bucket of this size class index.
    Small(usize),
    /// In the large allocation table.
    Large,
    /// In a retained empty bucket, meaning the whole bucket was freed
    /// earlier. Whatever the caller is doing with this pointer, it is a bug.
    Retained,
    /// Nowhere. The pointer was never ours, or its metadata is gone.
    Unknown,
}

/// The whole heap state behind the mutex. All the real work happens here;
/// [`Guardalloc`] only adds locking on top.
struct Heap<C: Config> {
    backing: C::Backing,
    /// Cached backing page size. 0 until the first allocation, which is also
    /// when `classes` gets its final length of `log2(page_size)`.
    page_size: usize,
    classes: Vec<SizeClass>,
    large: LargeTable,
    /// Drained buckets kept for double free detection, across all size
    /// classes, keyed by page base. Only fed when metadata retention is on.
    empty_buckets: BTreeMap<usize, Bucket>,
    /// Sum of user-requested lengths over all live allocations.
    total_requested_bytes: usize,
    requested_memory_limit: usize,
}

// The heap owns raw pointers into backing memory, which strips the auto
// impl. Ownership of those ranges is exclusive to the heap, so moving it to
// another thread is fine whenever the backing allocator itself can move.
unsafe impl<C: Config> Send for Heap<C> where C::Backing: Send {}

impl<C: Config> Heap<C> {
    fn new(backing: C::Backing) -> Self {
        Self {
            backing,
            page_size: 0,
            classes: Vec::new(),
            large: LargeTable::new(),
            empty_buckets: BTreeMap::new(),
            total_requested_bytes: 0,
            requested_memory_limit: usize::MAX,
        }
    }

    /// Reads the page size and sizes the per-class array on the first call,
    /// does nothing afterwards.
    fn ensure_init(&mut self) {
        if self.page_size == 0 {
            self.page_size = self.backing.page_size();
            debug_assert!(self.page_size.is_power_of_two());

            let count = size_class::small_class_count(self.page_size);
            self.classes = (0..count).map(|_| SizeClass::new()).collect();
        }
    }

    /// Layout of one bucket page: page-sized and page-aligned.
    fn page_layout(&self) -> Layout {
        // Unwrap: the page size is a power of two well below `isize::MAX`.
        Layout::from_size_align(self.page_size, self.page_size).unwrap()
    }

    fn alloc(&mut self, len: usize, log2_align: u8) -> AllocResult {
        debug_assert!(len > 0);

        self.ensure_init();

        if C::ENABLE_MEMORY_LIMIT {
            match self.total_requested_bytes.checked_add(len) {
                Some(total) if total <= self.requested_memory_limit => {}
                _ => return Err(AllocError),
            }
        }

        let address = if size_class::is_small(len, log2_align, self.page_size) {
            self.alloc_small(len, log2_align)?
        } else {
            self.alloc_large(len, log2_align)?
        };

        // Charged only once the whole operation has committed; every failure
        // above left the counter untouched.
        if C::ENABLE_MEMORY_LIMIT {
            self.total_requested_bytes += len;
        }

        Ok(NonNull::slice_from_raw_parts(address, len))
    }

    fn alloc_small(&mut self, len: usize, log2_align: u8) -> Result<NonNull<u8>, AllocError> {
        let index = size_class::class_index(len, log2_align);
        let size_class = size_class::class_size(index);
        let slots = size_class::slot_count(self.page_size, size_class);

        let current = match self.classes[index].current {
            Some(page) if !self.classes[index].buckets[&page].is_exhausted(slots) => page,
            _ => self.create_bucket(index)?,
        };

        // Unwrap: the current bucket is always registered in its class map.
        let bucket = self.classes[index].buckets.get_mut(&current).unwrap();
        let slot = bucket.claim_next_slot(slots);

        if C::SAFETY {
            bucket.record_request(slot, len, log2_align);
        }
        if C::STACK_TRACE_FRAMES > 0 {
            bucket.capture_slot_trace(slot, TraceKind::Alloc);
        }

        let address = unsafe { bucket.slot_address(slot, size_class) };

        if C::VERBOSE_LOG {
            trace!("small alloc {len} bytes at {:#x}", address.as_ptr() as usize);
        }

        Ok(address)
    }

    /// Maps a fresh page, builds its header and makes it the current bucket
    /// of its class.
    fn create_bucket(&mut self, index: usize) -> Result<usize, AllocError> {
        let size_class = size_class::class_size(index);
        let slots = size_class::slot_count(self.page_size, size_class);

        let page = self.backing.allocate(self.page_layout()).ok_or(AllocError)?;
        let base = page.as_ptr() as usize;
        debug_assert_eq!(base % self.page_size, 0);

        // The backing allocator may hand us a page we retained metadata for;
        // that metadata describes allocations that no longer exist.
        if C::RETAIN_METADATA {
            self.empty_buckets.remove(&base);
        }

        let bucket = Bucket::new(page, slots, C::STACK_TRACE_FRAMES, C::SAFETY);
        self.classes[index].buckets.insert(base, bucket);
        self.classes[index].current = Some(base);

        Ok(base)
    }

    fn alloc_large(&mut self, len: usize, log2_align: u8) -> Result<NonNull<u8>, AllocError> {
        let layout = Layout::from_size_align(len, 1 << log2_align).map_err(|_| AllocError)?;

        // Reserve the table slot first. Once the backing allocation has
        // succeeded there is nothing left on this path that can fail.
        self.large.reserve_one();

        let address = self.backing.allocate(layout).ok_or(AllocError)?;

        let mut record = LargeAllocation::new(address, len, log2_align, C::STACK_TRACE_FRAMES);
        if C::STACK_TRACE_FRAMES > 0 {
            record.capture_trace(TraceKind::Alloc);
        }
        self.large.insert(record);

        if C::VERBOSE_LOG {
            trace!("large alloc {len} bytes at {:#x}", address.as_ptr() as usize);
        }

        Ok(address)
    }

    /// Finds the store that owns `address`. The length and alignment the
    /// caller reports pick the first size class to try; the allocation may
    /// sit in a larger class than the length alone suggests when its
    /// alignment dominated, so the scan continues upward before falling back
    /// to the large table and the retained metadata.
    fn locate(&self, address: usize, len: usize, log2_align: u8) -> Location {
        let page = size_class::page_base(address, self.page_size);

        if size_class::is_small(len, log2_align, self.page_size) {
            for index in size_class::class_index(len, log2_align)..self.classes.len() {
                let class = &self.classes[index];

                // Checking the current bucket first skips the map query for
                // the most common pointer.
                if class.current == Some(page) || class.buckets.contains_key(&page) {
                    return Location::Small(index);
                }
            }
        }

        if self.large.contains(address) {
            return Location::Large;
        }

        if C::RETAIN_METADATA && self.empty_buckets.contains_key(&page) {
            return Location::Retained;
        }

        Location::Unknown
    }

    fn resize(
        &mut self,
        address: NonNull<u8>,
        old_len: usize,
        log2_old_align: u8,
        new_len: usize,
    ) -> bool {
        self.ensure_init();

        let addr = address.as_ptr() as usize;

        match self.locate(addr, old_len, log2_old_align) {
            Location::Small(index) => {
                self.resize_small(index, address, old_len, log2_old_align, new_len)
            }
            Location::Large => self.resize_large(address, old_len, new_len),
            Location::Retained => {
                self.report_retained_hit(addr);
                panic!("resize of freed allocation");
            }
            Location::Unknown => abort_unknown::<C>("resize", addr),
        }
    }

    fn resize_small(
        &mut self,
        index: usize,
        address: NonNull<u8>,
        old_len: usize,
        log2_align: u8,
        new_len: usize,
    ) -> bool {
        let size_class = size_class::class_size(index);
        let addr = address.as_ptr() as usize;
        let page = size_class::page_base(addr, self.page_size);

        // Unwrap: locate just found it in this class map.
        let bucket = self.classes[index].buckets.get_mut(&page).unwrap();
        let (slot, misalignment) = bucket.slot_of(addr, size_class);

        if C::SAFETY && misalignment != 0 {
            abort_unknown::<C>("resize", addr);
        }

        if !bucket.is_used(slot) {
            report_double_free::<C>(
                addr,
                bucket.slot_trace(slot, TraceKind::Alloc),
                bucket.slot_trace(slot, TraceKind::Free),
            );
            panic!("resize of freed allocation");
        }

        if C::SAFETY {
            let stored = bucket.requested_size(slot);
            if stored != old_len {
                abort_size_mismatch::<C>(addr, stored, old_len, bucket.slot_trace(slot, TraceKind::Alloc));
            }

            let stored_align = bucket.log2_align(slot);
            if stored_align != log2_align {
                abort_align_mismatch::<C>(addr, stored_align, log2_align, bucket.slot_trace(slot, TraceKind::Alloc));
            }
        }

        // The slot cannot move and cannot grow, so the new size must land in
        // the very same size class.
        if !size_class::is_small(new_len, log2_align, self.page_size)
            || size_class::class_index(new_len, log2_align) != index
        {
            return false;
        }

        if C::ENABLE_MEMORY_LIMIT {
            if new_len > old_len {
                match self.total_requested_bytes.checked_add(new_len - old_len) {
                    Some(total) if total <= self.requested_memory_limit => {
                        self.total_requested_bytes = total;
                    }
                    _ => return false,
                }
            } else {
                self.total_requested_bytes -= old_len - new_len;
            }
        }

        if new_len < old_len {
            // Poison the abandoned tail so use-after-shrink reads garbage.
            unsafe {
                address
                    .as_ptr()
                    .add(new_len)
                    .write_bytes(UNDEFINED_FILL, old_len - new_len);
            }
        }

        if C::SAFETY {
            bucket.record_request(slot, new_len, log2_align);
        }
        if C::VERBOSE_LOG {
            trace!("small resize {old_len} bytes at {addr:#x} to {new_len}");
        }

        true
    }

    fn resize_large(&mut self, address: NonNull<u8>, old_len: usize, new_len: usize) -> bool {
        let addr = address.as_ptr() as usize;

        // Unwrap: locate just found it.
        let record = self.large.get_mut(addr).unwrap();

        if C::RETAIN_METADATA && record.freed {
            report_double_free::<C>(
                addr,
                record.trace(TraceKind::Alloc),
                record.trace(TraceKind::Free),
            );
            panic!("resize of freed allocation");
        }

        if C::SAFETY && record.len != old_len {
            abort_size_mismatch::<C>(addr, record.len, old_len, record.trace(TraceKind::Alloc));
        }

        // A cap violation must be refused *before* asking the backing
        // allocator, which may not be able to revert an accepted resize.
        if C::ENABLE_MEMORY_LIMIT && new_len > record.requested_size {
            match self
                .total_requested_bytes
                .checked_add(new_len - record.requested_size)
            {
                Some(total) if total <= self.requested_memory_limit => {}
                _ => return false,
            }
        }

        // Unwrap: the record's layout was valid when the range was allocated.
        let layout = Layout::from_size_align(record.len, 1 << record.log2_align).unwrap();

        if !unsafe { self.backing.resize(record.address, layout, new_len) } {
            return false;
        }

        if C::ENABLE_MEMORY_LIMIT {
            self.total_requested_bytes =
                self.total_requested_bytes - record.requested_size + new_len;
            record.requested_size = new_len;
        }

        record.len = new_len;
        if C::STACK_TRACE_FRAMES > 0 {
            record.capture_trace(TraceKind::Alloc);
        }
        if C::VERBOSE_LOG {
            trace!("large resize {old_len} bytes at {addr:#x} to {new_len}");
        }

        true
    }

    fn free(&mut self, address: NonNull<u8>, len: usize, log2_align: u8) {
        self.ensure_init();

        let addr = address.as_ptr() as usize;

        if C::SAFETY && len == 0 {
            error!(
                "Free of zero bytes at {addr:#x}. Called here:{}",
                current_trace::<C>()
            );
            panic!("freed zero bytes");
        }

        match self.locate(addr, len, log2_align) {
            Location::Small(index) => self.free_small(index, address, len, log2_align),
            Location::Large => self.free_large(address, len),
            // The bucket that owned this pointer was drained earlier, so this
            // is a double (or wildly stale) free. Recoverable: report it and
            // change nothing rather than compound the damage.
            Location::Retained => self.report_retained_hit(addr),
            Location::Unknown => abort_unknown::<C>("free", addr),
        }
    }

    fn free_small(&mut self, index: usize, address: NonNull<u8>, len: usize, log2_align: u8) {
        let size_class = size_class::class_size(index);
        let addr = address.as_ptr() as usize;
        let page = size_class::page_base(addr, self.page_size);

        // Unwrap: locate just found it in this class map.
        let bucket = self.classes[index].buckets.get_mut(&page).unwrap();
        let (slot, misalignment) = bucket.slot_of(addr, size_class);

        if C::SAFETY && misalignment != 0 {
            abort_unknown::<C>("free", addr);
        }

        if !bucket.is_used(slot) {
            // Double free into a still-live bucket. Recoverable, like the
            // retained-bucket case.
            report_double_free::<C>(
                addr,
                bucket.slot_trace(slot, TraceKind::Alloc),
                bucket.slot_trace(slot, TraceKind::Free),
            );
            return;
        }

        if C::SAFETY {
            let stored = bucket.requested_size(slot);
            if stored != len {
                abort_size_mismatch::<C>(addr, stored, len, bucket.slot_trace(slot, TraceKind::Alloc));
            }

            let stored_align = bucket.log2_align(slot);
            if stored_align != log2_align {
                abort_align_mismatch::<C>(addr, stored_align, log2_align, bucket.slot_trace(slot, TraceKind::Alloc));
            }
        }

        if C::STACK_TRACE_FRAMES > 0 {
            bucket.capture_slot_trace(slot, TraceKind::Free);
        }

        bucket.release_slot(slot);
        if C::SAFETY {
            bucket.clear_request(slot);
        }

        let drained = bucket.used_count() == 0;

        unsafe { address.as_ptr().write_bytes(UNDEFINED_FILL, len) };

        if C::ENABLE_MEMORY_LIMIT {
            self.total_requested_bytes -= len;
        }
        if C::VERBOSE_LOG {
            trace!("small free {len} bytes at {addr:#x}");
        }

        if drained {
            self.retire_bucket(index, page);
        }
    }

    /// Takes a fully drained bucket out of service: out of the class map,
    /// out of the current slot if it held it, page back to the backing
    /// allocator (unless never-unmap keeps it hostage), and header either
    /// dropped or moved to the retained map.
    fn retire_bucket(&mut self, index: usize, page: usize) {
        // Unwrap: the caller just found it in this class map.
        let mut bucket = self.classes[index].buckets.remove(&page).unwrap();

        if self.classes[index].current == Some(page) {
            self.classes[index].current = None;
        }

        if !C::NEVER_UNMAP {
            unsafe { self.backing.deallocate(bucket.page(), self.page_layout()) };
        }

        if C::RETAIN_METADATA {
            let size_class = size_class::class_size(index);
            bucket.seal(size_class::slot_count(self.page_size, size_class));
            self.empty_buckets.insert(page, bucket);
        }
    }

    fn free_large(&mut self, address: NonNull<u8>, len: usize) {
        let addr = address.as_ptr() as usize;

        // Unwrap: locate just found it.
        let record = self.large.get_mut(addr).unwrap();

        if C::RETAIN_METADATA && record.freed {
            report_double_free::<C>(
                addr,
                record.trace(TraceKind::Alloc),
                record.trace(TraceKind::Free),
            );
            return;
        }

        if C::SAFETY && record.len != len {
            abort_size_mismatch::<C>(addr, record.len, len, record.trace(TraceKind::Alloc));
        }

        if !C::NEVER_UNMAP {
            // Unwrap: the record's layout was valid when the range was
            // allocated.
            let layout = Layout::from_size_align(record.len, 1 << record.log2_align).unwrap();
            unsafe { self.backing.deallocate(record.address, layout) };
        }

        if C::ENABLE_MEMORY_LIMIT {
            self.total_requested_bytes -= record.requested_size;
        }
        if C::VERBOSE_LOG {
            trace!("large free {len} bytes at {addr:#x}");
        }

        if C::RETAIN_METADATA {
            record.freed = true;
            if C::STACK_TRACE_FRAMES > 0 {
                record.capture_trace(TraceKind::Free);
            }
        } else {
            self.large.remove(addr);
        }
    }

    /// Reports a free or resize that landed in a retained empty bucket. The
    /// sealed cursor witnesses the size class, which the header does not
    /// store.
    fn report_retained_hit(&self, addr: usize) {
        let page = size_class::page_base(addr, self.page_size);

        // Unwrap: locate just found it.
        let bucket = self.empty_buckets.get(&page).unwrap();
        let size_class = self.page_size / bucket.alloc_cursor();
        let (slot, _) = bucket.slot_of(addr, size_class);

        report_double_free::<C>(
            addr,
            bucket.slot_trace(slot, TraceKind::Alloc),
            bucket.slot_trace(slot, TraceKind::Free),
        );
    }

    /// Walks both stores and logs every live allocation with its recorded
    /// allocation trace. Every bucket of every class is visited, not just
    /// the current ones.
    fn detect_leaks(&self) -> bool {
        let mut leaked = false;

        for (index, class) in self.classes.iter().enumerate() {
            let size_class = size_class::class_size(index);

            for bucket in class.buckets.values() {
                for slot in bucket.live_slots() {
                    let address = bucket.page_address() + slot * size_class;
                    error!(
                        "Memory leak detected at {address:#x}. Allocated here:{}",
                        trace::format(bucket.slot_trace(slot, TraceKind::Alloc))
                    );
                    leaked = true;
                }
            }
        }

        for record in self.large.iter() {
            if record.freed {
                continue;
            }

            error!(
                "Memory leak detected at {:#x}. Allocated here:{}",
                record.address.as_ptr() as usize,
                trace::format(record.trace(TraceKind::Alloc))
            );
            leaked = true;
        }

        leaked
    }

    /// Drops all metadata retained for double free detection. Under
    /// never-unmap this is also the moment the withheld pages and ranges go
    /// back to the backing allocator; freeing them is safe now that their
    /// diagnostics are gone anyway.
    fn flush_retained_metadata(&mut self) {
        if self.page_size == 0 {
            return;
        }

        let page_layout = self.page_layout();
        while let Some((_, bucket)) = self.empty_buckets.pop_first() {
            if C::NEVER_UNMAP {
                unsafe { self.backing.deallocate(bucket.page(), page_layout) };
            }
        }

        let backing = &self.backing;
        self.large.flush_freed(|record| {
            if C::NEVER_UNMAP {
                // Unwrap: the record's layout was valid when the range was
                // allocated.
                let layout = Layout::from_size_align(record.len, 1 << record.log2_align).unwrap();
                unsafe { backing.deallocate(record.address, layout) };
            }
        });
    }
}

/// A freshly captured trace of the offending call, for reports.
fn current_trace<C: Config>() -> String {
    let mut frames = vec![0; C::STACK_TRACE_FRAMES];
    trace::capture_caller(&mut frames);

    trace::format(&frames)
}

fn report_double_free<C: Config>(address: usize, alloc_trace: &[usize], free_trace: &[usize]) {
    error!(
        "Double free detected at {address:#x}. Allocated here:{}\nFirst freed here:{}\nSecond free here:{}",
        trace::format(alloc_trace),
        trace::format(free_trace),
        current_trace::<C>()
    );
}

fn abort_unknown<C: Config>(operation: &str, address: usize) -> ! {
    error!(
        "Invalid {operation} of address {address:#x}, which this allocator never handed out. \
         Called here:{}",
        current_trace::<C>()
    );
    panic!("invalid {operation}");
}

fn abort_size_mismatch<C: Config>(
    address: usize,
    stored: usize,
    given: usize,
    alloc_trace: &[usize],
) -> ! {
    error!(
        "Allocation size {stored} bytes does not match the {given} bytes being freed or resized \
         at {address:#x}. Allocated here:{}\nCalled here:{}",
        trace::format(alloc_trace),
        current_trace::<C>()
    );
    panic!("allocation size mismatch");
}

fn abort_align_mismatch<C: Config>(
    address: usize,
    stored: u8,
    given: u8,
    alloc_trace: &[usize],
) -> ! {
    error!(
        "Allocation alignment of 2^{stored} does not match the 2^{given} being freed or resized \
         at {address:#x}. Allocated here:{}\nCalled here:{}",
        trace::format(alloc_trace),
        current_trace::<C>()
    );
    panic!("allocation alignment mismatch");
}

/// The public face of the allocator: compile time [`Config`], the mutex it
/// selects, and the heap behind them.
///
/// Three core operations are exposed directly ([`Guardalloc::alloc`],
/// [`Guardalloc::resize`], [`Guardalloc::free`]) next to the standard
/// [`Allocator`] implementation, which layers zero-size handling and
/// move-on-failure reallocation on top of them. `resize` never moves an
/// allocation: it answers "can this stay at the same address with a new
/// length?" and nothing else.
///
/// Dropping the allocator without calling [`Guardalloc::deinit`] skips leak
/// detection; the memory itself is reclaimed by the process exit like any
/// other.
///
/// # Examples
///
/// ## Standalone allocator
///
/// ```rust
/// use guardalloc::{Check, DefaultConfig, Guardalloc};
///
/// let allocator = Guardalloc::<DefaultConfig>::new();
///
/// // 128 bytes aligned to 2^3.
/// let address = allocator.alloc(128, 3).unwrap();
/// assert!(address.len() >= 128);
/// assert_eq!(address.cast::<u8>().as_ptr() as usize % 8, 0);
///
/// unsafe { allocator.free(address.cast(), 128, 3) };
/// assert_eq!(allocator.deinit(), Check::Ok);
/// ```
///
/// ## Collections and [`Box`]
///
/// ```rust
/// #![feature(allocator_api)]
///
/// use guardalloc::{Check, DefaultConfig, Guardalloc};
///
/// let allocator = Guardalloc::<DefaultConfig>::new();
///
/// {
///     let boxed = Box::new_in(12, &allocator);
///     assert_eq!(*boxed, 12);
///
///     let mut numbers = Vec::new_in(&allocator);
///     numbers.extend([1, 2, 3]);
///     assert_eq!(numbers.iter().sum::<i32>(), 6);
/// }
///
/// assert_eq!(allocator.deinit(), Check::Ok);
/// ```
///
/// ## Leak detection
///
/// ```rust
/// use guardalloc::{Check, DefaultConfig, Guardalloc};
///
/// let allocator = Guardalloc::<DefaultConfig>::new();
/// let _leaked = allocator.alloc(64, 3).unwrap();
///
/// // The leak is logged with the stack trace that allocated it.
/// assert_eq!(allocator.deinit(), Check::Leak);
/// ```
pub struct Guardalloc<C: Config = crate::DefaultConfig> {
    heap: Mutex<C::Mutex, Heap<C>>,
}

impl<C: Config> Guardalloc<C> {
    pub fn new() -> Self {
        Self::with_backing(C::Backing::default())
    }

    /// Builds the allocator on top of an explicit backing allocator
    /// instance.
    pub fn with_backing(backing: C::Backing) -> Self {
        Self {
            heap: Mutex::new(Heap::new(backing)),
        }
    }

    /// Allocates `len` bytes aligned to `1 << log2_align`. Returns
    /// `Err(AllocError)` when the backing allocator refuses or the byte cap
    /// would be exceeded; nothing is charged on failure. `len` must be
    /// non-zero.
    pub fn alloc(&self, len: usize, log2_align: u8) -> AllocResult {
        self.heap.lock().alloc(len, log2_align)
    }

    /// Attempts to change the length of the allocation at `address` while
    /// keeping its base address. Returns `false` (and changes nothing) when
    /// that is impossible: small allocations can only move within their size
    /// class, large ones only as far as the backing allocator can stretch
    /// the range in place.
    ///
    /// # Safety
    ///
    /// `address`, `old_len` and `log2_old_align` must describe a live
    /// allocation previously returned by this allocator.
    pub unsafe fn resize(
        &self,
        address: NonNull<u8>,
        old_len: usize,
        log2_old_align: u8,
        new_len: usize,
    ) -> bool {
        self.heap.lock().resize(address, old_len, log2_old_align, new_len)
    }

    /// Frees the allocation at `address`. With safety on, a length or
    /// alignment that disagrees with what was allocated aborts with both
    /// stack traces; a double free is reported and survived.
    ///
    /// # Safety
    ///
    /// Same contract as [`Guardalloc::resize`]. A pointer this allocator
    /// never handed out aborts.
    pub unsafe fn free(&self, address: NonNull<u8>, len: usize, log2_align: u8) {
        self.heap.lock().free(address, len, log2_align)
    }

    /// Caps the total of user-requested bytes. Only enforced when the
    /// config enables the memory limit.
    pub fn set_requested_memory_limit(&self, limit: usize) {
        self.heap.lock().requested_memory_limit = limit;
    }

    /// Current total of user-requested bytes over all live allocations.
    pub fn total_requested_bytes(&self) -> usize {
        self.heap.lock().total_requested_bytes
    }

    /// Logs every live allocation with its allocation trace and reports
    /// whether there were any. [`Guardalloc::deinit`] does this implicitly.
    pub fn detect_leaks(&self) -> bool {
        self.heap.lock().detect_leaks()
    }

    /// Drops the metadata retained for double free detection (a no-op
    /// unless the config enables retention). Frees that arrive for ranges
    /// whose metadata was flushed are indistinguishable from wild pointers
    /// afterwards.
    pub fn flush_retained_metadata(&self) {
        self.heap.lock().flush_retained_metadata();
    }

    /// Tears the allocator down: runs leak detection over both stores,
    /// releases retained metadata (and, under never-unmap, the pages it was
    /// withholding), and reports whether anything was still live.
    pub fn deinit(self) -> Check {
        let mut heap = self.heap.into_inner();

        let leaked = heap.detect_leaks();
        heap.flush_retained_metadata();

        if leaked {
            Check::Leak
        } else {
            Check::Ok
        }
    }
}

impl<C: Config> Default for Guardalloc<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn log2_align_of(layout: Layout) -> u8 {
    layout.align().trailing_zeros() as u8
}

unsafe impl<C: Config> Allocator for Guardalloc<C> {
    fn allocate(&self, layout: Layout) -> AllocResult {
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(layout.dangling_ptr(), 0));
        }

        self.alloc(layout.size(), log2_align_of(layout))
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        self.free(address, layout.size(), log2_align_of(layout));
    }

    unsafe fn grow(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        // Same address first; only move when the stores cannot stretch the
        // allocation in place.
        if new_layout.align() == old_layout.align()
            && self.resize(
                address,
                old_layout.size(),
                log2_align_of(old_layout),
                new_layout.size(),
            )
        {
            return Ok(NonNull::slice_from_raw_parts(address, new_layout.size()));
        }

        let new_address = self.allocate(new_layout)?;
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_mut_ptr(), old_layout.size());
        self.free(address, old_layout.size(), log2_align_of(old_layout));

        Ok(new_address)
    }

    unsafe fn grow_zeroed(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        let new_address = self.grow(address, old_layout, new_layout)?;

        let zero_from = new_address.as_mut_ptr().add(old_layout.size());
        zero_from.write_bytes(0, new_layout.size() - old_layout.size());

        Ok(new_address)
    }

    unsafe fn shrink(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        if new_layout.size() == 0 {
            self.deallocate(address, old_layout);
            return self.allocate(new_layout);
        }

        if new_layout.align() == old_layout.align()
            && self.resize(
                address,
                old_layout.size(),
                log2_align_of(old_layout),
                new_layout.size(),
            )
        {
            return Ok(NonNull::slice_from_raw_parts(address, new_layout.size()));
        }

        let new_address = self.allocate(new_layout)?;
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_mut_ptr(), new_layout.size());
        self.free(address, old_layout.size(), log2_align_of(old_layout));

        Ok(new_address)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync, thread};

    use super::*;
    use crate::backing::SystemBacking;
    use crate::config::SingleThreaded;

    const PAGE: usize = SystemBacking::DEFAULT_PAGE_SIZE;

    /// Thread safe, all checks on, byte cap available, running on the
    /// std::alloc backing so the suite works everywhere (including Miri).
    struct TestConfig;

    impl Config for TestConfig {
        const STACK_TRACE_FRAMES: usize = 4;
        const ENABLE_MEMORY_LIMIT: bool = true;

        type Mutex = parking_lot::RawMutex;
        type Backing = SystemBacking;
    }

    /// The most paranoid mode: freed pages stay mapped and freed metadata
    /// stays diagnosable.
    struct ParanoidConfig;

    impl Config for ParanoidConfig {
        const STACK_TRACE_FRAMES: usize = 4;
        const NEVER_UNMAP: bool = true;
        const RETAIN_METADATA: bool = true;

        type Mutex = SingleThreaded;
        type Backing = SystemBacking;
    }

    fn logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn fill_and_drain_buckets_in_order() {
        let allocator = Guardalloc::<TestConfig>::new();
        let mut addresses = Vec::new();

        // 513 eight-byte objects overflow the 512 slots of the first bucket,
        // so this exercises the bucket handover.
        for _ in 0..513 {
            let address = allocator.alloc(8, 3).unwrap().cast::<u8>();
            let addr = address.as_ptr() as usize;

            // Slot addresses sit at multiples of the size class within their
            // page.
            assert_eq!((addr & (PAGE - 1)) % 8, 0);

            unsafe { address.as_ptr().write_bytes(69, 8) };
            addresses.push(address);
        }

        // The 513th allocation cannot share a page with the first 512.
        let first_page = addresses[0].as_ptr() as usize & !(PAGE - 1);
        let last_page = addresses[512].as_ptr() as usize & !(PAGE - 1);
        assert_ne!(first_page, last_page);

        for address in &addresses {
            unsafe { assert_eq!(*address.as_ptr(), 69) };
        }

        for address in addresses {
            unsafe { allocator.free(address, 8, 3) };
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn fill_and_drain_buckets_in_reverse() {
        let allocator = Guardalloc::<TestConfig>::new();

        let addresses: Vec<_> = (0..513)
            .map(|_| allocator.alloc(8, 3).unwrap().cast::<u8>())
            .collect();

        for address in addresses.into_iter().rev() {
            unsafe { allocator.free(address, 8, 3) };
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn double_free_is_reported_and_survived() {
        logging();

        let allocator = Guardalloc::<ParanoidConfig>::new();

        let address = allocator.alloc(64, 3).unwrap().cast::<u8>();
        let page = address.as_ptr() as usize & !(PAGE - 1);

        unsafe { allocator.free(address, 64, 3) };

        // The drained bucket migrated from its class map to the retained
        // map, with the cursor sealed as the size class witness.
        {
            let heap = allocator.heap.lock();
            let index = size_class::class_index(64, 3);

            assert!(!heap.classes[index].buckets.contains_key(&page));
            assert!(heap.empty_buckets.contains_key(&page));
            assert_eq!(heap.empty_buckets[&page].alloc_cursor(), PAGE / 64);
        }

        // Freeing again hits the retained metadata: reported, not fatal.
        unsafe { allocator.free(address, 64, 3) };

        // And the data structures survived intact.
        let after = allocator.alloc(64, 3).unwrap().cast::<u8>();
        unsafe { allocator.free(after, 64, 3) };

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn impossible_requests_fail_cleanly() {
        let allocator = Guardalloc::<TestConfig>::new();

        assert!(allocator.alloc(usize::MAX, 0).is_err());
        assert!(allocator.alloc(usize::MAX - PAGE, 0).is_err());
        assert_eq!(allocator.total_requested_bytes(), 0);

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn memory_limit_tracks_requested_bytes() {
        let allocator = Guardalloc::<TestConfig>::new();
        allocator.set_requested_memory_limit(1010);

        let first = allocator.alloc(4, 2).unwrap().cast::<u8>();
        assert_eq!(allocator.total_requested_bytes(), 4);

        let second = allocator.alloc(1000, 0).unwrap().cast::<u8>();
        assert_eq!(allocator.total_requested_bytes(), 1004);

        // 8 more would make 1012. The refusal charges nothing.
        assert!(allocator.alloc(8, 3).is_err());
        assert_eq!(allocator.total_requested_bytes(), 1004);

        unsafe { allocator.free(first, 4, 2) };
        assert_eq!(allocator.total_requested_bytes(), 1000);

        unsafe { allocator.free(second, 1000, 0) };
        assert_eq!(allocator.total_requested_bytes(), 0);

        let third = allocator.alloc(1010, 0).unwrap().cast::<u8>();
        assert_eq!(allocator.total_requested_bytes(), 1010);

        unsafe { allocator.free(third, 1010, 0) };
        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn memory_limit_guards_large_resize() {
        let allocator = Guardalloc::<TestConfig>::new();
        allocator.set_requested_memory_limit(10_000);

        let len = PAGE * 2 + 50;
        let address = allocator.alloc(len, 0).unwrap().cast::<u8>();

        unsafe {
            // Rounds to the same page count, so only the cap can refuse it.
            assert!(!allocator.resize(address, len, 0, 10_001));
            assert_eq!(allocator.total_requested_bytes(), len);

            assert!(allocator.resize(address, len, 0, 9_000));
            assert_eq!(allocator.total_requested_bytes(), 9_000);

            allocator.free(address, 9_000, 0);
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn large_allocations_resize_in_place() {
        let allocator = Guardalloc::<TestConfig>::new();

        let len = PAGE * 2 + 50;
        let address = allocator.alloc(len, 0).unwrap().cast::<u8>();

        unsafe {
            *address.as_ptr() = 0x12;
            *address.as_ptr().add(60) = 0x34;

            // Same rounded page count: accepted, contents intact.
            assert!(allocator.resize(address, len, 0, PAGE * 2 + 1));
            assert_eq!(*address.as_ptr(), 0x12);
            assert_eq!(*address.as_ptr().add(60), 0x34);

            // Fewer pages: this backing cannot split, so the resize is
            // refused and the allocation is untouched.
            assert!(!allocator.resize(address, PAGE * 2 + 1, 0, 19));
            assert_eq!(*address.as_ptr().add(60), 0x34);

            allocator.free(address, PAGE * 2 + 1, 0);
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn shrinking_falls_back_to_a_copy() {
        let allocator = Guardalloc::<TestConfig>::new();

        let old_layout = Layout::from_size_align(PAGE * 2 + 50, 1).unwrap();
        let new_layout = Layout::from_size_align(100, 1).unwrap();

        unsafe {
            let address = allocator.allocate(old_layout).unwrap().cast::<u8>();
            *address.as_ptr() = 0x12;
            *address.as_ptr().add(60) = 0x34;

            // The large range cannot shrink in place to a small size, so the
            // contents move to a bucket slot.
            let moved = allocator.shrink(address, old_layout, new_layout).unwrap().cast::<u8>();
            assert_eq!(*moved.as_ptr(), 0x12);
            assert_eq!(*moved.as_ptr().add(60), 0x34);

            allocator.deallocate(moved, new_layout);
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn small_resize_stays_within_the_class() {
        let allocator = Guardalloc::<TestConfig>::new();

        let address = allocator.alloc(20, 0).unwrap().cast::<u8>();

        unsafe {
            address.as_ptr().write_bytes(0x55, 20);

            // 20 and 30 both live in the 32 byte class.
            assert!(allocator.resize(address, 20, 0, 30));

            // 40 does not.
            assert!(!allocator.resize(address, 30, 0, 40));

            // Neither does 5: same address resize means same class exactly.
            assert!(!allocator.resize(address, 30, 0, 5));

            // Shrinking poisons the abandoned tail.
            assert!(allocator.resize(address, 30, 0, 17));
            for i in 17..30 {
                assert_eq!(*address.as_ptr().add(i), UNDEFINED_FILL);
            }
            for i in 0..17 {
                assert_eq!(*address.as_ptr().add(i), 0x55);
            }

            allocator.free(address, 17, 0);
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    // Leaks on purpose, which Miri's own leak checker would flag.
    #[cfg_attr(miri, ignore)]
    #[test]
    fn leaks_are_detected_in_both_stores() {
        let small_leak = Guardalloc::<TestConfig>::new();
        small_leak.alloc(16, 0).unwrap();
        assert_eq!(small_leak.deinit(), Check::Leak);

        let large_leak = Guardalloc::<TestConfig>::new();
        large_leak.alloc(PAGE * 3, 0).unwrap();
        assert_eq!(large_leak.deinit(), Check::Leak);
    }

    // Ends with live allocations on purpose, see above.
    #[cfg_attr(miri, ignore)]
    #[test]
    fn freed_slots_are_never_handed_out_again() {
        let allocator = Guardalloc::<ParanoidConfig>::new();

        let first = allocator.alloc(8, 3).unwrap().cast::<u8>();
        let freed_addr = first.as_ptr() as usize;

        // Keep the bucket alive with a second slot, then free the first.
        let _second = allocator.alloc(8, 3).unwrap();
        unsafe { allocator.free(first, 8, 3) };

        // Even draining the rest of this bucket and the next one never
        // produces the freed slot again.
        for _ in 0..600 {
            let address = allocator.alloc(8, 3).unwrap().cast::<u8>();
            assert_ne!(address.as_ptr() as usize, freed_addr);
        }

        assert_eq!(allocator.deinit(), Check::Leak);
    }

    #[test]
    fn flushing_retained_metadata_releases_it() {
        let allocator = Guardalloc::<ParanoidConfig>::new();

        // One retained bucket and one retained large range.
        let small = allocator.alloc(64, 3).unwrap().cast::<u8>();
        let large = allocator.alloc(PAGE * 2, 3).unwrap().cast::<u8>();
        unsafe {
            allocator.free(small, 64, 3);
            allocator.free(large, PAGE * 2, 3);
        }

        {
            let heap = allocator.heap.lock();
            assert_eq!(heap.empty_buckets.len(), 1);
            assert!(heap.large.get(large.as_ptr() as usize).unwrap().freed);
        }

        allocator.flush_retained_metadata();

        {
            let heap = allocator.heap.lock();
            assert!(heap.empty_buckets.is_empty());
            assert!(heap.large.get(large.as_ptr() as usize).is_none());
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    // The aborting tests leak whatever was live when the panic hit, so they
    // are also skipped under Miri.
    #[cfg_attr(miri, ignore)]
    #[test]
    #[should_panic = "allocation size mismatch"]
    fn lying_about_the_size_aborts() {
        let allocator = Guardalloc::<TestConfig>::new();

        // 12 classifies into the same 16 byte class, so the slot is found
        // and the stored request contradicts the caller.
        let address = allocator.alloc(16, 0).unwrap().cast::<u8>();
        unsafe { allocator.free(address, 12, 0) };
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    #[should_panic = "allocation alignment mismatch"]
    fn lying_about_the_alignment_aborts() {
        let allocator = Guardalloc::<TestConfig>::new();

        let address = allocator.alloc(32, 3).unwrap().cast::<u8>();
        unsafe { allocator.free(address, 32, 2) };
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    #[should_panic = "invalid free"]
    fn freeing_a_wild_pointer_aborts() {
        let allocator = Guardalloc::<TestConfig>::new();

        // Touch the allocator once so the class maps exist.
        let _live = allocator.alloc(16, 0).unwrap();

        let wild = NonNull::new(0x7000 as *mut u8).unwrap();
        unsafe { allocator.free(wild, 16, 0) };
    }

    #[test]
    fn zero_size_layouts_never_reach_the_heap() {
        let allocator = Guardalloc::<TestConfig>::new();
        let layout = Layout::from_size_align(0, 8).unwrap();

        let address = allocator.allocate(layout).unwrap();
        assert_eq!(address.len(), 0);

        unsafe { allocator.deallocate(address.cast(), layout) };

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    #[test]
    fn works_with_standard_collections() {
        let allocator = Guardalloc::<TestConfig>::new();

        {
            let boxed = Box::new_in(1234u64, &allocator);
            assert_eq!(*boxed, 1234);

            let mut items = Vec::new_in(&allocator);
            for i in 0..100 {
                items.push(i);
            }
            assert_eq!(items.iter().sum::<i32>(), 4950);
        }

        assert_eq!(allocator.deinit(), Check::Ok);
    }

    /// All threads allocate, write, verify and free concurrently. If two
    /// ever receive overlapping memory the corruption checks catch it.
    #[test]
    fn concurrent_allocations_and_frees() {
        let allocator = Guardalloc::<TestConfig>::new();

        let num_threads = 4;
        let barrier = sync::Barrier::new(num_threads);

        // Miri is really slow, but we don't need as many operations to find
        // bugs with it.
        let rounds = if cfg!(miri) { 5 } else { 50 };

        thread::scope(|scope| {
            for _ in 0..num_threads {
                scope.spawn(|| unsafe {
                    let sizes = [16, 256, 1024, PAGE * 2];

                    barrier.wait();

                    for round in 0..rounds {
                        for size in sizes {
                            let address = allocator.alloc(size, 3).unwrap().cast::<u8>();
                            let fill = (round % 251) as u8;

                            for i in [0, size / 2, size - 1] {
                                *address.as_ptr().add(i) = fill;
                            }
                            for i in [0, size / 2, size - 1] {
                                assert_eq!(*address.as_ptr().add(i), fill);
                            }

                            allocator.free(address, size, 3);
                        }
                    }
                });
            }
        });

        assert_eq!(allocator.deinit(), Check::Ok);
    }
}
