#![feature(allocator_api)]
#![feature(slice_ptr_get)]

//! Safety-oriented general purpose allocator. Small objects are served from
//! page-sized buckets divided into fixed power-of-two slots, large objects go
//! through a side table, and both stores remember who allocated (and freed)
//! every byte. That bookkeeping buys us double free detection, leak detection
//! with captured stack traces, an optional cap on total requested bytes, and
//! an optional mode where freed pages are never returned to the kernel so
//! use-after-free bugs fault instead of silently reading recycled memory.
//!
//! The price is throughput. If you want a fast allocator, this is not it; if
//! you want the allocator to tell you which call site leaked 3 allocations,
//! keep reading. Start at [`Guardalloc`] for the public API and [`Config`]
//! for the compile time switches.

use std::{alloc::AllocError, ptr::NonNull};

mod allocator;
mod backing;
mod bucket;
mod config;
mod large;
mod size_class;
mod trace;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

/// Shorter syntax for allocation/reallocation return types.
pub(crate) type AllocResult = Result<NonNull<[u8]>, AllocError>;

pub use allocator::{Check, Guardalloc};
pub use backing::{BackingAllocator, Platform, SystemBacking};
pub use config::{Config, DefaultConfig, SingleThreaded};
