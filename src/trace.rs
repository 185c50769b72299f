//! Stack trace capture for allocation bookkeeping. Traces are stored inline
//! in bucket and large-allocation metadata as plain arrays of instruction
//! addresses, zero-terminated when shorter than the buffer, so the storage
//! has no ownership of its own and costs nothing when capture is disabled.

use std::fmt::Write;

/// Frames of our own machinery between the user's call and the capture
/// closure: the `trace` dispatch, this module and the allocator internals.
/// Rust has no stable way to grab the caller's return address, so we skip a
/// fixed depth instead; being off by a frame only shifts the report, it never
/// corrupts it.
const SKIP_OWN_FRAMES: usize = 3;

/// Fills `frames` with the instruction addresses of the current call stack,
/// skipping our own machinery. Shorter stacks leave the rest of the buffer
/// zeroed; the first zero terminates the trace.
pub(crate) fn capture_caller(frames: &mut [usize]) {
    frames.fill(0);

    if frames.is_empty() {
        return;
    }

    // There's no unwinder under Miri. Reports will carry empty traces, which
    // the tests accept.
    if cfg!(miri) {
        return;
    }

    let mut skipped = 0;
    let mut index = 0;

    backtrace::trace(|frame| {
        if skipped < SKIP_OWN_FRAMES {
            skipped += 1;
            return true;
        }

        frames[index] = frame.ip() as usize;
        index += 1;

        index < frames.len()
    });
}

/// Renders a captured trace for a report, one frame per line, resolving
/// symbol names on a best effort basis.
pub(crate) fn format(frames: &[usize]) -> String {
    let mut rendered = String::new();

    for &address in frames {
        if address == 0 {
            break;
        }

        let mut symbol = None;
        backtrace::resolve(address as *mut core::ffi::c_void, |resolved| {
            if symbol.is_none() {
                symbol = resolved.name().map(|name| name.to_string());
            }
        });

        let _ = match symbol {
            Some(name) => write!(rendered, "\n    {address:#018x} - {name}"),
            None => write!(rendered, "\n    {address:#018x}"),
        };
    }

    if rendered.is_empty() {
        rendered.push_str(" <no trace captured>");
    }

    rendered
}
