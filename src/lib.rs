//! A pool and object-cache allocator for fixed size kernel objects.
//!
//! # Overview
//!
//! The organization is as follows:
//!
//!  * A `PageSource` hands out whole pages and maps any address inside an
//!    acquired page to its `PageDescriptor`. `FrameArena` is one such source
//!    backed by a contiguous region.
//!  * A pool reserves a number of pages up front so the caches it backs
//!    do not depend on later page pressure.
//!  * An object cache allocates objects of exactly one size. It slices chunks
//!    (pages) taken from its pool into slots and keeps track of them through
//!    a current chunk and its partial and full chunk lists.
//!  * A `Zone` owns the page source, the implicit global pool and the two
//!    bootstrap caches that hold the metadata of every other cache and pool.
//!
//! The chunk header of a page lives in its descriptor, so freeing an object
//! only needs the object's address.
//!
//! # Process-wide use
//! See `LockedZone` for a lazily initialized, lock protected zone that can
//! live in a `static`.
#![no_std]
#![crate_name = "objcache"]
#![crate_type = "lib"]

#[cfg(test)]
#[macro_use]
extern crate std;

/// Logs the violated invariant and halts. Allocator corruption is never
/// recoverable.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        panic!($($arg)+)
    }};
}

mod chunk;
mod debug;
mod frames;
mod global;
mod pages;
mod pool;
mod sc;
mod zone;

pub use frames::*;
pub use global::*;
pub use pages::*;
pub use pool::{PoolReport, ReservePolicy};
pub use sc::{CacheReport, CacheStats};
pub use zone::*;

#[cfg(test)]
mod tests;

use core::fmt;

/// Byte pattern written over slots when poisoning is enabled.
pub const POISON_PATTERN: u8 = 0x5a;

/// Error that can be returned for pool, cache and allocation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationError {
    /// The page source could not supply a page, or a pool's reserve is
    /// exhausted.
    OutOfMemory,
    /// Object size is zero or larger than a page.
    InvalidSize(usize),
    /// A pool must reserve at least one chunk.
    ZeroReservation,
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationError::OutOfMemory => write!(f, "out of memory"),
            AllocationError::InvalidSize(size) => {
                write!(f, "invalid object size {} (must be 1..={})", size, PAGE_SIZE)
            }
            AllocationError::ZeroReservation => write!(f, "pool reservation must be non-zero"),
        }
    }
}

/// Runtime debugging knobs of a `Zone`.
///
/// The defaults follow the `poison` and `check-free` cargo features; free
/// checking is also on in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Pattern written over a slot when it is handed out and when it is freed.
    pub poison: Option<u8>,
    /// Reject double frees and addresses that are not live slots.
    pub check_frees: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            poison: if cfg!(feature = "poison") {
                Some(POISON_PATTERN)
            } else {
                None
            },
            check_frees: cfg!(any(feature = "check-free", debug_assertions)),
        }
    }
}
