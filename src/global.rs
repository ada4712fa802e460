//! A zone that can live in a `static`.

use spin::{Mutex, MutexGuard, Once};

use crate::pages::PageSource;
use crate::zone::Zone;

/// Process-wide zone, initialized exactly once before any pool or cache is
/// created.
///
/// ```ignore
/// static KERNEL_ZONE: LockedZone<FrameArena<'static>> = LockedZone::new();
///
/// KERNEL_ZONE.init(arena).ok();
/// let cache = KERNEL_ZONE.lock().create_cache(None, "task", 512)?;
/// ```
pub struct LockedZone<P> {
    zone: Once<Mutex<Zone<P>>>,
}

impl<P: PageSource> LockedZone<P> {
    pub const fn new() -> LockedZone<P> {
        LockedZone { zone: Once::new() }
    }

    /// Installs the page source. A zone can only be initialized once; later
    /// calls hand `pages` back untouched.
    pub fn init(&self, pages: P) -> Result<(), P> {
        let mut pages = Some(pages);
        self.zone.call_once(|| match pages.take() {
            Some(pages) => Mutex::new(Zone::new(pages)),
            // The closure runs at most once.
            None => unreachable!(),
        });
        match pages {
            None => Ok(()),
            Some(pages) => Err(pages),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.zone.is_completed()
    }

    /// Locks the zone. Halts if `init` was never called.
    pub fn lock(&self) -> MutexGuard<'_, Zone<P>> {
        match self.zone.get() {
            Some(zone) => zone.lock(),
            None => fatal!("objcache: zone used before initialization"),
        }
    }

    /// Locks the zone if it is initialized and nobody else holds it.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Zone<P>>> {
        self.zone.get()?.try_lock()
    }
}
