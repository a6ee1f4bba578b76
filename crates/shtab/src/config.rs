//! Store configuration.
//!
//! The arena geometry is bounded at compile time because the shared-memory
//! header embeds fixed-size bitmap and root arrays; within those bounds the
//! embedding host picks the actual geometry at init. Runtime knobs are the
//! collector's step budget and its trigger mode.

use shtab_util::status::{Result, Status};

/// Hard upper bound on regions in the arena; sizes the header's region
/// metadata array.
pub const MAX_REGIONS: usize = 64;

/// Hard upper bound on pages per region; sizes each region's free bitmap.
pub const MAX_PAGES_PER_REGION: usize = 1024;

/// Capacity of the collector's root set.
pub const GC_MAX_ROOTS: usize = 512;

/// Smallest slab object: 2^3 = 8 bytes, enough for one free-list link.
pub const SLAB_MIN_SHIFT: u32 = 3;

/// Upper bound on slab size classes; sizes the slab pool's class array.
/// Classes run from `SLAB_MIN_SHIFT` to the page shift inclusive.
pub const MAX_SLAB_CLASSES: usize = 16;

/// Configuration for [`crate::Store::init`].
///
/// # Examples
///
/// ```no_run
/// use shtab::Config;
///
/// let config = Config {
///     region_count: 8,
///     pages_per_region: 64,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of regions carved from the arena. At most [`MAX_REGIONS`].
    pub region_count: usize,

    /// Pages per region. At most [`MAX_PAGES_PER_REGION`].
    pub pages_per_region: usize,

    /// Wall-time budget of one collector step, in microseconds. The
    /// collector calibrates its per-step work counts to stay near this.
    pub gc_step_usec: i64,

    /// When true, the collector only runs when the embedding host calls
    /// [`crate::Store::gc_run`]. When false, mutation paths run it
    /// opportunistically.
    pub run_gc_periodical: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_count: 32,
            pages_per_region: 256,
            gc_step_usec: 1_000,
            run_gc_periodical: true,
        }
    }
}

impl Config {
    /// Check the configuration against the compile-time bounds.
    pub fn validate(&self) -> Result<()> {
        if self.region_count == 0 || self.region_count > MAX_REGIONS {
            return Err(Status::ArgInvalid("region_count out of bounds"));
        }
        if self.pages_per_region == 0 || self.pages_per_region > MAX_PAGES_PER_REGION {
            return Err(Status::ArgInvalid("pages_per_region out of bounds"));
        }
        if self.gc_step_usec <= 0 {
            return Err(Status::ArgInvalid("gc_step_usec must be positive"));
        }
        Ok(())
    }

    /// Total data pages in the arena.
    pub fn total_pages(&self) -> usize {
        self.region_count * self.pages_per_region
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut c = Config::default();
        c.region_count = MAX_REGIONS + 1;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.pages_per_region = 0;
        assert!(c.validate().is_err());

        let mut c = Config::default();
        c.gc_step_usec = 0;
        assert!(c.validate().is_err());
    }
}
