use std::sync::atomic::{AtomicI64, Ordering};

/// Sentinel for "not attached to anything".
pub const UNATTACHED: i64 = -1;

/// Monotonic id source. Ids are stable for the lifetime of the process
/// and strictly increasing, so `(start, id)` ordering is total.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicI64::new(1),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Keeps the generator ahead of an id observed in loaded data.
    pub fn observe(&self, id: i64) {
        self.next.fetch_max(id + 1, Ordering::Relaxed);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: IdGenerator = IdGenerator::new();

/// Draws from the process-wide generator.
pub fn next_id() -> i64 {
    GLOBAL.next()
}

/// Records an externally supplied id so later generated ids stay above it.
pub fn observe_id(id: i64) {
    GLOBAL.observe(id);
}

#[cfg(test)]
mod tests {
    use super::IdGenerator;

    #[test]
    fn ids_are_strictly_increasing() {
        let generator = IdGenerator::new();
        let a = generator.next();
        let b = generator.next();
        assert!(b > a);
    }

    #[test]
    fn observe_skips_past_loaded_ids() {
        let generator = IdGenerator::new();
        generator.observe(100);
        assert!(generator.next() > 100);
    }
}
