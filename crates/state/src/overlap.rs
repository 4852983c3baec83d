/// The intersection of exactly two clips on one track.
///
/// Overlaps never own clips; they carry the ids of the pair and are
/// refreshed from the track's clip arena whenever either member moves.
/// `front` is the member that starts earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlap {
    id: i64,
    front_id: i64,
    rear_id: i64,
    start: i64,
    end: i64,
}

impl Overlap {
    /// Builds the overlap of two clip ranges; `None` when they do not
    /// intersect. Ranges are `(id, start, end)`.
    pub fn between(id: i64, a: (i64, i64, i64), b: (i64, i64, i64)) -> Option<Self> {
        let mut overlap = Self {
            id,
            front_id: a.0,
            rear_id: b.0,
            start: 0,
            end: 0,
        };
        if overlap.update(a, b) { Some(overlap) } else { None }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn front_id(&self) -> i64 {
        self.front_id
    }

    pub fn rear_id(&self) -> i64 {
        self.rear_id
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn duration(&self) -> i64 {
        self.end - self.start
    }

    pub fn involves(&self, clip_id: i64) -> bool {
        self.front_id == clip_id || self.rear_id == clip_id
    }

    pub fn is_pair(&self, id1: i64, id2: i64) -> bool {
        (self.front_id == id1 && self.rear_id == id2)
            || (self.front_id == id2 && self.rear_id == id1)
    }

    pub fn contains(&self, pos: i64) -> bool {
        pos >= self.start && pos < self.end
    }

    /// Recomputes the intersection from the members' current ranges and
    /// reports whether the overlap is still valid (`duration > 0`).
    pub fn update(&mut self, a: (i64, i64, i64), b: (i64, i64, i64)) -> bool {
        let (front, rear) = if a.1 <= b.1 { (a, b) } else { (b, a) };
        self.front_id = front.0;
        self.rear_id = rear.0;
        self.start = front.1.max(rear.1);
        self.end = front.2.min(rear.2);
        self.duration() > 0
    }
}

/// Whether two `[start, end)` ranges intersect with positive length.
pub fn ranges_intersect(a: (i64, i64), b: (i64, i64)) -> bool {
    a.0.max(b.0) < a.1.min(b.1)
}

#[cfg(test)]
mod tests {
    use super::{Overlap, ranges_intersect};

    #[test]
    fn between_computes_intersection() {
        let overlap = Overlap::between(1, (10, 0, 1000), (11, 900, 1300)).expect("intersects");
        assert_eq!(overlap.start(), 900);
        assert_eq!(overlap.end(), 1000);
        assert_eq!(overlap.duration(), 100);
        assert_eq!(overlap.front_id(), 10);
        assert_eq!(overlap.rear_id(), 11);
    }

    #[test]
    fn abutting_ranges_do_not_overlap() {
        assert!(Overlap::between(1, (10, 0, 1000), (11, 1000, 1500)).is_none());
        assert!(!ranges_intersect((0, 1000), (1000, 1500)));
    }

    #[test]
    fn update_reorders_front_and_rear() {
        let mut overlap = Overlap::between(1, (10, 500, 900), (11, 400, 600)).expect("intersects");
        assert_eq!(overlap.front_id(), 11);
        assert_eq!(overlap.rear_id(), 10);
        // move the former rear fully past the former front
        assert!(!overlap.update((10, 500, 900), (11, 900, 1100)));
    }
}
