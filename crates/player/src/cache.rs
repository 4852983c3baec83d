use montage_media::frame::ImageMat;

/// Hard cap on cached frames during a scrub session.
pub const MAX_CACHE_SIZE: usize = 64;
/// Size the cache is trimmed back to once the cap is hit.
pub const CACHE_SHRINK_SIZE: usize = 48;
/// Minimum spacing between cached timestamps.
pub const MIN_CACHE_FRAME_INTERVAL_MS: i64 = 500;

/// Timestamp-sorted cache of decoded frames kept while scrubbing. The
/// published image snaps to the cached frame nearest the current target;
/// when the cache overflows, whichever end lies farther from the target
/// is dropped first.
pub struct ScrubFrameCache {
    frames: Vec<ImageMat>,
}

impl Default for ScrubFrameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ScrubFrameCache {
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(MAX_CACHE_SIZE),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Whether a frame at `ts_ms` is far enough from every cached entry
    /// to be worth converting and inserting.
    pub fn accepts(&self, ts_ms: i64) -> bool {
        self.frames
            .iter()
            .all(|m| (timestamp_ms(m) - ts_ms).abs() >= MIN_CACHE_FRAME_INTERVAL_MS)
    }

    /// Inserts a converted frame, keeping the cache sorted and trimming
    /// toward `target_ms` when over the cap. Returns false when the frame
    /// was too close to an existing entry.
    pub fn insert(&mut self, mat: ImageMat, target_ms: i64) -> bool {
        let ts = timestamp_ms(&mat);
        if !self.accepts(ts) {
            return false;
        }
        let at = self.frames.partition_point(|m| timestamp_ms(m) < ts);
        self.frames.insert(at, mat);

        if self.frames.len() > MAX_CACHE_SIZE {
            while self.frames.len() > CACHE_SHRINK_SIZE {
                let front = timestamp_ms(&self.frames[0]);
                let back = timestamp_ms(&self.frames[self.frames.len() - 1]);
                if (front - target_ms).abs() > (back - target_ms).abs() {
                    self.frames.remove(0);
                } else {
                    self.frames.pop();
                }
            }
        }
        true
    }

    /// The cached frame with minimum `|ts − target|`.
    pub fn nearest(&self, target_ms: i64) -> Option<&ImageMat> {
        self.frames
            .iter()
            .min_by_key(|m| (timestamp_ms(m) - target_ms).abs())
    }
}

fn timestamp_ms(mat: &ImageMat) -> i64 {
    (mat.timestamp * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};
    use montage_media::frame::ImageMat;

    use super::{CACHE_SHRINK_SIZE, MAX_CACHE_SIZE, ScrubFrameCache};

    fn frame(ts_ms: i64) -> ImageMat {
        ImageMat::from_image(
            RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255])),
            ts_ms as f64 / 1000.0,
        )
    }

    #[test]
    fn nearby_timestamps_are_rejected() {
        let mut cache = ScrubFrameCache::new();
        assert!(cache.insert(frame(3000), 3000));
        assert!(!cache.insert(frame(3100), 3000));
        assert!(cache.insert(frame(3600), 3000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn oscillating_scrub_stays_bounded() {
        let mut cache = ScrubFrameCache::new();
        for _ in 0..20 {
            cache.insert(frame(3000), 3000);
            cache.insert(frame(3100), 3100);
        }
        assert!(cache.len() <= MAX_CACHE_SIZE);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn overflow_shrinks_away_from_target() {
        let mut cache = ScrubFrameCache::new();
        for i in 0..MAX_CACHE_SIZE {
            assert!(cache.insert(frame(i as i64 * 1000), 0));
        }
        // one more entry forces the shrink while the target sits at the
        // low end, so the high timestamps are dropped first
        assert!(cache.insert(frame(MAX_CACHE_SIZE as i64 * 1000), 500));
        assert_eq!(cache.len(), CACHE_SHRINK_SIZE);
        let snapped = cache.nearest(60_000).expect("non-empty");
        assert_eq!(snapped.timestamp, (CACHE_SHRINK_SIZE - 1) as f64);
    }

    #[test]
    fn nearest_snaps_to_closest_entry() {
        let mut cache = ScrubFrameCache::new();
        cache.insert(frame(1000), 0);
        cache.insert(frame(2000), 0);
        cache.insert(frame(3000), 0);
        let snapped = cache.nearest(2300).expect("non-empty");
        assert_eq!(snapped.timestamp, 2.0);
    }
}
