use ffmpeg_the_third as ffmpeg;

use crate::error::{Error, Result};

/// FFmpeg-like rational number used as a time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// Engine time base: milliseconds.
    pub const MILLIS: Self = Self { num: 1, den: 1000 };

    /// Creates a validated rational.
    pub fn new(num: i32, den: i32) -> Result<Self> {
        if num <= 0 || den <= 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid rational {num}/{den}"
            )));
        }
        Ok(Self { num, den })
    }

    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }
}

/// Engine time base `(1, 1000)`: every internal timestamp is an `i64`
/// millisecond count.
pub const MILLIS_TIME_BASE: Rational = Rational::MILLIS;

/// Rescales `ts` from one time base to another, rounding to nearest with
/// halves away from zero. The product `ts · from.num · to.den` can
/// overflow 64 bits for large timestamps, so the intermediate math is
/// 128-bit; biasing by half the divisor before the truncating division
/// gives the nearest result without touching floats.
pub fn rescale(ts: i64, from: Rational, to: Rational) -> i64 {
    let scaled = i128::from(ts) * i128::from(from.num) * i128::from(to.den);
    let unit = i128::from(from.den) * i128::from(to.num);
    let half = unit / 2;
    let nearest = if scaled >= 0 {
        (scaled + half) / unit
    } else {
        (scaled - half) / unit
    };
    nearest.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

/// Rescales a stream timestamp into the engine's millisecond domain.
pub fn to_millis(ts: i64, stream_time_base: Rational) -> i64 {
    rescale(ts, stream_time_base, MILLIS_TIME_BASE)
}

/// Rescales an engine millisecond timestamp into a stream time base.
pub fn from_millis(ms: i64, stream_time_base: Rational) -> i64 {
    rescale(ms, MILLIS_TIME_BASE, stream_time_base)
}

impl From<ffmpeg::Rational> for Rational {
    fn from(value: ffmpeg::Rational) -> Self {
        Self {
            num: value.numerator(),
            den: value.denominator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MILLIS_TIME_BASE, Rational, from_millis, rescale, to_millis};

    #[test]
    fn rational_new_rejects_non_positive() {
        assert!(Rational::new(-1, 90_000).is_err());
        assert!(Rational::new(1, 0).is_err());
    }

    #[test]
    fn rescale_round_trips_common_stream_bases() {
        let tb = Rational::new(1, 90_000).expect("valid");
        assert_eq!(rescale(90_000, tb, MILLIS_TIME_BASE), 1000);
        assert_eq!(to_millis(45_000, tb), 500);
        assert_eq!(from_millis(500, tb), 45_000);
    }

    #[test]
    fn rescale_rounds_to_nearest() {
        let tb = Rational::new(1, 3).expect("valid");
        // 1 tick of 1/3 s = 333.33.. ms, rounds to 333
        assert_eq!(to_millis(1, tb), 333);
        // 2 ticks = 666.66.. ms, rounds to 667
        assert_eq!(to_millis(2, tb), 667);
    }

    #[test]
    fn rescale_preserves_sign() {
        let tb = Rational::new(1, 48_000).expect("valid");
        assert_eq!(to_millis(-48_000, tb), -1000);
    }
}
