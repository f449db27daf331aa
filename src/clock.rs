use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};


/// The single monotonic time source for the whole process. All absolute
/// fire-times in the deadline queue are nanoseconds since this origin.
fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Monotonic nanoseconds since the process origin.
pub fn now_nanos() -> i64 {
    origin().elapsed().as_nanos() as i64
}

/// Nanoseconds from `now_nanos` until `fire_at_nanos`. Signed subtraction
/// keeps the result correct across wrap for any bounded horizon; a
/// non-positive result means the fire-time has passed.
pub(crate) fn nanos_until(fire_at_nanos: i64, now_nanos: i64) -> i64 {
    fire_at_nanos.wrapping_sub(now_nanos)
}

/// A positive nanosecond count as a [`Duration`].
pub(crate) fn duration_from_nanos(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0) as u64)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let first = now_nanos();
        let second = now_nanos();
        assert!(second >= first);
    }

    #[test]
    fn nanos_until_is_signed() {
        assert_eq!(nanos_until(1_500, 1_000), 500);
        assert_eq!(nanos_until(1_000, 1_500), -500);
    }

    #[test]
    fn nanos_until_survives_wrap() {
        let near_max = i64::MAX - 100;
        let fire_at = near_max.wrapping_add(300);
        assert_eq!(nanos_until(fire_at, near_max), 300);
    }
}
