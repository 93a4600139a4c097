//! Per-name rate limiting of sector updates.
//!
//! Every name owns a bucket of sectors that refills at one sector per
//! [`seconds_per_sector`](TimebankConfig::seconds_per_sector) up to
//! [`sector_updates_per_period`](TimebankConfig::sector_updates_per_period). An update spends one
//! sector from the bucket for every sector it adds. The bucket level left after an update is
//! stored in [`Header::timebank`](crate::types::header::Header::timebank).

use crate::{config::TimebankConfig, types::data_types::SECTOR_COUNT};

/// Returned by [`check_timebank`] when the update must be rejected.
pub const REJECTED: i32 = -1;

/// Evaluate the timebank for an update that adds `sectors_needed` sectors at `now`.
///
/// `prev_update_time` is when the name's last update was accepted (`None` for a name with no
/// header yet, whose bucket starts full) and `prev_timebank` the bucket level it left behind.
/// Returns the new bucket level, or [`REJECTED`].
pub fn check_timebank(
    config: &TimebankConfig,
    prev_update_time: Option<u64>,
    prev_timebank: i32,
    sectors_needed: u16,
    now: u64,
) -> i32 {
    if sectors_needed == 0 || sectors_needed > SECTOR_COUNT {
        return REJECTED;
    }

    let capacity = config.sector_updates_per_period() as i64;
    let available = match prev_update_time {
        None => capacity,
        Some(prev) => {
            let seconds_since = now.saturating_sub(prev);
            if seconds_since < config.min_update_interval.as_secs() {
                return REJECTED;
            }
            let refill = match config.seconds_per_sector() {
                0 => capacity,
                per_sector => (seconds_since / per_sector) as i64,
            };
            capacity.min(prev_timebank.max(0) as i64 + refill)
        }
    };

    let needed = sectors_needed as i64;
    if needed > available {
        return REJECTED;
    }
    (available - needed) as i32
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const HOUR: u64 = 60 * 60;
    const NOW: u64 = 1_700_000_000;

    #[test]
    fn half_a_period_refills_half_the_bucket() {
        let config = TimebankConfig::default();
        assert_eq!(config.seconds_per_sector(), 337);
        assert_eq!(check_timebank(&config, Some(NOW - 24 * HOUR), 0, 100, NOW), 156);
    }

    #[test]
    fn twelve_idle_hours_cover_a_hundred_sectors() {
        let config = TimebankConfig::default();
        // 43200 / 337 = 128 sectors refilled.
        assert_eq!(check_timebank(&config, Some(NOW - 12 * HOUR), 0, 100, NOW), 28);
        assert_eq!(check_timebank(&config, Some(NOW - 12 * HOUR), 0, 129, NOW), REJECTED);
    }

    #[test]
    fn updates_inside_the_minimum_interval_are_rejected() {
        let config = TimebankConfig::default();
        assert_eq!(check_timebank(&config, Some(NOW - 60), 512, 1, NOW), REJECTED);
        assert_eq!(check_timebank(&config, Some(NOW - 120), 512, 1, NOW), 511);
    }

    #[test]
    fn an_empty_bucket_rejects_large_updates() {
        let config = TimebankConfig::default();
        // One hour refills 10 sectors.
        assert_eq!(check_timebank(&config, Some(NOW - HOUR), 0, 100, NOW), REJECTED);
        assert_eq!(check_timebank(&config, Some(NOW - HOUR), 0, 10, NOW), 0);
    }

    #[test]
    fn the_bucket_never_exceeds_its_capacity() {
        let config = TimebankConfig::default();
        assert_eq!(check_timebank(&config, Some(NOW - 1000 * HOUR), 400, 256, NOW), 256);
        assert_eq!(check_timebank(&config, None, 0, 256, NOW), 256);
    }

    #[test]
    fn sector_counts_outside_one_to_256_are_rejected() {
        let config = TimebankConfig::default();
        assert_eq!(check_timebank(&config, None, 0, 0, NOW), REJECTED);
        assert_eq!(check_timebank(&config, None, 0, 257, NOW), REJECTED);
    }

    #[test]
    fn the_period_is_configurable() {
        let config = TimebankConfig {
            timebank_duration: Duration::from_secs(512),
            min_update_interval: Duration::ZERO,
            full_updates_per_period: 1,
        };
        assert_eq!(config.seconds_per_sector(), 2);
        assert_eq!(check_timebank(&config, Some(NOW - 20), 0, 10, NOW), 0);
        assert_eq!(check_timebank(&config, Some(NOW - 20), 0, 11, NOW), REJECTED);
    }
}
