use std::time::Duration;

use rand::Rng;

/// 任何两次检查之间的最小间隔。
pub const CHECK_FLOOR: Duration = Duration::from_secs(60 * 60);
/// 缺段重试的退避基数。
pub const RETRY_BACKOFF_BASE: Duration = Duration::from_secs(15 * 60);

const DAY: u64 = 24 * 60 * 60;
const SIX_HOURS: u64 = 6 * 60 * 60;

/// 按文件年龄给出下一次检查间隔（年龄分档策略）。
///
/// # 契约说明（What）
/// - `age < 7d`：间隔 = `min(age, 6h)`：新文件被频繁复查，缺文多发生在
///   发布后的最初几天；
/// - `7d ≤ age < 30d`：间隔 = 24h；
/// - `age ≥ 30d`：间隔 = 90d ± 至多 7d 的抖动，错开老文件的检查洪峰；
/// - 全局下限 1h。
pub fn next_check_interval(age_secs: i64, rng: &mut impl Rng) -> Duration {
    let age = age_secs.max(0) as u64;
    let interval = if age < 7 * DAY {
        age.min(SIX_HOURS)
    } else if age < 30 * DAY {
        DAY
    } else {
        let jitter = rng.gen_range(0..=7 * DAY);
        if rng.gen_bool(0.5) {
            (90 * DAY).saturating_add(jitter)
        } else {
            (90 * DAY).saturating_sub(jitter)
        }
    };
    Duration::from_secs(interval.max(CHECK_FLOOR.as_secs()))
}

/// 由发布日期推导下一次检查的绝对时刻（Unix 秒）。
///
/// 没有发布日期的记录在接下来 24h 内随机铺开，避免同步惊群。
pub fn schedule_from_release(
    now_unix: i64,
    release_date: Option<i64>,
    rng: &mut impl Rng,
) -> i64 {
    match release_date {
        Some(release) => {
            let interval = next_check_interval(now_unix - release, rng);
            now_unix + interval.as_secs() as i64
        }
        None => now_unix + rng.gen_range(0..DAY) as i64,
    }
}

/// 缺段重试的指数退避：`15 min * 2^retry_count`。
pub fn retry_backoff(retry_count: u32) -> Duration {
    RETRY_BACKOFF_BASE.saturating_mul(1u32 << retry_count.min(16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn three_day_old_file_checks_within_six_hours() {
        let interval = next_check_interval(3 * DAY as i64, &mut rng());
        assert!(interval <= Duration::from_secs(SIX_HOURS));
        assert!(interval >= CHECK_FLOOR);
    }

    #[test]
    fn fresh_file_respects_the_floor() {
        let interval = next_check_interval(60, &mut rng());
        assert_eq!(interval, CHECK_FLOOR);
    }

    #[test]
    fn mid_age_file_checks_daily() {
        let interval = next_check_interval(10 * DAY as i64, &mut rng());
        assert_eq!(interval, Duration::from_secs(DAY));
    }

    #[test]
    fn old_file_lands_in_ninety_day_window() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let interval = next_check_interval(45 * DAY as i64, &mut rng);
            assert!(interval >= Duration::from_secs(83 * DAY));
            assert!(interval <= Duration::from_secs(97 * DAY));
        }
    }

    #[test]
    fn unknown_release_date_spreads_over_a_day() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let at = schedule_from_release(1_000_000, None, &mut rng);
            assert!(at >= 1_000_000);
            assert!(at < 1_000_000 + DAY as i64);
        }
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(retry_backoff(0), Duration::from_secs(900));
        assert_eq!(retry_backoff(1), Duration::from_secs(1800));
        assert_eq!(retry_backoff(3), Duration::from_secs(7200));
    }
}
