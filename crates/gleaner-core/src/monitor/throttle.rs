//! Human-looking pacing between navigations.
//!
//! Each navigation is followed by a pause drawn uniformly from the
//! *effective range*. Every `session_page_limit` navigations a long cooldown
//! is taken instead and the counter resets.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlePolicy {
    pub base_min: Duration,
    pub base_max: Duration,
    pub session_page_limit: u32,
    pub cooldown_min: Duration,
    pub cooldown_max: Duration,
    /// Latency at which the latency factor reaches its ceiling of 2.
    pub latency_reference: Duration,
    /// EWMA weight of the newest latency sample.
    pub latency_smoothing: f64,
    pub night_multiplier: f64,
    pub peak_multiplier: f64,
    /// Offset applied to the clock before taking the hour of day.
    pub utc_offset_minutes: i32,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            base_min: Duration::from_secs(4),
            base_max: Duration::from_secs(9),
            session_page_limit: 40,
            cooldown_min: Duration::from_secs(60),
            cooldown_max: Duration::from_secs(180),
            latency_reference: Duration::from_secs(5),
            latency_smoothing: 0.3,
            night_multiplier: 1.5,
            peak_multiplier: 1.2,
            utc_offset_minutes: 0,
        }
    }
}

impl ThrottlePolicy {
    /// Every pause is zero. Useful for offline replays.
    pub fn none() -> Self {
        Self {
            base_min: Duration::ZERO,
            base_max: Duration::ZERO,
            session_page_limit: 0,
            cooldown_min: Duration::ZERO,
            cooldown_max: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Scale the base range by time of day and recent latency.
///
/// - night hours (00:00–05:59): ×`night_multiplier`
/// - business peak (09:00–17:59): ×`peak_multiplier`
/// - latency factor: `1 + min(1, recent_latency / latency_reference)`
pub fn adaptive_range(
    policy: &ThrottlePolicy,
    hour: u32,
    recent_latency: Option<Duration>,
) -> (Duration, Duration) {
    let time_factor = match hour {
        0..=5 => policy.night_multiplier,
        9..=17 => policy.peak_multiplier,
        _ => 1.0,
    };
    let latency_factor = match recent_latency {
        Some(latency) if !policy.latency_reference.is_zero() => {
            let ratio = latency.as_secs_f64() / policy.latency_reference.as_secs_f64();
            1.0 + ratio.min(1.0)
        }
        _ => 1.0,
    };
    let factor = (time_factor * latency_factor).max(0.0);
    let lo = policy.base_min.mul_f64(factor);
    let hi = policy.base_max.mul_f64(factor).max(lo);
    (lo, hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    /// Ordinary inter-page delay.
    Page(Duration),
    /// Long break after `session_page_limit` navigations.
    Cooldown(Duration),
}

impl Pause {
    pub fn duration(self) -> Duration {
        match self {
            Pause::Page(d) | Pause::Cooldown(d) => d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Throttle {
    policy: ThrottlePolicy,
    navigations: u32,
    latency_ewma: Option<f64>,
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            navigations: 0,
            latency_ewma: None,
        }
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    /// Feed one executor call duration into the EWMA.
    pub fn record_latency(&mut self, latency: Duration) {
        let sample = latency.as_secs_f64();
        let alpha = self.policy.latency_smoothing.clamp(0.0, 1.0);
        self.latency_ewma = Some(match self.latency_ewma {
            Some(prev) => alpha * sample + (1.0 - alpha) * prev,
            None => sample,
        });
    }

    pub fn recent_latency(&self) -> Option<Duration> {
        self.latency_ewma.map(Duration::from_secs_f64)
    }

    pub fn effective_range(&self, now: DateTime<Utc>) -> (Duration, Duration) {
        let local = now + chrono::Duration::minutes(i64::from(self.policy.utc_offset_minutes));
        adaptive_range(&self.policy, local.hour(), self.recent_latency())
    }

    /// Count one navigation and pick the pause that follows it.
    pub fn next_pause<R: Rng + ?Sized>(&mut self, now: DateTime<Utc>, rng: &mut R) -> Pause {
        self.navigations += 1;
        let limit = self.policy.session_page_limit;
        if limit > 0 && self.navigations >= limit {
            self.navigations = 0;
            return Pause::Cooldown(uniform(
                self.policy.cooldown_min,
                self.policy.cooldown_max,
                rng,
            ));
        }
        let (lo, hi) = self.effective_range(now);
        Pause::Page(uniform(lo, hi, rng))
    }
}

fn uniform<R: Rng + ?Sized>(lo: Duration, hi: Duration, rng: &mut R) -> Duration {
    if hi <= lo {
        return lo;
    }
    let secs = rng.gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
    Duration::from_secs_f64(secs).clamp(lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    fn policy() -> ThrottlePolicy {
        ThrottlePolicy {
            base_min: Duration::from_secs(2),
            base_max: Duration::from_secs(4),
            ..ThrottlePolicy::default()
        }
    }

    #[rstest]
    #[case(3, 1.5)]
    #[case(7, 1.0)]
    #[case(12, 1.2)]
    #[case(18, 1.0)]
    #[case(23, 1.0)]
    fn time_of_day_scales_range(#[case] hour: u32, #[case] factor: f64) {
        let (lo, hi) = adaptive_range(&policy(), hour, None);
        assert_eq!(lo, Duration::from_secs(2).mul_f64(factor));
        assert_eq!(hi, Duration::from_secs(4).mul_f64(factor));
    }

    #[test]
    fn latency_factor_is_capped_at_two() {
        let p = policy();
        let (lo, _) = adaptive_range(&p, 7, Some(Duration::from_millis(2500)));
        assert_eq!(lo, Duration::from_secs(3));

        let (lo, hi) = adaptive_range(&p, 7, Some(Duration::from_secs(60)));
        assert_eq!(lo, Duration::from_secs(4));
        assert_eq!(hi, Duration::from_secs(8));
    }

    #[test]
    fn long_cooldown_every_session_page_limit() {
        let mut throttle = Throttle::new(ThrottlePolicy {
            session_page_limit: 3,
            ..policy()
        });
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let pauses: Vec<Pause> = (0..6).map(|_| throttle.next_pause(now, &mut rng)).collect();
        let cooldowns: Vec<usize> = pauses
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, Pause::Cooldown(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(cooldowns, vec![2, 5]);

        for p in pauses {
            match p {
                Pause::Page(d) => assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(4)),
                Pause::Cooldown(d) => {
                    assert!(d >= Duration::from_secs(60) && d <= Duration::from_secs(180))
                }
            }
        }
    }

    #[test]
    fn latency_is_smoothed() {
        let mut throttle = Throttle::new(policy());
        throttle.record_latency(Duration::from_secs(10));
        throttle.record_latency(Duration::from_secs(0));
        let recent = throttle.recent_latency().unwrap().as_secs_f64();
        assert!((recent - 7.0).abs() < 1e-9);
    }

    #[test]
    fn none_policy_never_waits() {
        let mut throttle = Throttle::new(ThrottlePolicy::none());
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(throttle.next_pause(now, &mut rng).duration(), Duration::ZERO);
        }
    }
}
