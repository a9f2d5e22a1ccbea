//! Selection score.
//!
//! `score = tier_base + min(20, value/100 * 20) + min(10, age_hours * 0.5) - retry_count * 2`

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::TaskRecord;

const VALUE_BONUS_MAX: f64 = 20.0;
const AGE_BONUS_MAX: f64 = 10.0;
const AGE_BONUS_PER_HOUR: f64 = 0.5;
const RETRY_PENALTY: f64 = 2.0;

pub fn selection_score(task: &TaskRecord, now: DateTime<Utc>) -> f64 {
    let value = task.estimated_value.clamp(0.0, 100.0);
    let value_bonus = (value / 100.0 * VALUE_BONUS_MAX).min(VALUE_BONUS_MAX);

    let age_hours = (now - task.added_at).num_seconds().max(0) as f64 / 3600.0;
    let age_bonus = (age_hours * AGE_BONUS_PER_HOUR).min(AGE_BONUS_MAX);

    task.priority_tier.base_score() + value_bonus + age_bonus
        - f64::from(task.retry_count) * RETRY_PENALTY
}

/// Pick the highest score; ties go to the earliest `added_at`.
pub fn pick_best<'a>(
    candidates: impl IntoIterator<Item = &'a TaskRecord>,
    now: DateTime<Utc>,
) -> Option<&'a TaskRecord> {
    candidates
        .into_iter()
        .map(|t| (selection_score(t, now), t))
        .max_by(|(sa, a), (sb, b)| {
            sa.partial_cmp(sb)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.added_at.cmp(&a.added_at))
        })
        .map(|(_, t)| t)
}
