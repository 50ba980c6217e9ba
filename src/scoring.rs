//! Scoring of a finished repeat.
//!
//! Per device, only the two best scoring hits count while every no-shoot hit
//! is charged. Each configured target with no hits at all costs
//! [`MISSED_TARGET_PENALTY`]. Totals are not clamped and may go negative.

use std::collections::{BTreeMap, BTreeSet};

use tokio::time::Instant;

use crate::types::{HitArea, ShotEvent, TargetConfig};

/// Scoring hits counted per device.
pub const BEST_HITS_PER_TARGET: usize = 2;

/// Points deducted for every configured target that was never hit.
pub const MISSED_TARGET_PENALTY: i32 = 10;

/// Point value of a single hit.
pub fn points(area: &HitArea) -> i32 {
    match area {
        HitArea::AZone | HitArea::CircleArea | HitArea::PopperZone => 5,
        HitArea::CZone => 3,
        HitArea::DZone => 2,
        HitArea::Miss => 0,
        HitArea::WhiteZone | HitArea::BlackZone => -10,
        HitArea::Other(_) => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreBreakdown {
    pub score: i32,
    pub missed_count: u32,
}

/// Score `shots` against the configured `targets`.
pub fn score(shots: &[ShotEvent], targets: &[TargetConfig]) -> ScoreBreakdown {
    let mut by_device: BTreeMap<Option<&str>, Vec<&HitArea>> = BTreeMap::new();
    for event in shots {
        by_device.entry(event.shot.source()).or_default().push(&event.shot.hit_area);
    }

    let mut total = 0;
    for areas in by_device.values() {
        let (no_shoot, mut scoring): (Vec<&HitArea>, Vec<&HitArea>) =
            areas.iter().copied().partition(|area| area.is_no_shoot());
        scoring.sort_by_key(|area| std::cmp::Reverse(points(area)));
        total += scoring.iter().take(BEST_HITS_PER_TARGET).map(|a| points(a)).sum::<i32>();
        total += no_shoot.iter().map(|a| points(a)).sum::<i32>();
    }

    let hit: BTreeSet<&str> = by_device.keys().flatten().copied().collect();
    let missed_count = targets
        .iter()
        .map(|t| t.target_name.as_str())
        .filter(|name| !name.is_empty())
        .collect::<BTreeSet<_>>()
        .difference(&hit)
        .count() as u32;

    ScoreBreakdown { score: total - missed_count as i32 * MISSED_TARGET_PENALTY, missed_count }
}

/// Sort shots by arrival and overwrite each `time_diff` with phone-side splits.
///
/// The first shot is measured from `beep`, every later one from the shot
/// before it. Arrivals before the beep count as zero.
pub fn recompute_time_diffs(shots: &mut [ShotEvent], beep: Instant) {
    shots.sort_by_key(|event| event.received_at);
    let mut previous = beep;
    for event in shots.iter_mut() {
        event.shot.time_diff = event.received_at.saturating_duration_since(previous).as_secs_f64();
        previous = event.received_at.max(previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::shot_event;
    use proptest::prelude::*;
    use std::time::Duration;

    fn targets(names: &[&str]) -> Vec<TargetConfig> {
        names.iter().enumerate().map(|(i, n)| TargetConfig::new(i as u32, *n, "ipsc")).collect()
    }

    fn hits(device: &str, areas: &[&str]) -> Vec<ShotEvent> {
        let at = Instant::now();
        areas.iter().map(|a| shot_event(device, a, 0.0, at)).collect()
    }

    #[test]
    fn point_table() {
        let cases = [
            ("azone", 5),
            ("CZone", 3),
            ("dzone", 2),
            ("circlearea", 5),
            ("popperzone", 5),
            ("miss", 0),
            ("whitezone", -10),
            (" BlackZone ", -10),
            ("border", 0),
        ];
        for (area, expected) in cases {
            assert_eq!(points(&HitArea::parse(area)), expected, "{area}");
        }
    }

    #[test]
    fn only_best_two_hits_count() {
        let result = score(&hits("D", &["azone", "azone", "czone"]), &targets(&["D"]));
        assert_eq!(result, ScoreBreakdown { score: 10, missed_count: 0 });
    }

    #[test]
    fn no_shoot_hits_are_uncapped() {
        let result = score(&hits("D", &["azone", "whitezone", "whitezone", "czone"]), &targets(&["D"]));
        assert_eq!(result.score, -12);
    }

    #[test]
    fn missed_targets_penalized_once_each() {
        let shots = hits("T1", &["azone", "azone", "azone", "azone", "azone"]);
        let result = score(&shots, &targets(&["T1", "T2", "T3"]));
        assert_eq!(result, ScoreBreakdown { score: 10 - 20, missed_count: 2 });
    }

    #[test]
    fn shots_from_unconfigured_devices_still_score() {
        let result = score(&hits("stray", &["czone"]), &targets(&["T1"]));
        assert_eq!(result, ScoreBreakdown { score: 3 - 10, missed_count: 1 });
    }

    #[test]
    fn no_shots_no_targets() {
        assert_eq!(score(&[], &[]), ScoreBreakdown { score: 0, missed_count: 0 });
    }

    #[test]
    fn time_diffs_become_arrival_splits() {
        let beep = Instant::now();
        let mut shots = vec![
            shot_event("A", "azone", 9.0, beep + Duration::from_millis(2900)),
            shot_event("A", "azone", 9.0, beep + Duration::from_millis(1000)),
            shot_event("B", "czone", 9.0, beep + Duration::from_millis(1300)),
        ];
        recompute_time_diffs(&mut shots, beep);
        let diffs: Vec<f64> = shots.iter().map(|s| s.shot.time_diff).collect();
        assert_eq!(diffs, vec![1.0, 0.3, 1.6]);
    }

    proptest! {
        #[test]
        fn score_ignores_shot_order(
            areas in prop::collection::vec(prop::sample::select(vec!["azone", "czone", "dzone", "miss", "whitezone"]), 0..12),
            seed in any::<u64>(),
        ) {
            let forward = hits("D", &areas);
            let mut shuffled = forward.clone();
            let len = shuffled.len().max(1);
            shuffled.rotate_left((seed as usize) % len);
            prop_assert_eq!(score(&forward, &targets(&["D"])), score(&shuffled, &targets(&["D"])));
        }

        #[test]
        fn each_no_shoot_costs_ten(extra in 0usize..6) {
            let mut areas = vec!["azone", "azone"];
            areas.extend(std::iter::repeat_n("blackzone", extra));
            let result = score(&hits("D", &areas), &targets(&["D"]));
            prop_assert_eq!(result.score, 10 - 10 * extra as i32);
        }
    }
}
