use crate::config::ReconcileConfig;
use crate::model::{Event, EventTime};
use crate::normalize::{content_tokens, dice};

/// How closely a candidate resembles an existing event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventScore {
    pub text: f64,
    pub temporal: f64,
    pub combined: f64,
}

pub fn text_similarity(a: &str, b: &str) -> f64 {
    dice(&content_tokens(a), &content_tokens(b))
}

/// 1.0 for overlapping intervals, falling linearly to 0 at the configured
/// window. A missing time on either side scores the neutral value.
pub fn temporal_proximity(
    a: Option<&EventTime>,
    b: Option<&EventTime>,
    config: &ReconcileConfig,
) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => {
            if a.overlaps(b) {
                return 1.0;
            }
            if config.temporal_window_days <= 0 {
                return 0.0;
            }
            let gap = a.gap_days(b) as f64;
            (1.0 - gap / config.temporal_window_days as f64).max(0.0)
        }
        _ => config.unknown_time_score,
    }
}

pub fn score(
    description: &str,
    event_time: Option<&EventTime>,
    existing: &Event,
    config: &ReconcileConfig,
) -> EventScore {
    let text = text_similarity(description, &existing.description);
    let temporal = temporal_proximity(event_time, existing.event_time.as_ref(), config);
    EventScore {
        text,
        temporal,
        combined: config.text_weight * text + config.time_weight * temporal,
    }
}

/// Index of the existing event a candidate should merge into, if any.
///
/// A match needs a combined score strictly above the merge threshold and a
/// text score at or above the floor. Among equal scores the event with more
/// provenance wins, then the one inserted first.
pub fn best_match(
    description: &str,
    event_time: Option<&EventTime>,
    existing: &[Event],
    config: &ReconcileConfig,
) -> Option<(usize, EventScore)> {
    let mut best: Option<(usize, EventScore)> = None;

    for (index, event) in existing.iter().enumerate() {
        let s = score(description, event_time, event, config);
        if s.combined <= config.merge_threshold || s.text < config.text_floor {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_index, best_score)) => {
                let current = &existing[best_index];
                if s.combined != best_score.combined {
                    s.combined > best_score.combined
                } else if event.provenance.len() != current.provenance.len() {
                    event.provenance.len() > current.provenance.len()
                } else {
                    event.seq < current.seq
                }
            }
        };
        if better {
            best = Some((index, s));
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventDetails, EventId, Provenance, TopicId};
    use chrono::{NaiveDate, TimeZone, Utc};

    fn event(description: &str, time: Option<EventTime>, seq: i64, sources: usize) -> Event {
        let report_time = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        Event {
            id: EventId::generate(),
            topic_id: TopicId::from("t-1"),
            description: description.into(),
            event_time: time,
            report_time,
            confidence: 0.8,
            details: EventDetails::default(),
            provenance: (0..sources)
                .map(|i| Provenance {
                    article_id: format!("a-{}", i),
                    report_time,
                })
                .collect(),
            created_at: report_time,
            seq,
            merged_into: None,
        }
    }

    #[test]
    fn test_city_council_scores_above_threshold() {
        let config = ReconcileConfig::default();
        let text = text_similarity(
            "City council approved the annual budget",
            "City council budget vote approved",
        );
        assert!((text - 0.8).abs() < 1e-9);

        let existing = vec![event(
            "City council approved the annual budget",
            EventTime::month(2024, 1),
            1,
            1,
        )];
        let january = EventTime::month(2024, 1);
        let (index, s) = best_match(
            "City council budget vote approved",
            january.as_ref(),
            &existing,
            &config,
        )
        .unwrap();
        assert_eq!(index, 0);
        assert!((s.combined - 0.86).abs() < 1e-9);
    }

    #[test]
    fn test_temporal_decay() {
        let config = ReconcileConfig::default();
        let jan_1 = EventTime::day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(temporal_proximity(Some(&jan_1), Some(&jan_1), &config), 1.0);

        let jan_32 = EventTime::day(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(temporal_proximity(Some(&jan_1), Some(&jan_32), &config), 0.0);

        let far = EventTime::year(2020).unwrap();
        assert_eq!(temporal_proximity(Some(&jan_1), Some(&far), &config), 0.0);
        assert_eq!(temporal_proximity(None, Some(&jan_1), &config), 0.5);
    }

    #[test]
    fn test_dissimilar_events_do_not_match() {
        let config = ReconcileConfig::default();
        let existing = vec![event("Mayor resigned after scandal", EventTime::year(2023), 1, 1)];
        let time = EventTime::month(2024, 6);
        assert!(best_match("Library renovation completed", time.as_ref(), &existing, &config).is_none());
    }

    #[test]
    fn test_tie_breaks() {
        let config = ReconcileConfig::default();
        let time = EventTime::month(2024, 1);
        let existing = vec![
            event("Council approved budget", time, 1, 1),
            event("Council approved budget", time, 2, 3),
            event("Council approved budget", time, 3, 3),
        ];
        let (index, _) = best_match("Council approved budget", time.as_ref(), &existing, &config).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn test_score_equal_to_threshold_does_not_merge() {
        let january = EventTime::month(2024, 1);
        let existing = vec![event(
            "City council approved the annual budget",
            january,
            1,
            1,
        )];
        let candidate = "City council budget vote approved";
        let combined = score(candidate, january.as_ref(), &existing[0], &ReconcileConfig::default()).combined;

        let at = ReconcileConfig {
            merge_threshold: combined,
            ..ReconcileConfig::default()
        };
        assert!(best_match(candidate, january.as_ref(), &existing, &at).is_none());

        let below = ReconcileConfig {
            merge_threshold: combined - 1e-6,
            ..ReconcileConfig::default()
        };
        assert!(best_match(candidate, january.as_ref(), &existing, &below).is_some());
    }
}
