use chrono::{Duration, NaiveDate, NaiveTime};

use crate::models::{AgendaConfig, AgendaError, Slot, SlotKey, SlotOrigin, SLOT_TIME_FORMAT};

/// Fixed day the cursor runs on, so stepping never depends on the real calendar.
fn reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// Start times of the day's grid: from `start_time` in `slot_duration` steps,
/// strictly before `end_time`.
pub fn grid_times(config: &AgendaConfig) -> Result<Vec<NaiveTime>, AgendaError> {
    if config.slot_duration == 0 {
        return Err(AgendaError::InvalidDuration(0));
    }
    if config.start_time >= config.end_time {
        return Err(AgendaError::InvalidRange {
            start: config.start_time.format(SLOT_TIME_FORMAT).to_string(),
            end: config.end_time.format(SLOT_TIME_FORMAT).to_string(),
        });
    }

    let step = Duration::minutes(i64::from(config.slot_duration));
    let end = reference_date().and_time(config.end_time);
    let mut cursor = reference_date().and_time(config.start_time);
    let mut times = Vec::new();

    while cursor < end {
        times.push(cursor.time());
        cursor += step;
    }

    Ok(times)
}

/// Generates the ordered available slots for one professional on one day.
pub fn generate_day(
    date: NaiveDate,
    professional_id: &str,
    center_id: &str,
    config: &AgendaConfig,
) -> Result<Vec<Slot>, AgendaError> {
    let slots = grid_times(config)?
        .into_iter()
        .map(|time| {
            let key = SlotKey {
                center_id: center_id.to_string(),
                professional_id: professional_id.to_string(),
                date,
                time,
            };
            Slot::available(&key, SlotOrigin::Generated)
        })
        .collect();

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn labels(config: &AgendaConfig) -> Vec<String> {
        grid_times(config)
            .unwrap()
            .into_iter()
            .map(|t| t.format(SLOT_TIME_FORMAT).to_string())
            .collect()
    }

    #[test]
    fn twenty_minute_grid_excludes_end_time() {
        let config = AgendaConfig::new(20, "08:00", "09:00").unwrap();
        assert_eq!(labels(&config), vec!["08:00", "08:20", "08:40"]);
    }

    #[test]
    fn non_dividing_duration_stops_before_end() {
        let config = AgendaConfig::new(25, "08:00", "09:00").unwrap();
        // 08:50 starts before 09:00 and is emitted; nothing at or past 09:00
        assert_eq!(labels(&config), vec!["08:00", "08:25", "08:50"]);

        let config = AgendaConfig::new(45, "09:00", "10:00").unwrap();
        assert_eq!(labels(&config), vec!["09:00", "09:45"]);
    }

    #[test]
    fn grid_ending_at_midnight_does_not_wrap() {
        let config = AgendaConfig {
            slot_duration: 30,
            start_time: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
        };
        assert_eq!(labels(&config), vec!["23:00", "23:30"]);
    }

    #[test]
    fn zero_duration_and_inverted_range_are_rejected() {
        let mut config = AgendaConfig::new(30, "08:00", "12:00").unwrap();
        config.slot_duration = 0;
        assert_eq!(grid_times(&config), Err(AgendaError::InvalidDuration(0)));

        config.slot_duration = 30;
        config.end_time = config.start_time;
        assert!(matches!(grid_times(&config), Err(AgendaError::InvalidRange { .. })));
    }

    #[test]
    fn regenerating_a_day_yields_identical_unique_ids() {
        let config = AgendaConfig::new(15, "08:00", "13:00").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();

        let first = generate_day(date, "p1", "c1", &config).unwrap();
        let second = generate_day(date, "p1", "c1", &config).unwrap();

        let first_ids: Vec<_> = first.iter().map(|s| s.id.clone()).collect();
        let second_ids: Vec<_> = second.iter().map(|s| s.id.clone()).collect();
        assert_eq!(first_ids, second_ids);

        let unique: HashSet<_> = first_ids.iter().collect();
        assert_eq!(unique.len(), first_ids.len());
        assert_eq!(first.len(), 20);
        assert!(first.iter().all(|s| s.is_open() && s.patient_name.is_none()));
        assert!(first.windows(2).all(|w| w[0].time < w[1].time));
    }
}
