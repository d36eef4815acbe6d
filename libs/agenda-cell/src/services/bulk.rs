// libs/agenda-cell/src/services/bulk.rs
use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use crate::models::{AgendaConfig, AgendaError, BulkGenerateRequest, Slot};
use crate::services::grid::generate_day;

/// Calendar days of the range that pass the weekend filters.
pub fn included_days(request: &BulkGenerateRequest) -> Result<Vec<NaiveDate>, AgendaError> {
    if request.date_from > request.date_to {
        return Err(AgendaError::InvalidDateRange {
            from: request.date_from,
            to: request.date_to,
        });
    }

    let days = request
        .date_from
        .iter_days()
        .take_while(|day| *day <= request.date_to)
        .filter(|day| match day.weekday() {
            Weekday::Sat => request.include_saturday,
            Weekday::Sun => request.include_sunday,
            _ => true,
        })
        .collect();

    Ok(days)
}

/// New slots for every included day of the range. Times that already have a
/// slot document for the professional, open or closed, are left alone.
pub fn generate_bulk(
    professional_id: &str,
    center_id: &str,
    request: &BulkGenerateRequest,
    config: &AgendaConfig,
    existing: &[Slot],
) -> Result<Vec<Slot>, AgendaError> {
    let taken: HashSet<(NaiveDate, NaiveTime)> = existing
        .iter()
        .filter(|s| s.professional_id == professional_id)
        .map(|s| (s.date, s.time))
        .collect();

    let mut created = Vec::new();
    for day in included_days(request)? {
        let fresh = generate_day(day, professional_id, center_id, config)?
            .into_iter()
            .filter(|slot| !taken.contains(&(slot.date, slot.time)));
        created.extend(fresh);
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlotStatus;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn request(from: &str, to: &str, saturday: bool, sunday: bool) -> BulkGenerateRequest {
        BulkGenerateRequest {
            date_from: date(from),
            date_to: date(to),
            include_saturday: saturday,
            include_sunday: sunday,
        }
    }

    #[test]
    fn weekday_filter_keeps_five_days() {
        // 2024-09-02 is a Monday
        let config = AgendaConfig::new(30, "09:00", "10:00").unwrap();
        let slots = generate_bulk("p1", "c1", &request("2024-09-02", "2024-09-08", false, false), &config, &[])
            .unwrap();

        let days: HashSet<_> = slots.iter().map(|s| s.date).collect();
        assert_eq!(days.len(), 5);
        assert_eq!(slots.len(), 10);
        assert!(!days.contains(&date("2024-09-07")));
        assert!(!days.contains(&date("2024-09-08")));
    }

    #[test]
    fn weekend_days_follow_their_flags() {
        let days = included_days(&request("2024-09-02", "2024-09-08", true, false)).unwrap();
        assert_eq!(days.len(), 6);
        assert!(days.contains(&date("2024-09-07")));

        let days = included_days(&request("2024-09-07", "2024-09-08", false, true)).unwrap();
        assert_eq!(days, vec![date("2024-09-08")]);
    }

    #[test]
    fn existing_slots_are_not_duplicated() {
        let config = AgendaConfig::new(30, "09:00", "10:00").unwrap();
        let first = generate_bulk("p1", "c1", &request("2024-09-02", "2024-09-02", false, false), &config, &[])
            .unwrap();

        let mut existing = first[..1].to_vec();
        existing[0].status = SlotStatus::Booked;
        existing[0].patient_name = Some("Ana".into());

        let second = generate_bulk(
            "p1",
            "c1",
            &request("2024-09-02", "2024-09-02", false, false),
            &config,
            &existing,
        )
        .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].time_label(), "09:30");
    }

    #[test]
    fn inverted_range_fails() {
        let config = AgendaConfig::new(30, "09:00", "10:00").unwrap();
        let result = generate_bulk("p1", "c1", &request("2024-09-05", "2024-09-02", true, true), &config, &[]);
        assert_eq!(
            result.unwrap_err(),
            AgendaError::InvalidDateRange { from: date("2024-09-05"), to: date("2024-09-02") }
        );
    }
}
