//! Calendar reconciler — deletes or relabels pre-created bill reminders.
//!
//! The reconciler never creates events. It resolves the target calendar by
//! name, lists the month window (recurring series expanded into
//! occurrences), keeps events whose title starts with the effect's prefix,
//! and applies the effect to every one of them.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::google::calendar::{CalendarApi, CalendarEvent};
use crate::pipeline::types::Effect;

/// One event the reconciler changed (or found already in the target state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedEvent {
    pub event_id: String,
    pub summary: String,
    /// Scheduled date of this occurrence, not of the recurring series.
    pub occurrence: Option<String>,
}

impl AppliedEvent {
    fn from_event(event: &CalendarEvent) -> Self {
        Self {
            event_id: event.id.clone(),
            summary: event.summary.clone(),
            occurrence: event.occurrence().map(String::from),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub events: Vec<AppliedEvent>,
}

impl ReconcileOutcome {
    pub fn applied(&self) -> bool {
        !self.events.is_empty()
    }
}

/// First and last instant (UTC) of the month `month_offset` months after
/// the month containing `now`.
pub fn month_window(
    now: DateTime<Utc>,
    month_offset: u32,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let months = now.year() * 12 + now.month0() as i32 + month_offset as i32;
    let first = first_of_month(months)?;
    let next = first_of_month(months + 1)?;

    let start = Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?);
    let end = Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?) - Duration::seconds(1);
    Some((start, end))
}

/// Day one of the month counted as `year * 12 + month0`.
fn first_of_month(months: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(months.div_euclid(12), months.rem_euclid(12) as u32 + 1, 1)
}

pub struct CalendarReconciler {
    calendar: Arc<dyn CalendarApi>,
}

impl CalendarReconciler {
    pub fn new(calendar: Arc<dyn CalendarApi>) -> Self {
        Self { calendar }
    }

    pub async fn apply(
        &self,
        effect: &Effect,
        calendar_name: &str,
    ) -> Result<ReconcileOutcome, RemoteError> {
        self.apply_at(effect, calendar_name, Utc::now()).await
    }

    /// `apply` with an explicit clock.
    pub async fn apply_at(
        &self,
        effect: &Effect,
        calendar_name: &str,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, RemoteError> {
        let (title_prefix, month_offset, new_title) = match effect {
            Effect::DeleteEvents {
                title_prefix,
                month_offset,
            } => (title_prefix, *month_offset, None),
            Effect::PatchEvents {
                title_prefix,
                month_offset,
                new_title,
            } => (title_prefix, *month_offset, Some(new_title)),
            Effect::ArchiveArtifact { .. } => {
                debug!("Archive effect has no calendar target");
                return Ok(ReconcileOutcome::default());
            }
        };

        let Some(calendar_id) = self.resolve_calendar(calendar_name).await? else {
            warn!(calendar = calendar_name, "Calendar not found");
            return Ok(ReconcileOutcome::default());
        };

        let Some((time_min, time_max)) = month_window(now, month_offset) else {
            warn!(month_offset, "Month window out of range");
            return Ok(ReconcileOutcome::default());
        };

        let matching: Vec<CalendarEvent> = self
            .calendar
            .list_events(&calendar_id, time_min, time_max)
            .await?
            .into_iter()
            .filter(|e| e.summary.starts_with(title_prefix.as_str()))
            .collect();

        if matching.is_empty() {
            info!(
                calendar = calendar_name,
                prefix = %title_prefix,
                window_start = %time_min.date_naive(),
                "No matching reminders in window"
            );
            return Ok(ReconcileOutcome::default());
        }

        let mut outcome = ReconcileOutcome::default();
        for event in &matching {
            let applied = AppliedEvent::from_event(event);
            match new_title {
                None => {
                    self.calendar.delete_event(&calendar_id, &event.id).await?;
                    info!(
                        event_id = %event.id,
                        summary = %event.summary,
                        occurrence = applied.occurrence.as_deref().unwrap_or("unknown"),
                        "Deleted reminder"
                    );
                }
                Some(title) if event.summary == *title => {
                    debug!(event_id = %event.id, "Reminder already has target title");
                }
                Some(title) => {
                    self.calendar
                        .patch_event_summary(&calendar_id, &event.id, title)
                        .await?;
                    info!(
                        event_id = %event.id,
                        from = %event.summary,
                        to = %title,
                        occurrence = applied.occurrence.as_deref().unwrap_or("unknown"),
                        "Relabeled reminder"
                    );
                }
            }
            outcome.events.push(applied);
        }

        Ok(outcome)
    }

    /// Calendar id for an exact name match.
    async fn resolve_calendar(&self, name: &str) -> Result<Option<String>, RemoteError> {
        let calendars = self.calendar.list_calendars().await?;
        Ok(calendars
            .into_iter()
            .find(|c| c.summary == name)
            .map(|c| c.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::google::calendar::EventTime;
    use crate::testing::FakeCalendar;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 15, 30, 0).unwrap()
    }

    fn event(id: &str, summary: &str, date: &str) -> CalendarEvent {
        CalendarEvent {
            id: id.into(),
            summary: summary.into(),
            start: EventTime::all_day(date),
            original_start_time: None,
        }
    }

    fn delete(prefix: &str, month_offset: u32) -> Effect {
        Effect::DeleteEvents {
            title_prefix: prefix.into(),
            month_offset,
        }
    }

    #[test]
    fn window_covers_whole_month() {
        let (start, end) = month_window(at(2026, 10, 17), 0).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 10, 31, 23, 59, 59).unwrap());
    }

    #[test]
    fn window_rolls_over_year_end() {
        let (start, end) = month_window(at(2026, 12, 3), 1).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 31, 23, 59, 59).unwrap());

        let (_, feb_end) = month_window(at(2028, 1, 31), 1).unwrap();
        assert_eq!(feb_end, Utc.with_ymd_and_hms(2028, 2, 29, 23, 59, 59).unwrap());
    }

    #[tokio::test]
    async fn missing_calendar_is_not_applied() {
        let calendar = Arc::new(FakeCalendar::new("Personal"));
        let reconciler = CalendarReconciler::new(calendar.clone());

        let outcome = reconciler
            .apply_at(&delete("Pay AT&T", 0), "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert!(!outcome.applied());
        assert_eq!(calendar.calls().list_events, 0);
    }

    #[tokio::test]
    async fn deletes_every_match_in_window() {
        let calendar = Arc::new(FakeCalendar::new("Bills"));
        calendar.add_event(event("e1", "Pay AT&T", "2026-10-05")).await;
        calendar.add_event(event("e2", "Pay AT&T (copy)", "2026-10-06")).await;
        calendar.add_event(event("e3", "Pay Verizon", "2026-10-07")).await;
        calendar.add_event(event("e4", "Pay AT&T", "2026-11-05")).await;
        let reconciler = CalendarReconciler::new(calendar.clone());

        let outcome = reconciler
            .apply_at(&delete("Pay AT&T", 0), "Bills", at(2026, 10, 17))
            .await
            .unwrap();

        assert!(outcome.applied());
        let ids: Vec<_> = outcome.events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(calendar.event_ids().await, vec!["e3", "e4"]);
    }

    #[tokio::test]
    async fn month_offset_looks_ahead() {
        let calendar = Arc::new(FakeCalendar::new("Bills"));
        calendar.add_event(event("oct", "Pay Geico", "2026-10-09")).await;
        calendar.add_event(event("nov", "Pay Geico", "2026-11-09")).await;
        let reconciler = CalendarReconciler::new(calendar.clone());

        let outcome = reconciler
            .apply_at(&delete("Pay Geico", 1), "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert_eq!(outcome.events[0].event_id, "nov");
        assert_eq!(calendar.event_ids().await, vec!["oct"]);
    }

    #[tokio::test]
    async fn recurring_instance_reports_original_start() {
        let calendar = Arc::new(FakeCalendar::new("Bills"));
        calendar
            .add_event(CalendarEvent {
                id: "series_20261005".into(),
                summary: "Pay AT&T".into(),
                start: EventTime::all_day("2026-10-08"),
                original_start_time: Some(EventTime::all_day("2026-10-05")),
            })
            .await;
        let reconciler = CalendarReconciler::new(calendar.clone());

        let outcome = reconciler
            .apply_at(&delete("Pay AT&T", 0), "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert_eq!(outcome.events[0].occurrence.as_deref(), Some("2026-10-05"));
    }

    #[tokio::test]
    async fn patch_relabels_only_the_title() {
        let calendar = Arc::new(FakeCalendar::new("Bills"));
        calendar.add_event(event("p1", "Pay PG&E", "2026-11-12")).await;
        let reconciler = CalendarReconciler::new(calendar.clone());
        let effect = Effect::PatchEvents {
            title_prefix: "Pay PG&E".into(),
            month_offset: 1,
            new_title: "Pay PG&E $87.65".into(),
        };

        let outcome = reconciler
            .apply_at(&effect, "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert!(outcome.applied());
        let stored = calendar.event("p1").await.unwrap();
        assert_eq!(stored.summary, "Pay PG&E $87.65");
        assert_eq!(stored.start, EventTime::all_day("2026-11-12"));

        // Second run finds the event already relabeled.
        reconciler
            .apply_at(&effect, "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert_eq!(calendar.calls().patch_event, 1);
    }

    #[tokio::test]
    async fn no_matching_events_is_not_applied() {
        let calendar = Arc::new(FakeCalendar::new("Bills"));
        calendar.add_event(event("e1", "Dentist", "2026-10-05")).await;
        let reconciler = CalendarReconciler::new(calendar.clone());

        let outcome = reconciler
            .apply_at(&delete("Pay AT&T", 0), "Bills", at(2026, 10, 17))
            .await
            .unwrap();
        assert!(!outcome.applied());
        assert_eq!(calendar.calls().delete_event, 0);
    }
}
