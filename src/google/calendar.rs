//! Calendar capability — calendar lookup and event list/delete/patch.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Method;
use serde::Deserialize;

use crate::error::RemoteError;
use crate::google::http::{GoogleHttp, encode_path_segment};

const SERVICE: &str = "calendar";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CalendarSummary {
    pub id: String,
    #[serde(default)]
    pub summary: String,
}

/// All-day `date` or timed `dateTime`, as the API sends them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    pub date: Option<String>,
    pub date_time: Option<String>,
}

impl EventTime {
    pub fn all_day(date: &str) -> Self {
        Self {
            date: Some(date.to_string()),
            date_time: None,
        }
    }

    pub fn timed(date_time: &str) -> Self {
        Self {
            date: None,
            date_time: Some(date_time.to_string()),
        }
    }

    /// `dateTime` when present, else `date`.
    pub fn display(&self) -> Option<&str> {
        self.date_time.as_deref().or(self.date.as_deref())
    }
}

/// Read-only view of a calendar event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub start: EventTime,
    /// Set on instances of a recurring series.
    pub original_start_time: Option<EventTime>,
}

impl CalendarEvent {
    /// When this occurrence was scheduled: the instance's original start,
    /// falling back to its current start.
    pub fn occurrence(&self) -> Option<&str> {
        self.original_start_time
            .as_ref()
            .and_then(EventTime::display)
            .or_else(|| self.start.display())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

// ── Capability trait ────────────────────────────────────────────────

/// Operations the reconciler needs from the calendar service.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn list_calendars(&self) -> Result<Vec<CalendarSummary>, RemoteError>;

    /// Events overlapping `[time_min, time_max]`, recurring series expanded
    /// into one entry per occurrence.
    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RemoteError>;

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), RemoteError>;

    /// Change the title only; every other field is left untouched.
    async fn patch_event_summary(
        &self,
        calendar_id: &str,
        event_id: &str,
        summary: &str,
    ) -> Result<(), RemoteError>;
}

// ── HTTP adapter ────────────────────────────────────────────────────

/// Calendar v3 REST adapter.
pub struct GoogleCalendarClient {
    http: GoogleHttp,
    base_url: String,
}

impl GoogleCalendarClient {
    pub fn new(http: GoogleHttp, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn event_url(&self, calendar_id: &str, event_id: &str) -> String {
        format!(
            "{}/calendars/{}/events/{}",
            self.base_url,
            encode_path_segment(calendar_id),
            encode_path_segment(event_id)
        )
    }
}

#[async_trait]
impl CalendarApi for GoogleCalendarClient {
    async fn list_calendars(&self) -> Result<Vec<CalendarSummary>, RemoteError> {
        let url = format!("{}/users/me/calendarList", self.base_url);
        let mut calendars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self.http.request(Method::GET, &url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }
            let page: ListPage<CalendarSummary> =
                self.http.send_json(SERVICE, "calendarList", request).await?;
            calendars.extend(page.items);

            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(calendars);
            }
        }
    }

    async fn list_events(
        &self,
        calendar_id: &str,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, RemoteError> {
        let url = format!(
            "{}/calendars/{}/events",
            self.base_url,
            encode_path_segment(calendar_id)
        );
        let time_min = time_min.to_rfc3339_opts(SecondsFormat::Secs, true);
        let time_max = time_max.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeMin", time_min.as_str()),
                ("timeMax", time_max.as_str()),
                ("singleEvents", "true"),
                ("orderBy", "startTime"),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.as_str()));
            }
            let request = self.http.request(Method::GET, &url).query(&query);
            let page: ListPage<CalendarEvent> = self
                .http
                .send_json(SERVICE, &format!("events of {calendar_id}"), request)
                .await?;
            events.extend(page.items);

            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(events);
            }
        }
    }

    async fn delete_event(&self, calendar_id: &str, event_id: &str) -> Result<(), RemoteError> {
        let request = self
            .http
            .request(Method::DELETE, &self.event_url(calendar_id, event_id));
        self.http
            .send_empty(SERVICE, &format!("event {event_id}"), request)
            .await
    }

    async fn patch_event_summary(
        &self,
        calendar_id: &str,
        event_id: &str,
        summary: &str,
    ) -> Result<(), RemoteError> {
        let request = self
            .http
            .request(Method::PATCH, &self.event_url(calendar_id, event_id))
            .json(&serde_json::json!({ "summary": summary }));
        self.http
            .send_empty(SERVICE, &format!("event {event_id}"), request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrence_prefers_original_start() {
        let event: CalendarEvent = serde_json::from_str(
            r#"{
                "id": "series_20261105",
                "summary": "Pay AT&T",
                "start": {"date": "2026-11-07"},
                "originalStartTime": {"date": "2026-11-05"}
            }"#,
        )
        .unwrap();
        assert_eq!(event.occurrence(), Some("2026-11-05"));
    }

    #[test]
    fn occurrence_falls_back_to_start() {
        let event = CalendarEvent {
            id: "e1".into(),
            summary: "Pay AT&T".into(),
            start: EventTime::timed("2026-10-20T09:00:00-07:00"),
            original_start_time: None,
        };
        assert_eq!(event.occurrence(), Some("2026-10-20T09:00:00-07:00"));
    }

    #[test]
    fn list_page_tolerates_missing_items() {
        let page: ListPage<CalendarEvent> = serde_json::from_str(r#"{"kind":"x"}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
