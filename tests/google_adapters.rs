//! HTTP adapter tests against a mock Google API served by axum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use bill_reconciler::error::RemoteError;
use bill_reconciler::google::calendar::{CalendarApi, GoogleCalendarClient};
use bill_reconciler::google::gmail::{GmailClient, MailboxApi};
use bill_reconciler::google::http::GoogleHttp;
use bill_reconciler::pipeline::history::{HistorySynchronizer, SyncOutcome};
use bill_reconciler::pipeline::types::HistoryId;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const TOKEN: &str = "ya29.test-token";

#[derive(Clone, Default)]
struct MockState {
    patches: Arc<Mutex<Vec<(String, String, Value)>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

// ── Mock Gmail ──────────────────────────────────────────────────────────

async fn history(Query(q): Query<HashMap<String, String>>) -> Response {
    let start: u64 = q
        .get("startHistoryId")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    if start < 100 {
        return (StatusCode::NOT_FOUND, "Requested entity was not found.").into_response();
    }
    if start == 503 {
        return (StatusCode::SERVICE_UNAVAILABLE, "backend error").into_response();
    }

    let page = match q.get("pageToken").map(String::as_str) {
        None => json!({
            "history": [
                {"id": "101", "messagesAdded": [{"message": {"id": "a", "threadId": "t1"}}]},
                {"id": "102", "messagesAdded": [{"message": {"id": "b", "threadId": "t2"}}]}
            ],
            "nextPageToken": "p2",
            "historyId": "104"
        }),
        Some("p2") => json!({
            "history": [
                {"id": "103", "messagesAdded": [{"message": {"id": "b", "threadId": "t2"}}]},
                {"id": "104", "messagesAdded": [{"message": {"id": "c", "threadId": "t3"}}]}
            ],
            "historyId": "104"
        }),
        Some(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    Json(page).into_response()
}

async fn profile(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    Json(json!({"emailAddress": "me@example.com", "historyId": "104"})).into_response()
}

async fn message(Path(id): Path<String>) -> Response {
    if id == "gone" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({
        "id": id,
        "threadId": "t1",
        "payload": {
            "mimeType": "text/plain",
            "headers": [{"name": "Subject", "value": "Withdrawal Notice"}],
            "body": {"data": "QVRUIGhhcyBpbml0aWF0ZWQ"}
        }
    }))
    .into_response()
}

// ── Mock Calendar ───────────────────────────────────────────────────────

async fn calendar_list(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    match q.get("pageToken") {
        None => Json(json!({
            "items": [{"id": "primary", "summary": "me@example.com"}],
            "nextPageToken": "c2"
        })),
        Some(_) => Json(json!({
            "items": [{"id": "bills@group.calendar.google.com", "summary": "Bills"}]
        })),
    }
}

async fn events(
    Path(calendar_id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let expanded = q.get("singleEvents").map(String::as_str) == Some("true");
    if calendar_id != "bills@group.calendar.google.com" || !expanded {
        return StatusCode::BAD_REQUEST.into_response();
    }
    Json(json!({
        "items": [
            {"id": "e1", "summary": "Pay PG&E", "start": {"date": "2026-11-12"}},
            {"id": "e2_20261105", "summary": "Pay AT&T", "start": {"dateTime": "2026-11-05T09:00:00-08:00"},
             "originalStartTime": {"dateTime": "2026-11-05T09:00:00-08:00"}}
        ]
    }))
    .into_response()
}

async fn patch_event(
    State(state): State<MockState>,
    Path((calendar_id, event_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state
        .patches
        .lock()
        .unwrap()
        .push((calendar_id, event_id.clone(), body));
    Json(json!({"id": event_id}))
}

async fn start_mock() -> (String, MockState) {
    let state = MockState::default();
    let app = Router::new()
        .route("/gmail/v1/users/me/history", get(history))
        .route("/gmail/v1/users/me/profile", get(profile))
        .route("/gmail/v1/users/me/messages/{id}", get(message))
        .route("/calendar/v3/users/me/calendarList", get(calendar_list))
        .route("/calendar/v3/calendars/{calendar_id}/events", get(events))
        .route(
            "/calendar/v3/calendars/{calendar_id}/events/{event_id}",
            patch(patch_event),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), state)
}

fn http() -> GoogleHttp {
    GoogleHttp::new(SecretString::from(TOKEN))
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn history_sync_follows_page_tokens() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_mock().await;
        let gmail = Arc::new(GmailClient::new(http(), format!("{base}/gmail/v1")));
        let sync = HistorySynchronizer::new(gmail);

        let outcome = sync.sync(HistoryId(100)).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Changes {
                new_message_ids: vec!["a".into(), "b".into(), "c".into()],
                has_changes: true,
            }
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn expired_history_is_baseline_loss() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_mock().await;
        let gmail = Arc::new(GmailClient::new(http(), format!("{base}/gmail/v1")));

        let outcome = HistorySynchronizer::new(gmail)
            .sync(HistoryId(5))
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::BaselineLost);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn server_errors_carry_status_and_body() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_mock().await;
        let gmail = GmailClient::new(http(), format!("{base}/gmail/v1"));

        let err = gmail.list_history(HistoryId(503), None).await.unwrap_err();
        match err {
            RemoteError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "backend error");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn message_fetch_and_not_found() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_mock().await;
        let gmail = GmailClient::new(http(), format!("{base}/gmail/v1"));

        let msg = gmail.get_message("m1").await.unwrap();
        assert_eq!(msg.subject(), "Withdrawal Notice");
        assert_eq!(msg.body_text(), "ATT has initiated");

        assert!(gmail.get_message("gone").await.unwrap_err().is_not_found());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bearer_token_is_sent() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_mock().await;

        let gmail = GmailClient::new(http(), format!("{base}/gmail/v1"));
        let profile = gmail.get_profile().await.unwrap();
        assert_eq!(profile.history_id, HistoryId(104));

        let wrong = GmailClient::new(
            GoogleHttp::new(SecretString::from("expired")),
            format!("{base}/gmail/v1"),
        );
        let err = wrong.get_profile().await.unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 401, .. }));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn calendar_list_events_and_patch() {
    timeout(TEST_TIMEOUT, async {
        let (base, state) = start_mock().await;
        let calendar = GoogleCalendarClient::new(http(), format!("{base}/calendar/v3"));

        let calendars = calendar.list_calendars().await.unwrap();
        assert_eq!(calendars.len(), 2);
        let bills = calendars.iter().find(|c| c.summary == "Bills").unwrap();

        let now = chrono::Utc::now();
        let events = calendar
            .list_events(&bills.id, now, now + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].occurrence(), Some("2026-11-05T09:00:00-08:00"));

        calendar
            .patch_event_summary(&bills.id, "e1", "Pay PG&E $87.65")
            .await
            .unwrap();
        let patches = state.patches.lock().unwrap().clone();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "bills@group.calendar.google.com");
        assert_eq!(patches[0].1, "e1");
        assert_eq!(patches[0].2, json!({"summary": "Pay PG&E $87.65"}));
    })
    .await
    .expect("test timed out");
}
