/**
 * API REST ROOMWATCH - Surface opérateur du noeud
 *
 * RÔLE :
 * Thin JSON mapping of the controller's inbound operations, plus a
 * server-sent-events stream of every KernelEvent for dashboards.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum (bind from http.bind, default 0.0.0.0:8080)
 * - Routes : /health, /system/health, /config, /alarm-config, /override, /events
 * - Réponses de commande : {"ok": bool, "msg": string}
 * - 400 = valeur refusée (rien n'a changé), 503 = changé localement mais pas publié
 *
 * No authentication: the node is meant to sit on a trusted LAN.
 */

use crate::controller::Controller;
use crate::error::{ConfigValidationError, ControlError};
use crate::health::{HealthTracker, KernelHealth};
use crate::state::StateSnapshot;
use crate::window::format_time_of_day;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{extract::State, routing::{get, post}, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub controller: Controller,
    pub health: HealthTracker,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/state", get(get_state))
        .route("/config", get(get_config).post(post_config))
        .route("/config/publish", post(publish_config))
        .route("/alarm-config", get(get_alarm_config).post(post_alarm_config))
        .route("/override", get(get_override).post(post_override))
        .route("/events", get(stream_events))
        .with_state(app_state)
}

type Reply = (StatusCode, Json<Value>);

fn done(msg: impl Into<String>) -> Reply {
    (StatusCode::OK, Json(json!({ "ok": true, "msg": msg.into() })))
}

fn rejected(e: ConfigValidationError) -> Reply {
    (StatusCode::BAD_REQUEST, Json(json!({ "ok": false, "msg": e.to_string() })))
}

fn control_reply(result: Result<(), ControlError>, msg: &str) -> Reply {
    match result {
        Ok(()) => done(msg),
        Err(ControlError::Validation(e)) => rejected(e),
        Err(ControlError::Bus(e)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "msg": format!("{msg} locally, not published: {e}") })),
        ),
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health())
}

// GET /state (config + override + last temperature)
async fn get_state(State(app): State<AppState>) -> Json<StateSnapshot> {
    Json(app.controller.snapshot())
}

// GET /config
async fn get_config(State(app): State<AppState>) -> Json<Value> {
    let cfg = app.controller.snapshot().config;
    Json(json!({ "temp_threshold": cfg.temp_threshold, "alert_enabled": cfg.alert_enabled }))
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    #[serde(default, alias = "tempThreshold")]
    temp_threshold: Option<f64>,
    #[serde(default, alias = "alertEnabled")]
    alert_enabled: Option<bool>,
}

// POST /config
async fn post_config(State(app): State<AppState>, Json(body): Json<ConfigBody>) -> Reply {
    if let Some(enabled) = body.alert_enabled {
        app.controller.set_alert_enabled(enabled);
    }
    match body.temp_threshold {
        Some(t) => control_reply(app.controller.set_threshold(t), "threshold updated"),
        None => done("config updated"),
    }
}

// POST /config/publish
async fn publish_config(State(app): State<AppState>) -> Reply {
    control_reply(app.controller.republish_config(), "config published")
}

// GET /alarm-config
async fn get_alarm_config(State(app): State<AppState>) -> Json<Value> {
    let cfg = app.controller.snapshot().config;
    Json(json!({
        "alarm_start": format_time_of_day(cfg.alarm_start),
        "alarm_end": format_time_of_day(cfg.alarm_end),
        "alarm_enabled": cfg.alarm_enabled,
    }))
}

#[derive(Debug, Deserialize)]
struct AlarmBody {
    #[serde(default, alias = "alarmStart")]
    alarm_start: Option<String>,
    #[serde(default, alias = "alarmEnd")]
    alarm_end: Option<String>,
    #[serde(default, alias = "alarmEnabled")]
    alarm_enabled: Option<bool>,
}

// POST /alarm-config
async fn post_alarm_config(State(app): State<AppState>, Json(body): Json<AlarmBody>) -> Reply {
    if body.alarm_start.is_some() || body.alarm_end.is_some() {
        let cfg = app.controller.snapshot().config;
        let start = body.alarm_start.unwrap_or_else(|| format_time_of_day(cfg.alarm_start));
        let end = body.alarm_end.unwrap_or_else(|| format_time_of_day(cfg.alarm_end));
        if let Err(e) = app.controller.set_alarm_window(&start, &end) {
            return rejected(e);
        }
    }
    if let Some(enabled) = body.alarm_enabled {
        app.controller.set_alarm_enabled(enabled);
    }
    done("alarm config updated")
}

// GET /override
async fn get_override(State(app): State<AppState>) -> Json<Value> {
    let ov = app.controller.snapshot().override_state;
    Json(json!({ "enabled": ov.active, "cooling": ov.manual_cooling_on }))
}

#[derive(Debug, Deserialize)]
struct OverrideBody {
    enabled: bool,
    #[serde(default)]
    cooling: Option<bool>,
}

// POST /override
async fn post_override(State(app): State<AppState>, Json(body): Json<OverrideBody>) -> Reply {
    control_reply(app.controller.set_override(body.enabled, body.cooling), "override updated")
}

// GET /events (SSE, one JSON KernelEvent per message; lagged events are skipped)
async fn stream_events(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(app.controller.events().subscribe()).filter_map(|msg| match msg {
        Ok(event) => Some(Event::default().json_data(event)),
        Err(lagged) => {
            debug!(error = %lagged, "sse subscriber lagging");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BusHandle;
    use crate::envelope::EnvelopeCodec;
    use crate::events::EventBroadcaster;
    use crate::models::ControlConfig;
    use crate::router::TopicMap;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use time::macros::time;
    use tower::ServiceExt;

    fn app() -> (Router, Controller) {
        let controller = Controller::new(
            ControlConfig::default(),
            BusHandle::new(),
            EventBroadcaster::new(16),
            Arc::new(EnvelopeCodec::plaintext()),
            TopicMap::default(),
        );
        let state = AppState { controller: controller.clone(), health: HealthTracker::new() };
        (build_router(state), controller)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (app, _) = app();
        let res = app.oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_system_health_reports_link() {
        let (app, _) = app();
        let res = app.oneshot(Request::get("/system/health").body(Body::empty()).unwrap()).await.unwrap();
        let body = json_body(res).await;
        assert_eq!(body["connection_state"], "disconnected");
        assert_eq!(body["messages_dropped"], 0);
    }

    #[tokio::test]
    async fn test_threshold_kept_when_bus_is_down() {
        let (app, controller) = app();
        let res = app.oneshot(post("/config", r#"{"temp_threshold": 27.5}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(controller.snapshot().config.temp_threshold, 27.5);
    }

    #[tokio::test]
    async fn test_alert_flag_only() {
        let (app, controller) = app();
        let res = app.oneshot(post("/config", r#"{"alertEnabled": false}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert!(!controller.snapshot().config.alert_enabled);
    }

    #[tokio::test]
    async fn test_alarm_window_partial_update() {
        let (app, controller) = app();
        let res = app.clone().oneshot(post("/alarm-config", r#"{"alarm_start": "20:30"}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let cfg = controller.snapshot().config;
        assert_eq!((cfg.alarm_start, cfg.alarm_end), (time!(20:30), time!(09:00)));

        let res = app.clone().oneshot(post("/alarm-config", r#"{"alarm_end": "24:00"}"#)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["ok"], false);

        let res = app.oneshot(Request::get("/alarm-config").body(Body::empty()).unwrap()).await.unwrap();
        let body = json_body(res).await;
        assert_eq!(body["alarm_start"], "20:30");
        assert_eq!(body["alarm_end"], "09:00");
    }

    #[tokio::test]
    async fn test_override_roundtrip() {
        let (app, controller) = app();
        let res = app.clone().oneshot(post("/override", r#"{"enabled": true, "cooling": true}"#)).await.unwrap();
        // applied, but there is no broker to tell
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(controller.snapshot().override_state.active);

        let res = app.oneshot(Request::get("/override").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(json_body(res).await, json!({ "enabled": true, "cooling": true }));
    }
}
