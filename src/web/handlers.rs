//! HTTP request handlers.

use super::error::ApiError;
use super::AppState;
use crate::db::{Device, Event, TokenKind};
use crate::devices::{DeviceDetails, DeviceUpdate};
use crate::heartbeat::HeartbeatOutcome;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};

type ApiResult = Result<Json<Value>, ApiError>;

fn ok() -> ApiResult {
    Ok(Json(json!({ "ok": true })))
}

// ============================================================================
// Client address
// ============================================================================

/// Address of the client. A `Forwarded` element is trusted only when it
/// carries the configured proxy secret.
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, secret: Option<&str>) -> String {
    if let Some(secret) = secret {
        for value in headers.get_all(header::FORWARDED) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if let Some(ip) = forwarded_for(value, secret) {
                return ip;
            }
        }
    }
    peer.ip().to_string()
}

fn forwarded_for(value: &str, secret: &str) -> Option<String> {
    for element in value.split(',') {
        let mut for_value = None;
        let mut trusted = false;
        for pair in element.split(';') {
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"');
            match key.trim().to_ascii_lowercase().as_str() {
                "for" => for_value = Some(val),
                "secret" => trusted = val == secret,
                _ => {}
            }
        }
        if trusted {
            if let Some(addr) = for_value {
                return Some(strip_port(addr));
            }
        }
    }
    None
}

fn strip_port(addr: &str) -> String {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host.to_string(),
        _ => addr.to_string(),
    }
}

/// Hide the host part of an address: `a.b.c.*` for IPv4.
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.*", a, b, c)
        }
        Ok(IpAddr::V6(v6)) => {
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}:*", s[0], s[1], s[2], s[3])
        }
        Err(_) => "*".to_string(),
    }
}

// ============================================================================
// Views
// ============================================================================

#[derive(Serialize)]
struct ListedDevice<'a> {
    id: i64,
    title: &'a str,
    isp: &'a str,
    location: &'a str,
    created: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
    downtime: i64,
    downtime_uncrossed: i64,
    interval: i64,
}

impl<'a> From<&'a Device> for ListedDevice<'a> {
    fn from(d: &'a Device) -> Self {
        Self {
            id: d.id,
            title: &d.title,
            isp: &d.isp,
            location: &d.location,
            created: d.created,
            updated: d.last_seen,
            downtime: d.downtime,
            downtime_uncrossed: d.downtime_uncrossed,
            interval: d.interval,
        }
    }
}

#[derive(Serialize)]
struct EventView<'a> {
    id: i64,
    started: Option<DateTime<Utc>>,
    ended: DateTime<Utc>,
    downtime: Option<i64>,
    old_ip: Option<String>,
    new_ip: Option<String>,
    comment: Option<&'a str>,
    crossed: bool,
}

impl<'a> From<&'a Event> for EventView<'a> {
    fn from(e: &'a Event) -> Self {
        Self {
            id: e.id,
            started: e.started,
            ended: e.ended,
            downtime: e.downtime,
            old_ip: e.old_ip.as_deref().map(mask_ip),
            new_ip: e.new_ip.as_deref().map(mask_ip),
            comment: e.comment.as_deref(),
            crossed: e.crossed,
        }
    }
}

/// What anyone holding the view token sees.
#[derive(Serialize)]
struct PublicDeviceView<'a> {
    id: i64,
    title: &'a str,
    notes: &'a str,
    country: &'a str,
    location: &'a str,
    isp: &'a str,
    battery: bool,
    reserve: bool,
    battery_comment: &'a str,
    reserve_comment: &'a str,
    interval: i64,
    created: Option<DateTime<Utc>>,
    ip: Option<String>,
    updated: Option<DateTime<Utc>>,
    downtime: i64,
    downtime_uncrossed: i64,
    version: i64,
    events: Vec<EventView<'a>>,
}

impl<'a> From<&'a DeviceDetails> for PublicDeviceView<'a> {
    fn from(details: &'a DeviceDetails) -> Self {
        let d = &details.device;
        Self {
            id: d.id,
            title: &d.title,
            notes: &d.notes,
            country: &d.country,
            location: &d.location,
            isp: &d.isp,
            battery: d.battery,
            reserve: d.reserve,
            battery_comment: &d.battery_comment,
            reserve_comment: &d.reserve_comment,
            interval: d.interval,
            created: d.created,
            ip: d.last_ip.as_deref().map(mask_ip),
            updated: d.last_seen,
            downtime: d.downtime,
            downtime_uncrossed: d.downtime_uncrossed,
            version: d.version,
            events: details.events.iter().map(EventView::from).collect(),
        }
    }
}

/// The owner's settings page: the public view plus settings and tokens.
#[derive(Serialize)]
struct OwnerDeviceView<'a> {
    #[serde(flatten)]
    base: PublicDeviceView<'a>,
    public: bool,
    notify_interval: i64,
    email: &'a str,
    email_confirmed: bool,
    notifyoff: bool,
    notifyon: bool,
    edit_token: Option<&'a str>,
    view_token: Option<&'a str>,
    update_token: Option<&'a str>,
}

impl<'a> From<&'a DeviceDetails> for OwnerDeviceView<'a> {
    fn from(details: &'a DeviceDetails) -> Self {
        let d = &details.device;
        Self {
            base: PublicDeviceView::from(details),
            public: d.public,
            notify_interval: d.notify_interval,
            email: &d.email,
            email_confirmed: d.email_confirmed,
            notifyoff: d.notify_down,
            notifyon: d.notify_up,
            edit_token: d.edit_token.as_deref(),
            view_token: d.view_token.as_deref(),
            update_token: d.update_token.as_deref(),
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

// ============================================================================
// Read endpoints
// ============================================================================

pub async fn handle_listing(State(state): State<AppState>) -> ApiResult {
    let (devices, total) = state.devices.listing()?;
    let listed: Vec<ListedDevice> = devices.iter().map(ListedDevice::from).collect();
    Ok(Json(json!({ "devices": listed, "total": total })))
}

pub async fn handle_view(State(state): State<AppState>, Path(token): Path<String>) -> ApiResult {
    let details = state.devices.view(&token)?;
    to_json(&PublicDeviceView::from(&details))
}

pub async fn handle_edit_view(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult {
    let details = state.devices.edit_view(&token)?;
    to_json(&OwnerDeviceView::from(&details))
}

// ============================================================================
// Owner endpoints
// ============================================================================

pub async fn handle_save(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(update): Json<DeviceUpdate>,
) -> ApiResult {
    state.devices.update(&token, update).await?;
    ok()
}

#[derive(Debug, Deserialize)]
pub struct SendCodeRequest {
    pub email: String,
}

pub async fn handle_send_code(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<SendCodeRequest>,
) -> ApiResult {
    state.devices.send_code(&token, &req.email, Utc::now()).await?;
    ok()
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub vcode: String,
}

pub async fn handle_verify(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> ApiResult {
    if state.devices.verify(&token, req.vcode.trim()).await? {
        ok()
    } else {
        Ok(Json(json!({ "error": true })))
    }
}

#[derive(Debug, Deserialize)]
pub struct ChangeTokenRequest {
    pub tok: String,
}

pub async fn handle_change_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<ChangeTokenRequest>,
) -> ApiResult {
    let kind = TokenKind::parse(&req.tok)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown token kind: {}", req.tok)))?;
    let fresh = state.devices.change_token(&token, kind).await?;
    Ok(Json(json!({ "ok": true, "new_token": fresh })))
}

pub async fn handle_unsubscribe(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<String, ApiError> {
    let device = state.devices.unsubscribe(&token).await?;
    Ok(format!(
        "You have successfully unsubscribed from notifications about {}",
        device.title
    ))
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub id: i64,
    #[serde(default)]
    pub comment: String,
}

pub async fn handle_toggle_event(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<EventRequest>,
) -> ApiResult {
    state.devices.toggle_event(&token, req.id).await?;
    ok()
}

pub async fn handle_add_comment(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<EventRequest>,
) -> ApiResult {
    state
        .devices
        .add_comment(&token, req.id, &req.comment)
        .await?;
    ok()
}

pub async fn handle_create_device(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> ApiResult {
    let ip = client_ip(&headers, peer, state.config.forwarded_secret.as_deref());
    let device = state.devices.create(&ip, Utc::now()).await?;
    Ok(Json(json!({ "ok": true, "new_token": device.edit_token })))
}

pub async fn handle_delete_device(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult {
    state.devices.delete(&token).await?;
    ok()
}

// ============================================================================
// Automation export
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MacroQuery {
    pub url: String,
    #[serde(default)]
    pub alarm: Option<String>,
}

/// A MacroDroid macro that opens the heartbeat URL every minute and on boot.
pub fn macrodroid_export(url: &str, name: &str, use_alarm: bool) -> Value {
    json!({
        "exportedActionBlocks": [],
        "isActionBlock": false,
        "isBeingImported": false,
        "isClonedInstance": false,
        "isFavourite": false,
        "lastEditedTimestamp": 1670870029810_i64,
        "localVariables": [],
        "m_GUID": -5384050320463731281_i64,
        "m_actionList": [{
            "allowAnyCertificate": false,
            "blockNextAction": false,
            "m_disableUrlEncode": false,
            "m_httpGet": true,
            "m_urlToOpen": url,
            "m_SIGUID": -5454013458975505420_i64,
            "m_classType": "OpenWebPageAction",
            "m_constraintList": [],
            "m_isDisabled": false,
            "m_isOrCondition": false
        }],
        "m_category": "Uptime monitoring",
        "m_constraintList": [],
        "m_description": "",
        "m_descriptionOpen": true,
        "m_enabled": true,
        "m_excludeLog": false,
        "m_headingColor": 0,
        "m_isOrCondition": false,
        "m_name": name,
        "m_triggerList": [
            {
                "m_ignoreReferenceStartTime": false,
                "m_minutes": 0,
                "m_seconds": 60,
                "m_startHour": 0,
                "m_startMinute": 0,
                "m_useAlarm": use_alarm,
                "m_SIGUID": -7188598824216115889_i64,
                "m_classType": "RegularIntervalTrigger",
                "m_constraintList": [],
                "m_isDisabled": false,
                "m_isOrCondition": false
            },
            {
                "m_SIGUID": -7117360536970260286_i64,
                "m_classType": "BootTrigger",
                "m_constraintList": [],
                "m_isDisabled": false,
                "m_isOrCondition": false
            }
        ]
    })
}

pub async fn handle_macro(
    State(state): State<AppState>,
    Query(query): Query<MacroQuery>,
) -> Response {
    let use_alarm = matches!(query.alarm.as_deref(), Some(a) if !a.is_empty() && a != "false");
    let body = macrodroid_export(&query.url, &state.config.mail.domain, use_alarm).to_string();
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CONTENT_DISPOSITION, "Attachment; filename=\"uptime.macro\""),
        ],
        body,
    )
        .into_response()
}

// ============================================================================
// Heartbeat
// ============================================================================

const REFRESH: HeaderName = HeaderName::from_static("refresh");

pub async fn handle_heartbeat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Response {
    let ip = client_ip(&headers, peer, state.config.forwarded_secret.as_deref());
    match state.heartbeat.process(&token, &ip, Utc::now()).await {
        Ok(HeartbeatOutcome::BadToken) => "bad token".into_response(),
        Ok(HeartbeatOutcome::TooSoon { retry_after }) => {
            ([(REFRESH, retry_after.to_string())], "too often").into_response()
        }
        Ok(HeartbeatOutcome::Accepted {
            reported_gap,
            next_interval,
        }) => {
            let body = reported_gap.map(|gap| gap.to_string()).unwrap_or_default();
            ([(REFRESH, next_interval.to_string())], body).into_response()
        }
        Err(e) => {
            tracing::error!("Heartbeat failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}
