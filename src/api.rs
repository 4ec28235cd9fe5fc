//! The HTTP management surface.
//!
//! JSON over HTTP with CORS open. Handlers re-read the lifecycle's current
//! engine on every request, so a completed hot reload is immediately visible
//! without restarting the listener. Mutating routes persist the config file
//! first and then schedule the reload pipeline.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Json, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::{
    self, Binding, Config, Device, Gateway, HealthCheckConfig, NetworkConfig, ScannerConfig,
    ServerConfig, normalize_mac,
};
use crate::error::Error;
use crate::lifecycle::{CONFIG_RELOAD_DELAY, Lifecycle, RESERVATION_RELOAD_DELAY};
use crate::logstream::LogStream;
use crate::pool::Lease;

#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Arc<Lifecycle>,
    pub logs: LogStream,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/stats", get(stats))
        .route("/api/leases", get(all_leases))
        .route("/api/leases/active", get(active_leases))
        .route("/api/leases/history", get(lease_history))
        .route("/api/leases/convert-to-static", post(convert_to_static))
        .route(
            "/api/gateways",
            get(list_gateways)
                .post(create_gateway)
                .put(update_gateway)
                .delete(delete_gateway),
        )
        .route(
            "/api/devices",
            get(list_devices)
                .post(create_device)
                .put(update_device)
                .delete(delete_device),
        )
        .route("/api/devices/discover", post(discover_devices))
        .route("/api/devices/batch", post(batch_devices))
        .route("/api/devices/gateway", put(set_device_gateway))
        .route(
            "/api/bindings",
            get(list_bindings)
                .post(create_binding)
                .put(update_binding)
                .delete(delete_binding),
        )
        .route("/api/config", get(get_config).post(upload_config))
        .route("/api/config/validate", post(validate_config))
        .route("/api/config/backups", get(list_config_backups))
        .route("/api/config/restore", post(restore_config))
        .route("/api/config/reload", post(reload_config))
        .route(
            "/api/config/server",
            get(get_server_section).post(set_server_section),
        )
        .route(
            "/api/config/network",
            get(get_network_section).post(set_network_section),
        )
        .route(
            "/api/config/health-check",
            get(get_health_section).post(set_health_section),
        )
        .route("/api/scanner", get(scanner_status))
        .route("/api/scanner/results", get(scanner_results))
        .route("/api/scanner/log", get(scanner_log))
        .route("/api/scanner/start", post(scanner_start))
        .route("/api/scanner/stop", post(scanner_stop))
        .route(
            "/api/scanner/config",
            get(get_scanner_section).post(set_scanner_section),
        )
        .route("/api/server/restart", post(restart_server))
        .route("/api/logs", get(recent_logs))
        .route("/api/logs/stream", get(stream_logs))
        .route("/api/available-ips", get(available_ips))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `{api_host}:{api_port}` and serves until the token fires; in-flight
/// requests complete before shutdown.
pub async fn serve(state: ApiState, cancel: CancellationToken) -> crate::error::Result<()> {
    let config = state.lifecycle.config().await;
    let host = match config.server.api_host.as_str() {
        "" => "0.0.0.0".to_string(),
        "localhost" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };
    let addr = format!("{host}:{}", config.server.api_port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("management API listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::InvalidConfig(_)
            | Error::InvalidMac(_)
            | Error::InvalidPacket(_)
            | Error::Yaml(_)
            | Error::StaticLease(_)
            | Error::AddressOutOfRange(_) => StatusCode::BAD_REQUEST,
            Error::Duplicate(_) | Error::ReloadBusy => StatusCode::CONFLICT,
            Error::NotFound(_) | Error::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error in API handler: {error}");
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Serialize)]
struct LeaseView {
    ip: String,
    mac: String,
    hostname: String,
    start_time: DateTime<Utc>,
    lease_time: u32,
    remaining_time: i64,
    is_static: bool,
    gateway: String,
    gateway_ip: String,
    is_expired: bool,
}

impl From<&Lease> for LeaseView {
    fn from(lease: &Lease) -> Self {
        Self {
            ip: lease.ip.to_string(),
            mac: lease.mac.clone(),
            hostname: lease.hostname.clone(),
            start_time: lease.start_time,
            lease_time: lease.advertised_seconds(),
            remaining_time: lease.remaining().num_seconds(),
            is_static: lease.is_static,
            gateway: lease.gateway_name.clone(),
            gateway_ip: lease
                .gateway_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            is_expired: lease.is_expired(),
        }
    }
}

fn lease_views(mut leases: Vec<Lease>) -> Vec<LeaseView> {
    leases.sort_by_key(|lease| u32::from(lease.ip));
    leases.iter().map(LeaseView::from).collect()
}

/// Snapshots the current config for a mutation; pair with [`persist`].
async fn current_config(state: &ApiState) -> Config {
    (*state.lifecycle.config().await).clone()
}

/// Validates the edited config, writes it back to disk (with backup), and
/// publishes it so later requests see the edit before the reload lands.
async fn persist(state: &ApiState, config: &Config) -> ApiResult<()> {
    config.validate()?;
    config.save(state.lifecycle.config_path()).await?;
    state.lifecycle.set_config(config.clone()).await;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    let uptime = (Utc::now() - engine.start_time()).num_seconds();
    Json(json!({
        "pool_stats": engine.pool().stats().await,
        "gateway_status": engine.checker().status().await,
        "server_info": {
            "version": env!("CARGO_PKG_VERSION"),
            "start_time": engine.start_time(),
            "uptime": uptime,
        },
    }))
}

async fn all_leases(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    Json(lease_views(engine.pool().all_leases().await))
}

async fn active_leases(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    Json(lease_views(engine.pool().active_leases().await))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    mac: Option<String>,
    ip: Option<String>,
}

async fn lease_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    let records = engine
        .history(
            query.limit.unwrap_or(100),
            query.mac.as_deref(),
            query.ip.as_deref(),
        )
        .await;
    Json(records)
}

#[derive(Deserialize)]
struct ConvertRequest {
    mac: String,
    alias: String,
    #[serde(default)]
    gateway: String,
    #[serde(default)]
    hostname: String,
}

async fn convert_to_static(
    State(state): State<ApiState>,
    Json(body): Json<ConvertRequest>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&body.mac)?;
    let engine = state.lifecycle.engine().await;
    let lease = engine
        .pool()
        .get_lease_by_mac(&mac)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no lease for {mac}")))?;
    if lease.is_static {
        return Err(ApiError::conflict(format!("{mac} is already static")));
    }

    let mut config = current_config(&state).await;
    if config.bindings.iter().any(|b| b.alias == body.alias) {
        return Err(ApiError::conflict(format!("alias {}", body.alias)));
    }
    if config.find_binding_by_mac(&mac).is_some() {
        return Err(ApiError::conflict(format!("binding for {mac}")));
    }

    let hostname = if body.hostname.is_empty() {
        lease.hostname.clone()
    } else {
        body.hostname
    };
    let binding = Binding {
        alias: body.alias,
        mac,
        ip: lease.ip,
        gateway: body.gateway,
        hostname,
    };
    config.bindings.push(binding.clone());

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok((StatusCode::CREATED, Json(binding)))
}

#[derive(Serialize)]
struct GatewayView {
    healthy: bool,
    ip: Ipv4Addr,
    is_default: bool,
    description: String,
    dns_servers: Vec<Ipv4Addr>,
}

async fn list_gateways(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    let status = engine.checker().status().await;

    let gateways: HashMap<String, GatewayView> = state
        .lifecycle
        .config()
        .await
        .gateways
        .iter()
        .map(|gateway| {
            (
                gateway.name.clone(),
                GatewayView {
                    healthy: *status.get(&gateway.name).unwrap_or(&false),
                    ip: gateway.ip,
                    is_default: gateway.is_default,
                    description: gateway.description.clone(),
                    dns_servers: gateway.dns_servers.clone(),
                },
            )
        })
        .collect();
    Json(gateways)
}

async fn create_gateway(
    State(state): State<ApiState>,
    Json(gateway): Json<Gateway>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    if config.find_gateway(&gateway.name).is_some() {
        return Err(ApiError::conflict(format!("gateway {}", gateway.name)));
    }

    if gateway.is_default {
        for existing in &mut config.gateways {
            existing.is_default = false;
        }
    }
    config.gateways.push(gateway.clone());

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok((StatusCode::CREATED, Json(gateway)))
}

async fn update_gateway(
    State(state): State<ApiState>,
    Json(gateway): Json<Gateway>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    if config.find_gateway(&gateway.name).is_none() {
        return Err(ApiError::not_found(format!("gateway {}", gateway.name)));
    }

    if gateway.is_default {
        for existing in &mut config.gateways {
            existing.is_default = false;
        }
    }
    for existing in &mut config.gateways {
        if existing.name == gateway.name {
            *existing = gateway.clone();
        }
    }

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(gateway))
}

#[derive(Deserialize)]
struct NameQuery {
    name: String,
}

async fn delete_gateway(
    State(state): State<ApiState>,
    Query(query): Query<NameQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    let before = config.gateways.len();
    config.gateways.retain(|gateway| gateway.name != query.name);
    if config.gateways.len() == before {
        return Err(ApiError::not_found(format!("gateway {}", query.name)));
    }

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct DeviceView {
    mac: String,
    device_type: String,
    model: String,
    description: String,
    owner: String,
    hostname: String,
    gateway: String,
    is_active: bool,
    last_seen: Option<DateTime<Utc>>,
    has_static_ip: bool,
    static_ip: String,
}

async fn list_devices(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    let config = state.lifecycle.config().await;
    let scan_results = engine.scanner().results().await;

    let views: Vec<DeviceView> = config
        .devices
        .iter()
        .map(|device| {
            let mac = normalize_mac(&device.mac).unwrap_or_else(|_| device.mac.clone());
            let seen = scan_results.get(&mac);
            let binding = config.find_binding_by_mac(&mac);
            DeviceView {
                mac,
                device_type: device.device_type.clone(),
                model: device.model.clone(),
                description: device.description.clone(),
                owner: device.owner.clone(),
                hostname: device.hostname.clone(),
                gateway: device.gateway.clone(),
                is_active: seen.is_some_and(|result| result.is_active),
                last_seen: seen.map(|result| result.last_seen),
                has_static_ip: binding.is_some(),
                static_ip: binding.map(|b| b.ip.to_string()).unwrap_or_default(),
            }
        })
        .collect();
    Json(views)
}

async fn create_device(
    State(state): State<ApiState>,
    Json(device): Json<Device>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&device.mac)?;
    let mut config = current_config(&state).await;
    if config.find_device_by_mac(&mac).is_some() {
        return Err(ApiError::conflict(format!("device {mac}")));
    }

    config.add_or_update_device(Device {
        mac,
        ..device.clone()
    });
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok((StatusCode::CREATED, Json(device)))
}

async fn update_device(
    State(state): State<ApiState>,
    Json(device): Json<Device>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&device.mac)?;
    let mut config = current_config(&state).await;
    if config.find_device_by_mac(&mac).is_none() {
        return Err(ApiError::not_found(format!("device {mac}")));
    }

    config.add_or_update_device(Device {
        mac,
        ..device.clone()
    });
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(device))
}

#[derive(Deserialize)]
struct MacQuery {
    mac: String,
}

async fn delete_device(
    State(state): State<ApiState>,
    Query(query): Query<MacQuery>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&query.mac)?;
    let mut config = current_config(&state).await;
    let before = config.devices.len();
    config
        .devices
        .retain(|device| normalize_mac(&device.mac).ok().as_deref() != Some(mac.as_str()));
    if config.devices.len() == before {
        return Err(ApiError::not_found(format!("device {mac}")));
    }

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(StatusCode::NO_CONTENT)
}

/// Folds active scanner results into the device registry.
async fn discover_devices(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let engine = state.lifecycle.engine().await;
    let scan_results = engine.scanner().results().await;

    let mut config = current_config(&state).await;
    let mut discovered = 0;
    for (mac, result) in scan_results {
        if config.find_device_by_mac(&mac).is_none() {
            config.devices.push(Device {
                mac,
                hostname: result.hostname.clone(),
                ..Device::default()
            });
            discovered += 1;
        }
    }

    if discovered > 0 {
        persist(&state, &config).await?;
        state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    }
    Ok(Json(json!({ "discovered": discovered })))
}

async fn batch_devices(
    State(state): State<ApiState>,
    Json(devices): Json<Vec<Device>>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    let mut updated = 0;
    for device in devices {
        let mac = normalize_mac(&device.mac)?;
        config.add_or_update_device(Device { mac, ..device });
        updated += 1;
    }

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Deserialize)]
struct DeviceGatewayRequest {
    mac: String,
    gateway: String,
}

async fn set_device_gateway(
    State(state): State<ApiState>,
    Json(body): Json<DeviceGatewayRequest>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&body.mac)?;
    let mut config = current_config(&state).await;

    if !body.gateway.is_empty() && config.find_gateway(&body.gateway).is_none() {
        return Err(ApiError::not_found(format!("gateway {}", body.gateway)));
    }

    match config
        .devices
        .iter_mut()
        .find(|device| normalize_mac(&device.mac).ok().as_deref() == Some(mac.as_str()))
    {
        Some(device) => device.gateway = body.gateway.clone(),
        None => config.devices.push(Device {
            mac: mac.clone(),
            gateway: body.gateway.clone(),
            ..Device::default()
        }),
    }

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "mac": mac, "gateway": body.gateway })))
}

async fn list_bindings(State(state): State<ApiState>) -> impl IntoResponse {
    let config = state.lifecycle.config().await;
    Json(config.bindings.clone())
}

async fn create_binding(
    State(state): State<ApiState>,
    Json(binding): Json<Binding>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&binding.mac)?;
    let mut config = current_config(&state).await;

    if config.bindings.iter().any(|b| b.alias == binding.alias) {
        return Err(ApiError::conflict(format!("alias {}", binding.alias)));
    }
    if config.find_binding_by_mac(&mac).is_some() {
        return Err(ApiError::conflict(format!("binding for {mac}")));
    }
    if config.bindings.iter().any(|b| b.ip == binding.ip) {
        return Err(ApiError::conflict(format!("binding IP {}", binding.ip)));
    }

    let binding = Binding { mac, ..binding };
    config.bindings.push(binding.clone());

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn update_binding(
    State(state): State<ApiState>,
    Json(binding): Json<Binding>,
) -> ApiResult<impl IntoResponse> {
    let mac = normalize_mac(&binding.mac)?;
    let mut config = current_config(&state).await;

    let Some(existing) = config
        .bindings
        .iter_mut()
        .find(|b| b.alias == binding.alias)
    else {
        return Err(ApiError::not_found(format!("binding {}", binding.alias)));
    };
    *existing = Binding {
        mac,
        ..binding.clone()
    };

    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(binding))
}

#[derive(Deserialize)]
struct AliasQuery {
    alias: String,
}

async fn delete_binding(
    State(state): State<ApiState>,
    Query(query): Query<AliasQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    let Some(position) = config
        .bindings
        .iter()
        .position(|binding| binding.alias == query.alias)
    else {
        return Err(ApiError::not_found(format!("binding {}", query.alias)));
    };
    let removed = config.bindings.remove(position);

    persist(&state, &config).await?;

    // Any dynamic leases the MAC holds go now; the static lease disappears
    // when the reload rebuilds the pool without this reservation.
    let engine = state.lifecycle.engine().await;
    engine.pool().remove_all_leases_by_mac(&removed.mac).await;

    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RawQuery {
    #[serde(default)]
    raw: bool,
}

async fn get_config(
    State(state): State<ApiState>,
    Query(query): Query<RawQuery>,
) -> ApiResult<Response> {
    if query.raw {
        let content = tokio::fs::read_to_string(state.lifecycle.config_path())
            .await
            .map_err(Error::from)?;
        return Ok(content.into_response());
    }
    let config = state.lifecycle.config().await;
    Ok(Json((*config).clone()).into_response())
}

#[derive(Deserialize)]
struct ConfigUpload {
    content: String,
    #[serde(default)]
    auto_reload: bool,
}

async fn upload_config(
    State(state): State<ApiState>,
    Json(body): Json<ConfigUpload>,
) -> ApiResult<impl IntoResponse> {
    // Parse-and-validate before anything touches the disk.
    let parsed = Config::from_yaml_str(&body.content)?;

    config::backup_config(state.lifecycle.config_path()).await?;
    tokio::fs::write(state.lifecycle.config_path(), &body.content)
        .await
        .map_err(Error::from)?;
    state.lifecycle.set_config(parsed).await;

    if body.auto_reload {
        state.lifecycle.schedule_reload(CONFIG_RELOAD_DELAY);
    }
    Ok(Json(json!({ "status": "saved", "auto_reload": body.auto_reload })))
}

#[derive(Deserialize)]
struct ValidateRequest {
    content: String,
}

async fn validate_config(Json(body): Json<ValidateRequest>) -> Response {
    match Config::from_yaml_str(&body.content) {
        Ok(_) => Json(json!({ "valid": true })).into_response(),
        Err(error) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "error": error.to_string() })),
        )
            .into_response(),
    }
}

async fn list_config_backups(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    let backups = config::list_backups(state.lifecycle.config_path()).await?;
    Ok(Json(backups))
}

#[derive(Deserialize)]
struct RestoreRequest {
    filename: String,
}

async fn restore_config(
    State(state): State<ApiState>,
    Json(body): Json<RestoreRequest>,
) -> ApiResult<impl IntoResponse> {
    let restored = config::restore_backup(state.lifecycle.config_path(), &body.filename).await?;
    state.lifecycle.set_config(restored).await;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "status": "restored", "filename": body.filename })))
}

async fn reload_config(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    state.lifecycle.reload_from_disk().await?;
    Ok(Json(json!({ "status": "reloaded" })))
}

async fn get_server_section(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.lifecycle.config().await.server.clone())
}

async fn set_server_section(
    State(state): State<ApiState>,
    Json(section): Json<ServerConfig>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    config.server = section;
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "status": "saved" })))
}

async fn get_network_section(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.lifecycle.config().await.network.clone())
}

async fn set_network_section(
    State(state): State<ApiState>,
    Json(section): Json<NetworkConfig>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    config.network = section;
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "status": "saved" })))
}

async fn get_health_section(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.lifecycle.config().await.health_check.clone())
}

async fn set_health_section(
    State(state): State<ApiState>,
    Json(section): Json<HealthCheckConfig>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    config.health_check = section;
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "status": "saved" })))
}

async fn scanner_status(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    Json(engine.scanner().status().await)
}

async fn scanner_results(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    Json(engine.scanner().results().await)
}

async fn scanner_log(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    Json(json!({ "log": engine.scanner().scan_log().await }))
}

async fn scanner_start(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    engine.scanner().start().await;
    Json(json!({ "status": "started" }))
}

async fn scanner_stop(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    engine.scanner().stop().await;
    Json(json!({ "status": "stopped" }))
}

async fn get_scanner_section(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.lifecycle.config().await.scanner.clone())
}

async fn set_scanner_section(
    State(state): State<ApiState>,
    Json(section): Json<ScannerConfig>,
) -> ApiResult<impl IntoResponse> {
    let mut config = current_config(&state).await;
    config.scanner = section;
    persist(&state, &config).await?;
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Ok(Json(json!({ "status": "saved" })))
}

async fn restart_server(State(state): State<ApiState>) -> impl IntoResponse {
    state.lifecycle.schedule_reload(RESERVATION_RELOAD_DELAY);
    Json(json!({ "status": "restarting" }))
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn recent_logs(
    State(state): State<ApiState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    Json(json!({ "logs": state.logs.recent(query.limit.unwrap_or(100)) }))
}

async fn stream_logs(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    // Lagged subscribers miss lines rather than blocking the producer.
    let stream = BroadcastStream::new(state.logs.subscribe()).filter_map(|line| {
        futures::future::ready(line.ok().map(|line| Ok(Event::default().data(line))))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn available_ips(State(state): State<ApiState>) -> impl IntoResponse {
    let engine = state.lifecycle.engine().await;
    let ips: Vec<String> = engine
        .pool()
        .available_ips()
        .await
        .into_iter()
        .map(|ip| ip.to_string())
        .collect();
    Json(ips)
}
