//! Host build: the full firmware surface running on a workstation.
//!
//! WiFi provisioning and OTA flashing have no hardware to drive here, so the
//! link supervisor is fed synthetic events and a verified firmware upload is
//! staged to disk instead of a flash partition. Everything else (the admin
//! endpoints, the user config passthrough, MQTT with LWT/birth, the debug
//! command console on stdin) behaves as on the device.

use std::{
    collections::HashMap,
    convert::Infallible,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Multipart, Path as UrlPath, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse, Redirect, Response,
    },
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc, sync::Mutex};
use tracing::{info, warn};

use webnode_common::{
    birth_payload, domoticz,
    pages::{self, InfoSnapshot},
    store::{CONFIG_FILE, SECRET_FILE, USER_CONFIG_FILE},
    topics::{DOMOTICZ_IN_TOPIC, WILL_PAYLOAD},
    urlcodec, CommandDispatcher, CommandEffect, CommandSource, ConfigStore, HttpAuthConfig,
    LinkAction, LinkEvent, LinkSupervisor, MqttSettings, NetworkConfig, StoreError, WifiStatus,
    SERVER_VERSION,
};

const MQTT_CHANNEL_CAPACITY: usize = 64;
const STAGED_FIRMWARE_FILE: &str = "firmware.bin";

#[derive(Debug, Default)]
struct UpdateState {
    expected_md5: String,
    expected_size: u64,
    last_error: Option<String>,
}

/// Responses for the `/json`, `/rest` and `/post` extension points. `None`
/// means the hook did not recognize the request.
type ExtensionHook =
    dyn Fn(&str, &[(String, String)]) -> Option<(StatusCode, String)> + Send + Sync;

#[derive(Clone, Default)]
struct ExtensionHooks {
    json: Option<Arc<ExtensionHook>>,
    rest: Option<Arc<ExtensionHook>>,
    post: Option<Arc<ExtensionHook>>,
}

#[derive(Clone)]
struct AppState {
    store: ConfigStore,
    network: Arc<Mutex<NetworkConfig>>,
    auth: Arc<Mutex<HttpAuthConfig>>,
    mqtt_settings: Arc<Mutex<MqttSettings>>,
    mqtt: Arc<Mutex<Option<AsyncClient>>>,
    dispatcher: Arc<Mutex<CommandDispatcher>>,
    link: Arc<Mutex<LinkSupervisor>>,
    update: Arc<Mutex<UpdateState>>,
    last_ntp_sync: Arc<Mutex<Option<DateTime<Utc>>>>,
    hooks: ExtensionHooks,
    restart_tx: mpsc::Sender<()>,
    web_root: PathBuf,
    chip_id: u32,
    started_at: DateTime<Utc>,
}

/// Stable stand-in for the MAC-derived chip id. Hashing the data directory
/// keeps the generated MQTTClientID identical across restarts while giving
/// side-by-side instances distinct ids.
fn host_chip_id(data_dir: &str) -> u32 {
    let canonical = std::fs::canonicalize(data_dir)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| data_dir.to_string());
    let digest = Md5::digest(canonical.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("WEBNODE_DATA_DIR").unwrap_or_else(|_| "./.webnode".to_string());
    let store = ConfigStore::new(&data_dir);
    let web_root = std::env::var("WEBNODE_WEB_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(&data_dir).join("www"));

    let chip_id = host_chip_id(&data_dir);

    let (network, config_missing) = match store.load_network() {
        Ok(config) => (config, false),
        Err(StoreError::Missing) => {
            info!("no network config yet, using defaults");
            (NetworkConfig::default(), true)
        }
        Err(err) => {
            warn!("failed to load network config: {err}, using defaults");
            (NetworkConfig::default(), true)
        }
    };
    let auth = store.load_auth();

    let mqtt_settings = store
        .mqtt_settings(chip_id)
        .context("failed to assemble MQTT settings")?;

    let mut link = LinkSupervisor::new(config_missing, network.ntp_period_minutes);
    link.set_mqtt_initialized(mqtt_settings.is_complete());

    let (restart_tx, mut restart_rx) = mpsc::channel::<()>(1);

    let state = AppState {
        store: store.clone(),
        network: Arc::new(Mutex::new(network)),
        auth: Arc::new(Mutex::new(auth)),
        mqtt_settings: Arc::new(Mutex::new(mqtt_settings.clone())),
        mqtt: Arc::new(Mutex::new(None)),
        dispatcher: Arc::new(Mutex::new(build_dispatcher(&store, chip_id))),
        link: Arc::new(Mutex::new(link)),
        update: Arc::new(Mutex::new(UpdateState::default())),
        last_ntp_sync: Arc::new(Mutex::new(None)),
        hooks: ExtensionHooks::default(),
        restart_tx,
        web_root,
        chip_id,
        started_at: Utc::now(),
    };

    // The host always has a network, so the station comes up immediately.
    let boot_actions = {
        let mut link = state.link.lock().await;
        link.handle_event(LinkEvent::WifiConnected);
        link.handle_event(LinkEvent::WifiGotIp)
    };
    for action in boot_actions {
        execute_link_action(&state, action).await;
    }

    if mqtt_settings.is_complete() {
        start_mqtt(&state, &mqtt_settings).await;
        attach_domoticz_command(&state).await;
    } else {
        info!("MQTT not configured, client not started");
    }

    spawn_tick_loop(state.clone());
    spawn_stdin_loop(state.clone());

    let app = router(state);

    let port = std::env::var("WEBNODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web server at {addr}"))?;

    info!("web server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = restart_rx.recv().await;
            info!("restart requested, shutting down");
        })
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/list", get(handle_file_list))
        .route(
            "/edit",
            get(handle_edit_page)
                .put(handle_file_create)
                .delete(handle_file_delete)
                .post(handle_file_upload),
        )
        .route("/admin", get(handle_admin_page))
        .route("/admin/generalvalues", get(handle_general_values))
        .route("/admin/values", get(handle_network_values))
        .route("/admin/connectionstate", get(handle_connection_state))
        .route("/admin/infovalues", get(handle_info_values))
        .route("/admin/ntpvalues", get(handle_ntp_values))
        .route("/admin/wwwauth", get(handle_auth_values))
        .route("/admin/restart", get(handle_restart))
        .route(
            "/config.html",
            get(handle_network_form).post(handle_network_form),
        )
        .route(
            "/general.html",
            get(handle_general_form).post(handle_general_form),
        )
        .route("/ntp.html", get(handle_ntp_form).post(handle_ntp_form))
        .route(
            "/system.html",
            get(handle_auth_form).post(handle_auth_form),
        )
        .route("/scan", get(handle_scan))
        .route("/update/updatepossible", get(handle_update_possible))
        .route("/setmd5", get(handle_set_md5).post(handle_set_md5))
        .route(
            "/update",
            get(handle_update_page).post(handle_update_upload),
        )
        .route("/rconfig/{*names}", get(handle_rconfig))
        .route("/pconfig", get(handle_pconfig).post(handle_pconfig))
        .route("/json", get(handle_json_hook).post(handle_json_hook))
        .route("/rest", get(handle_rest_hook).post(handle_rest_hook))
        .route("/post", get(handle_post_hook).post(handle_post_hook))
        .route("/all", get(handle_all))
        .route("/events", get(handle_events))
        .fallback(handle_static)
        .with_state(state)
}

// ---- auth ----

async fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let auth = state.auth.lock().await.clone();
    if !auth.auth {
        return Ok(());
    }
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = BASE64.decode(encoded.trim()) {
                if decoded == format!("{}:{}", auth.user, auth.pass).into_bytes() {
                    return Ok(());
                }
            }
        }
    }
    Err((
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"webnode\"")],
        "Unauthorized",
    )
        .into_response())
}

// ---- small response helpers ----

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn pipe_values(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// Form handlers accept their args from the query string or the body,
/// percent-decoded either way.
fn collect_args(query: Option<&str>, body: &str) -> Vec<(String, String)> {
    let mut args = Vec::new();
    if let Some(query) = query {
        args.extend(urlcodec::parse_query(query, true));
    }
    if !body.is_empty() {
        args.extend(urlcodec::parse_query(body, true));
    }
    args
}

async fn request_restart(state: &AppState) {
    let tx = state.restart_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let _ = tx.send(()).await;
    });
}

// ---- file manager and static serving ----

fn is_protected(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    matches!(name, SECRET_FILE | CONFIG_FILE | USER_CONFIG_FILE)
}

async fn serve_file(state: &AppState, path: &str, download: bool) -> Option<Response> {
    if path.contains("..") {
        return Some(plain(StatusCode::FORBIDDEN, "Forbidden"));
    }
    if is_protected(path) {
        return Some(plain(StatusCode::FORBIDDEN, "Forbidden"));
    }

    let mut path = path.trim_start_matches('/').to_string();
    if path.is_empty() || path.ends_with('/') {
        path.push_str("index.htm");
    }

    let content_type = if download {
        "application/octet-stream"
    } else {
        urlcodec::content_type_for(&path)
    };

    let full = state.web_root.join(&path);
    let gz = state.web_root.join(format!("{path}.gz"));

    // A precompressed sibling wins over the plain file.
    if let Ok(body) = tokio::fs::read(&gz).await {
        return Some(
            (
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CONTENT_ENCODING, "gzip"),
                ],
                Bytes::from(body),
            )
                .into_response(),
        );
    }
    if let Ok(body) = tokio::fs::read(&full).await {
        return Some(([(header::CONTENT_TYPE, content_type)], Bytes::from(body)).into_response());
    }
    None
}

async fn handle_static(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let download = collect_args(query.as_deref(), "")
        .iter()
        .any(|(name, _)| name == "download");
    match serve_file(&state, uri.path(), download).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_file_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let Some(dir) = params.get("dir") else {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "BAD ARGS");
    };

    let base = state.web_root.join(dir.trim_start_matches('/'));
    let mut entries = Vec::new();
    if let Ok(mut reader) = tokio::fs::read_dir(&base).await {
        while let Ok(Some(entry)) = reader.next_entry().await {
            let kind = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => "dir",
                _ => "file",
            };
            entries.push(json!({
                "type": kind,
                "name": entry.file_name().to_string_lossy(),
            }));
        }
    }
    (
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::Value::Array(entries).to_string(),
    )
        .into_response()
}

async fn handle_edit_page(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    match serve_file(&state, "/edit.html", false).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_file_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), "");
    let Some(path) = urlcodec::arg_or_first(&args, "path").map(str::to_string) else {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "BAD ARGS");
    };
    if path == "/" {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "BAD PATH");
    }
    let full = state.web_root.join(path.trim_start_matches('/'));
    if full.exists() {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "FILE EXISTS");
    }
    if let Some(parent) = full.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::write(&full, b"").await {
        Ok(()) => plain(StatusCode::OK, ""),
        Err(_) => plain(StatusCode::INTERNAL_SERVER_ERROR, "CREATE FAILED"),
    }
}

async fn handle_file_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), "");
    let Some(path) = urlcodec::arg_or_first(&args, "path").map(str::to_string) else {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "BAD ARGS");
    };
    if path == "/" {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "BAD PATH");
    }
    let full = state.web_root.join(path.trim_start_matches('/'));
    if !full.exists() {
        return plain(StatusCode::NOT_FOUND, "FileNotFound");
    }
    match tokio::fs::remove_file(&full).await {
        Ok(()) => plain(StatusCode::OK, ""),
        Err(err) => plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn handle_file_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    while let Ok(Some(field)) = multipart.next_field().await {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(err) => return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        let full = state.web_root.join(filename.trim_start_matches('/'));
        if let Some(parent) = full.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(err) = tokio::fs::write(&full, &data).await {
            warn!("upload of {filename} failed: {err}");
            return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
        info!(
            "uploaded {filename} ({})",
            urlcodec::format_bytes(data.len() as u64)
        );
    }
    plain(StatusCode::OK, "")
}

// ---- admin values ----

async fn handle_admin_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    match serve_file(&state, "/admin.html", false).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_general_values(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let network = state.network.lock().await;
    pipe_values(pages::general_values(&network.device_name, SERVER_VERSION))
}

async fn handle_network_values(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let network = state.network.lock().await;
    pipe_values(pages::network_values(&network))
}

async fn handle_connection_state(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let status = state.link.lock().await.status();
    let text = match status {
        WifiStatus::Connected => "CONNECTED",
        WifiStatus::Connecting => "DISCONNECTED",
        WifiStatus::ApMode => "AP MODE",
    };
    pipe_values(pages::connection_state_value(text))
}

async fn handle_info_values(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    pipe_values(pages::info_values(&info_snapshot(&state).await))
}

async fn handle_ntp_values(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let network = state.network.lock().await;
    pipe_values(pages::ntp_values(&network))
}

async fn handle_auth_values(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let auth = state.auth.lock().await;
    pipe_values(pages::auth_values(&auth))
}

async fn handle_restart(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    request_restart(&state).await;
    Html(pages::PAGE_RESTART).into_response()
}

// ---- config forms ----

async fn handle_network_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    if args.is_empty() {
        return match serve_file(&state, "/config.html", false).await {
            Some(resp) => resp,
            None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
        };
    }

    let mut network = state.network.lock().await;
    pages::apply_network_args(&mut network, &args);
    if let Err(err) = state.store.save_network(&network) {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    drop(network);

    request_restart(&state).await;
    Html(pages::PAGE_WAIT_AND_RELOAD).into_response()
}

async fn handle_general_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    if args.is_empty() {
        return match serve_file(&state, "/general.html", false).await {
            Some(resp) => resp,
            None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
        };
    }

    let mut network = state.network.lock().await;
    pages::apply_general_args(&mut network, &args);
    if let Err(err) = state.store.save_network(&network) {
        return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }
    drop(network);

    request_restart(&state).await;
    Html(pages::PAGE_RESTART).into_response()
}

async fn handle_ntp_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    if !args.is_empty() {
        let mut network = state.network.lock().await;
        pages::apply_ntp_args(&mut network, &args);
        if let Err(err) = state.store.save_network(&network) {
            return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
        let period = network.ntp_period_minutes;
        drop(network);
        state.link.lock().await.set_ntp_period_minutes(period);
    }
    match serve_file(&state, "/ntp.html", false).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_auth_form(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    if !args.is_empty() {
        let mut auth = state.auth.lock().await;
        pages::apply_auth_args(&mut auth, &args);
        if let Err(err) = state.store.save_auth(&auth) {
            return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }
    match serve_file(&state, "/system.html", false).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_scan(State(_state): State<AppState>) -> Response {
    // No radio to scan with on the host.
    ([(header::CONTENT_TYPE, "application/json")], "[]").into_response()
}

// ---- firmware update ----

async fn handle_update_possible(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let update = state.update.lock().await;
    pipe_values(pages::update_possible_values(
        true,
        update.last_error.as_deref(),
    ))
}

async fn handle_set_md5(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    let mut update = state.update.lock().await;
    update.expected_md5.clear();
    update.expected_size = 0;
    for (name, value) in &args {
        match name.as_str() {
            "md5" => update.expected_md5 = value.to_ascii_lowercase(),
            "size" => update.expected_size = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    plain(StatusCode::OK, format!("OK --> MD5: {}", update.expected_md5))
}

async fn handle_update_page(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    match serve_file(&state, "/update.html", false).await {
        Some(resp) => resp,
        None => plain(StatusCode::NOT_FOUND, "FileNotFound"),
    }
}

async fn handle_update_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }

    let mut firmware: Option<Bytes> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.file_name().is_some() {
            match field.bytes().await {
                Ok(data) => firmware = Some(data),
                Err(err) => {
                    state.update.lock().await.last_error = Some(err.to_string());
                    return plain(StatusCode::OK, "FAIL");
                }
            }
        }
    }
    let Some(firmware) = firmware else {
        state.update.lock().await.last_error = Some("no firmware in upload".to_string());
        return plain(StatusCode::OK, "FAIL");
    };

    let mut update = state.update.lock().await;
    let digest = format!("{:x}", Md5::digest(&firmware));

    if !update.expected_md5.is_empty() && digest != update.expected_md5 {
        warn!(
            "firmware MD5 mismatch: got {digest}, expected {}",
            update.expected_md5
        );
        update.last_error = Some("MD5 mismatch".to_string());
        return plain(StatusCode::OK, "FAIL");
    }
    if update.expected_size != 0 && firmware.len() as u64 != update.expected_size {
        update.last_error = Some("size mismatch".to_string());
        return plain(StatusCode::OK, "FAIL");
    }

    let staged = state.store.root().join(STAGED_FIRMWARE_FILE);
    if let Err(err) = tokio::fs::write(&staged, &firmware).await {
        update.last_error = Some(err.to_string());
        return plain(StatusCode::OK, "FAIL");
    }
    update.last_error = None;
    info!(
        "firmware staged to {} ({}), restarting",
        staged.display(),
        urlcodec::format_bytes(firmware.len() as u64)
    );
    drop(update);

    request_restart(&state).await;
    Html(pages::PAGE_UPDATE_OK).into_response()
}

// ---- user config passthrough ----

async fn handle_rconfig(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath(names): UrlPath<String>,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let mut out = String::new();
    for segment in names.split('/').filter(|s| !s.is_empty()) {
        let (name, kind) = pages::rconfig_kind(segment);
        let value = state.store.load_user_string(name).unwrap_or_default();
        out.push_str(&pages::pipe_line(name, &value, kind));
    }
    pipe_values(out)
}

async fn handle_pconfig(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let args = collect_args(query.as_deref(), &body);
    let mut target = "/".to_string();
    for (name, value) in &args {
        if name == "afterpost" {
            target = value.clone();
        } else if let Err(err) = state.store.save_user_value(name, value) {
            return plain(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }

    // Settings may have changed under MQTT's feet, reload the view.
    match state.store.mqtt_settings(state.chip_id) {
        Ok(settings) => {
            state
                .link
                .lock()
                .await
                .set_mqtt_initialized(settings.is_complete());
            *state.mqtt_settings.lock().await = settings;
        }
        Err(err) => warn!("failed to reload MQTT settings: {err}"),
    }

    Redirect::to(&target).into_response()
}

// ---- extension hooks ----

async fn run_hook(
    state: &AppState,
    hook: Option<&Arc<ExtensionHook>>,
    uri: &Uri,
    query: Option<&str>,
    body: &str,
) -> Response {
    let args = collect_args(query, body);
    if let Some(hook) = hook {
        if let Some((status, body)) = hook(uri.path(), &args) {
            return plain(status, body);
        }
    }
    if state.dispatcher.lock().await.flags().debug {
        info!("unhandled extension request: {}", uri.path());
    }
    plain(
        StatusCode::BAD_REQUEST,
        format!("Can't understand: {}\n", uri.path()),
    )
}

async fn handle_json_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let hook = state.hooks.json.clone();
    run_hook(&state, hook.as_ref(), &uri, query.as_deref(), &body).await
}

/// `/rest` is deliberately exempt from Basic auth, matching the original
/// behavior for unattended REST clients.
async fn handle_rest_hook(
    State(state): State<AppState>,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let hook = state.hooks.rest.clone();
    run_hook(&state, hook.as_ref(), &uri, query.as_deref(), &body).await
}

async fn handle_post_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers).await {
        return resp;
    }
    let hook = state.hooks.post.clone();
    run_hook(&state, hook.as_ref(), &uri, query.as_deref(), &body).await
}

// ---- diagnostics ----

async fn handle_all(State(_state): State<AppState>) -> Response {
    // Heap, analog and GPIO snapshots need the chip; zeros keep the page
    // working on the host.
    (
        [(header::CONTENT_TYPE, "application/json")],
        json!({"heap": 0, "analog": 0, "gpio": 0}).to_string(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct TimeDatePayload {
    time: String,
    date: String,
    #[serde(rename = "lastSync")]
    last_sync: String,
    uptime: String,
    #[serde(rename = "lastBoot")]
    last_boot: String,
}

fn format_uptime(started_at: DateTime<Utc>) -> String {
    let total = (Utc::now() - started_at).num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
}

fn format_time_date(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S %d/%m/%Y").to_string()
}

async fn time_date_payload(state: &AppState) -> TimeDatePayload {
    let now = Utc::now();
    let last_sync = state
        .last_ntp_sync
        .lock()
        .await
        .map(format_time_date)
        .unwrap_or_default();
    TimeDatePayload {
        time: now.format("%H:%M:%S").to_string(),
        date: now.format("%d/%m/%Y").to_string(),
        last_sync,
        uptime: format_uptime(state.started_at),
        last_boot: format_time_date(state.started_at),
    }
}

async fn info_snapshot(state: &AppState) -> InfoSnapshot {
    let network = state.network.lock().await.clone();
    let (ip, gateway, netmask, dns) = pages::static_info(&network);
    let last_sync = state
        .last_ntp_sync
        .lock()
        .await
        .map(format_time_date)
        .unwrap_or_default();
    let now = Utc::now();
    InfoSnapshot {
        ssid: network.ssid,
        ip,
        gateway,
        netmask,
        mac: String::new(),
        dns,
        ntp_last_sync: last_sync,
        ntp_time: now.format("%H:%M:%S").to_string(),
        ntp_date: now.format("%d/%m/%Y").to_string(),
        uptime: format_uptime(state.started_at),
        last_boot: format_time_date(state.started_at),
    }
}

async fn handle_events(State(state): State<AppState>) -> Response {
    let stream = futures::stream::unfold(
        (tokio::time::interval(Duration::from_secs(1)), state),
        |(mut interval, state)| async move {
            interval.tick().await;
            let payload = time_date_payload(&state).await;
            let event = match serde_json::to_string(&payload) {
                Ok(body) => SseEvent::default().event("timeDate").data(body),
                Err(err) => SseEvent::default().event("error").data(err.to_string()),
            };
            Some((Ok::<_, Infallible>(event), (interval, state)))
        },
    );
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ---- MQTT ----

async fn start_mqtt(state: &AppState, settings: &MqttSettings) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    if !settings.user.is_empty() {
        options.set_credentials(&settings.user, &settings.pass);
    }
    options.set_last_will(LastWill::new(
        settings.will_topic(),
        WILL_PAYLOAD,
        QoS::AtLeastOnce,
        true,
    ));

    let (client, eventloop) = AsyncClient::new(options, MQTT_CHANNEL_CAPACITY);
    *state.mqtt.lock().await = client.clone().into();
    spawn_mqtt_loop(state.clone(), eventloop);
}

fn spawn_mqtt_loop(state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    state.link.lock().await.handle_event(LinkEvent::MqttConnected);
                    if let Err(err) = announce_birth(&state).await {
                        warn!("mqtt birth publish failed: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&state, &message.topic, &message.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    state
                        .link
                        .lock()
                        .await
                        .handle_event(LinkEvent::MqttDisconnected);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn announce_birth(state: &AppState) -> anyhow::Result<()> {
    let settings = state.mqtt_settings.lock().await.clone();
    let client = state.mqtt.lock().await.clone();
    let Some(client) = client else {
        return Ok(());
    };

    let user_version = state
        .store
        .load_user_string("userVersion")
        .unwrap_or_else(|| "1.0".to_string());
    client
        .publish(
            settings.will_topic(),
            QoS::AtLeastOnce,
            true,
            birth_payload(&user_version, SERVER_VERSION),
        )
        .await?;

    if !settings.command_topic.is_empty() {
        client
            .subscribe(&settings.command_topic, QoS::AtMostOnce)
            .await?;
    }
    Ok(())
}

async fn handle_mqtt_message(state: &AppState, topic: &str, payload: &[u8]) {
    let settings = state.mqtt_settings.lock().await.clone();
    let text = String::from_utf8_lossy(payload).into_owned();

    if !settings.command_topic.is_empty() && topic == settings.command_topic {
        execute_command(state, text.trim(), CommandSource::Mqtt).await;
    } else {
        info!("mqtt message on {topic}: {text}");
    }
}

/// Expose Domoticz publishing through the debug console: `domo <idx> on|off`
/// drives a Domoticz switch over `domoticz/in`.
async fn attach_domoticz_command(state: &AppState) {
    let Some(client) = state.mqtt.lock().await.clone() else {
        return;
    };
    let mut dispatcher = state.dispatcher.lock().await;
    dispatcher.set_help_hook(|| "domo <idx> on|off -> publish a Domoticz switch command".to_string());
    dispatcher.set_fallback_hook(move |command| {
        let mut parts = command.split_whitespace();
        if parts.next()? != "domo" {
            return None;
        }
        let idx: i32 = parts.next()?.parse().ok()?;
        let is_on = matches!(parts.next()?, "on" | "On" | "1");
        // No radio on the host, report a neutral signal level.
        let payload = domoticz::switch_payload(idx, is_on, -60);
        match client.try_publish(DOMOTICZ_IN_TOPIC, QoS::AtLeastOnce, true, payload) {
            Ok(()) => Some(vec![format!(
                "domoticz switch {idx} set {}",
                if is_on { "On" } else { "Off" }
            )]),
            Err(err) => Some(vec![format!("domoticz publish failed: {err}")]),
        }
    });
}

// ---- command dispatch ----

fn build_dispatcher(store: &ConfigStore, chip_id: u32) -> CommandDispatcher {
    let mut dispatcher = CommandDispatcher::new();

    let vars_store = store.clone();
    dispatcher.set_vars_provider(move || {
        let mut lines = vec![format!("version=1.0/{SERVER_VERSION}")];
        match vars_store.mqtt_settings(chip_id) {
            Ok(settings) => {
                lines.push(format!("MQTTHost={}", settings.host));
                lines.push(format!("MQTTPort={}", settings.port));
                lines.push(format!("MQTTClientID={}", settings.client_id));
                lines.push(format!("MQTTUser={}", settings.user));
                lines.push(format!("MQTTTopic={}", settings.topic));
                lines.push(format!("MQTTCommandTopic={}", settings.command_topic));
                lines.push(format!("MQTTInterval={}", settings.interval_secs));
                lines.push(format!("mqttTest()={}", settings.is_complete() as u8));
            }
            Err(err) => lines.push(format!("MQTT settings unavailable: {err}")),
        }
        lines
    });

    let user_store = store.clone();
    dispatcher.set_user_provider(move || match user_store.user_snapshot() {
        Ok(snapshot) => snapshot
            .into_iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect(),
        Err(err) => vec![format!("user config unavailable: {err}")],
    });

    dispatcher.set_heap_provider(|| "n/a".to_string());
    dispatcher
}

async fn execute_command(state: &AppState, command: &str, source: CommandSource) {
    if command.is_empty() {
        return;
    }
    let output = state.dispatcher.lock().await.execute(command);
    for line in &output.lines {
        info!("[{source:?}] {line}");
    }
    for effect in &output.effects {
        match effect {
            CommandEffect::Restart => request_restart(state).await,
            CommandEffect::TraceLevelChanged(level) => {
                info!("trace level is now {level}");
            }
        }
    }
}

fn spawn_stdin_loop(state: AppState) {
    tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            execute_command(&state, line.trim(), CommandSource::Serial).await;
        }
    });
}

// ---- periodic tick ----

async fn execute_link_action(state: &AppState, action: LinkAction) {
    match action {
        LinkAction::StartAccessPoint => {
            // Nothing to start on the host, the web server is already up.
            warn!("station connect timed out, AP mode requested");
        }
        LinkAction::ConnectMqtt => {
            // rumqttc's event loop reconnects on its own; the request is
            // only logged so the cadence stays observable.
            info!("mqtt reconnect window open");
        }
        LinkAction::SyncNtp => {
            // The host clock is already synced; record the request as a
            // completed sync.
            *state.last_ntp_sync.lock().await = Some(Utc::now());
            state.link.lock().await.handle_event(LinkEvent::NtpSynced);
            info!("ntp sync completed");
        }
    }
}

fn spawn_tick_loop(state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let actions = state.link.lock().await.tick_second();
            for action in actions {
                execute_link_action(&state, action).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn host_chip_id_is_stable_per_data_dir() {
        let dir = std::env::temp_dir().join("webnode-chip-id-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.to_string_lossy().into_owned();

        // Same directory always yields the same id, so the persisted
        // MQTTClientID survives restarts.
        assert_eq!(host_chip_id(&path), host_chip_id(&path));

        let other = dir.join("other");
        std::fs::create_dir_all(&other).unwrap();
        assert_ne!(host_chip_id(&path), host_chip_id(&other.to_string_lossy()));

        // A directory that does not exist yet still derives deterministically.
        assert_eq!(
            host_chip_id("./no-such-dir"),
            host_chip_id("./no-such-dir")
        );
    }
}
