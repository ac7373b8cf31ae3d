//! esp32 build: esp-idf wifi, SNTP, HTTP server, MQTT and OTA.

use std::{
    fmt::Write as _,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    netif::{EspNetif, NetifConfiguration},
    nvs::EspDefaultNvsPartition,
    ota::EspOta,
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use md5::{Digest, Md5};

use webnode_common::{
    birth_payload,
    pages::{self, InfoSnapshot},
    store::{CONFIG_FILE, SECRET_FILE, USER_CONFIG_FILE},
    topics::WILL_PAYLOAD,
    urlcodec, ApConfig, CommandDispatcher, CommandEffect, CommandSource, ConfigStore,
    HttpAuthConfig, LinkAction, LinkEvent, LinkSupervisor, MqttSettings, NetworkConfig, StoreError,
    WifiStatus, SERVER_VERSION,
};

const DATA_MOUNT: &str = "/spiffs";
const MAX_HTTP_BODY: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const OTA_CHUNK_SIZE: usize = 4096;
const SSE_EVENTS_PER_CONNECTION: u32 = 15;

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

#[derive(Debug, Default)]
struct UpdateState {
    expected_md5: String,
    expected_size: u64,
    last_error: Option<String>,
}

#[derive(Clone)]
struct SharedState {
    store: ConfigStore,
    network: Arc<Mutex<NetworkConfig>>,
    auth: Arc<Mutex<HttpAuthConfig>>,
    mqtt_settings: Arc<Mutex<MqttSettings>>,
    mqtt: Arc<Mutex<Option<EspMqttClient<'static>>>>,
    dispatcher: Arc<Mutex<CommandDispatcher>>,
    link: Arc<Mutex<LinkSupervisor>>,
    update: Arc<Mutex<UpdateState>>,
    wifi: Arc<Mutex<EspWifi<'static>>>,
    last_ntp_sync: Arc<Mutex<Option<chrono::DateTime<Utc>>>>,
    chip_id: u32,
    started_at: chrono::DateTime<Utc>,
}

enum WifiStartup {
    Connected,
    Provisioning,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    mount_data_partition()?;
    let store = ConfigStore::new(DATA_MOUNT);
    let chip_id = read_chip_id();

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

    info!(
        "config loaded: ssid=`{}`, dhcp={}, device=`{}`",
        network.ssid, network.dhcp, network.device_name
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let (esp_wifi, startup) = connect_wifi(
        modem,
        sys_loop.clone(),
        nvs_partition,
        &network,
        config_missing,
        chip_id,
    )
    .context("wifi startup failed")?;
    disable_wifi_power_save();

    let mut link = LinkSupervisor::new(
        matches!(startup, WifiStartup::Provisioning),
        network.ntp_period_minutes,
    );
    if matches!(startup, WifiStartup::Connected) {
        link.handle_event(LinkEvent::WifiConnected);
        link.handle_event(LinkEvent::WifiGotIp);
    }
    link.set_mqtt_initialized(mqtt_settings.is_complete());

    let sntp = Arc::new(EspSntp::new_default().context("failed to start SNTP")?);
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let state = SharedState {
        store: store.clone(),
        network: Arc::new(Mutex::new(network)),
        auth: Arc::new(Mutex::new(auth)),
        mqtt_settings: Arc::new(Mutex::new(mqtt_settings.clone())),
        mqtt: Arc::new(Mutex::new(None)),
        dispatcher: Arc::new(Mutex::new(build_dispatcher(&store, chip_id))),
        link: Arc::new(Mutex::new(link)),
        update: Arc::new(Mutex::new(UpdateState::default())),
        wifi: Arc::new(Mutex::new(esp_wifi)),
        last_ntp_sync: Arc::new(Mutex::new(None)),
        chip_id,
        started_at: Utc::now(),
    };

    if mqtt_settings.is_complete() && matches!(startup, WifiStartup::Connected) {
        match create_mqtt_client(&mqtt_settings) {
            Ok((client, connection)) => {
                *state.mqtt.lock().unwrap() = Some(client);
                spawn_mqtt_receiver(state.clone(), connection);
            }
            Err(err) => warn!("mqtt client startup failed: {err:#}"),
        }
    } else {
        info!("MQTT not configured, client not started");
    }

    spawn_tick_loop(state.clone(), sntp);

    let server = create_http_server(state)?;

    // Keep services alive for the program lifetime.
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

// ---- platform plumbing ----

fn mount_data_partition() -> anyhow::Result<()> {
    let base_path = std::ffi::CString::new(DATA_MOUNT)?;
    let conf = esp_idf_svc::sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: core::ptr::null(),
        max_files: 8,
        format_if_mount_failed: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_vfs_spiffs_register(&conf) };
    if rc == esp_idf_svc::sys::ESP_OK {
        Ok(())
    } else {
        Err(anyhow!("spiffs mount failed with code {rc}"))
    }
}

fn read_chip_id() -> u32 {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("esp_read_mac failed with code {rc}");
    }
    u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]])
}

fn format_mac() -> String {
    let mut mac = [0_u8; 6];
    unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        );
    }
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

fn free_heap() -> u32 {
    unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
}

fn restart_device() -> ! {
    thread::sleep(Duration::from_secs(1));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {rc}"))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {rc}"))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

// ---- wifi ----

fn ipv4_from_octets(octets: &[u8; 4]) -> std::net::Ipv4Addr {
    std::net::Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3])
}

fn build_sta_netif(network: &NetworkConfig) -> anyhow::Result<Option<EspNetif>> {
    if network.dhcp {
        return Ok(None);
    }

    let mask_ip = ipv4_from_octets(&network.netmask);
    let mask = Mask::try_from(mask_ip).map_err(|_| anyhow!("invalid subnet mask: {}", mask_ip))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: ipv4_from_octets(&network.ip),
                subnet: Subnet {
                    gateway: ipv4_from_octets(&network.gateway),
                    mask,
                },
                dns: Some(ipv4_from_octets(&network.dns)),
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(Some(EspNetif::new_with_conf(&conf)?))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    config_missing: bool,
    chip_id: u32,
) -> anyhow::Result<(EspWifi<'static>, WifiStartup)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(sta_netif) = build_sta_netif(network)? {
        esp_wifi
            .swap_netif_sta(sta_netif)
            .context("failed to apply static IP netif configuration")?;
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if config_missing {
        warn!("no saved config; entering setup AP mode");
        start_setup_ap(&mut wifi, chip_id)?;
        return Ok((esp_wifi, WifiStartup::Provisioning));
    }

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: if network.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        },
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok((esp_wifi, WifiStartup::Connected)),
        Some(err) => {
            warn!("all wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_setup_ap(&mut wifi, chip_id)?;
            Ok((esp_wifi, WifiStartup::Provisioning))
        }
    }
}

fn start_setup_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    chip_id: u32,
) -> anyhow::Result<()> {
    let ap = ApConfig::default();
    let ssid = ap.ssid(chip_id);
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP SSID too long"))?,
        password: ap
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("setup AP started on `{ssid}`");
    Ok(())
}

// ---- MQTT ----

fn create_mqtt_client(
    settings: &MqttSettings,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", settings.host, settings.port);
    let will_topic = settings.will_topic();

    let conf = MqttClientConfiguration {
        client_id: Some(settings.client_id.as_str()),
        username: if settings.user.is_empty() {
            None
        } else {
            Some(settings.user.as_str())
        },
        password: if settings.pass.is_empty() {
            None
        } else {
            Some(settings.pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: will_topic.as_str(),
            payload: WILL_PAYLOAD.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn announce_birth(state: &SharedState) {
    let settings = state.mqtt_settings.lock().unwrap().clone();
    let mut mqtt = state.mqtt.lock().unwrap();
    let Some(client) = mqtt.as_mut() else {
        return;
    };

    let user_version = state
        .store
        .load_user_string("userVersion")
        .unwrap_or_else(|| "1.0".to_string());
    if let Err(err) = client.publish(
        &settings.will_topic(),
        QoS::AtLeastOnce,
        true,
        birth_payload(&user_version, SERVER_VERSION).as_bytes(),
    ) {
        warn!("mqtt birth publish failed: {err:?}");
    }
    if !settings.command_topic.is_empty() {
        if let Err(err) = client.subscribe(settings.command_topic.as_str(), QoS::AtMostOnce) {
            warn!("mqtt command topic subscribe failed: {err:?}");
        }
    }
}

fn spawn_mqtt_receiver(state: SharedState, mut connection: EspMqttConnection) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match connection.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.link.lock().unwrap().handle_event(LinkEvent::MqttConnected);
                        announce_birth(&state);
                    }
                    EventPayload::Disconnected => {
                        state
                            .link
                            .lock()
                            .unwrap()
                            .handle_event(LinkEvent::MqttDisconnected);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {topic} ({} bytes)",
                                data.len()
                            );
                            continue;
                        }
                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&state, topic, message);
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state
                        .link
                        .lock()
                        .unwrap()
                        .handle_event(LinkEvent::MqttDisconnected);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_mqtt_message(state: &SharedState, topic: &str, message: &str) {
    let settings = state.mqtt_settings.lock().unwrap().clone();
    if !settings.command_topic.is_empty() && topic == settings.command_topic {
        execute_command(state, message.trim(), CommandSource::Mqtt);
    } else {
        info!("mqtt message on {topic}: {message}");
    }
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

    dispatcher.set_heap_provider(|| free_heap().to_string());
    dispatcher
}

fn execute_command(state: &SharedState, command: &str, source: CommandSource) {
    if command.is_empty() {
        return;
    }
    let output = state.dispatcher.lock().unwrap().execute(command);
    for line in &output.lines {
        info!("[{source:?}] {line}");
    }
    for effect in &output.effects {
        match effect {
            CommandEffect::Restart => restart_device(),
            CommandEffect::TraceLevelChanged(level) => info!("trace level is now {level}"),
        }
    }
}

// ---- periodic tick ----

fn spawn_tick_loop(state: SharedState, sntp: Arc<EspSntp<'static>>) {
    thread::Builder::new()
        .name("tick".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            // The tick thread is the watchdog subscriber; a missed feed means
            // the loop stalled and the watchdog panics the device.
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("watchdog subscription failed: {err:?}");
            }
            loop {
                thread::sleep(Duration::from_secs(1));
                if state.dispatcher.lock().unwrap().flags().watchdog {
                    feed_watchdog();
                }
                let actions = state.link.lock().unwrap().tick_second();
                for action in actions {
                    match action {
                        LinkAction::SyncNtp => {
                            if sntp.get_sync_status() == SyncStatus::Completed {
                                state.link.lock().unwrap().handle_event(LinkEvent::NtpSynced);
                                *state.last_ntp_sync.lock().unwrap() = Some(Utc::now());
                            }
                        }
                        // SNTP and the MQTT client resync on their own; the
                        // supervisor's cadence is logged for diagnostics.
                        other => info!("link action due: {other:?}"),
                    }
                }
            }
        })
        .expect("failed to spawn tick thread");
}

// ---- HTTP helpers ----

fn write_plain(req: HttpRequest, status: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_html(req: HttpRequest, body: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "text/html")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json_text(req: HttpRequest, body: &str) -> anyhow::Result<()> {
    req.into_response(200, Some("OK"), &[("Content-Type", "application/json")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn request_authentication(req: HttpRequest) -> anyhow::Result<()> {
    req.into_response(
        401,
        Some("Unauthorized"),
        &[("WWW-Authenticate", "Basic realm=\"webnode\"")],
    )?
    .write_all(b"Unauthorized")?;
    Ok(())
}

fn auth_ok(state: &SharedState, req: &HttpRequest) -> bool {
    let auth = state.auth.lock().unwrap().clone();
    if !auth.auth {
        return true;
    }
    if let Some(value) = req.header("Authorization") {
        if let Some(encoded) = value.strip_prefix("Basic ") {
            if let Ok(decoded) = BASE64.decode(encoded.trim()) {
                return decoded == format!("{}:{}", auth.user, auth.pass).into_bytes();
            }
        }
    }
    false
}

fn read_request_body(req: &mut HttpRequest) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }
    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

/// Query string plus urlencoded body args, decoded.
fn request_args(req: &mut HttpRequest) -> anyhow::Result<Vec<(String, String)>> {
    let uri = req.uri().to_string();
    let mut args = Vec::new();
    if let Some((_, query)) = uri.split_once('?') {
        args.extend(urlcodec::parse_query(query, true));
    }
    let body = read_request_body(req)?;
    if !body.is_empty() {
        args.extend(urlcodec::parse_query(&String::from_utf8_lossy(&body), true));
    }
    Ok(args)
}

/// Minimal multipart/form-data extraction: the first file part's name and
/// content. Enough for the editor upload and the firmware upload forms.
fn parse_multipart(content_type: &str, body: &[u8]) -> Option<(String, Vec<u8>)> {
    let boundary = content_type.split_once("boundary=")?.1.trim();
    let delimiter = format!("--{boundary}");
    let data = body;

    let mut offset = 0;
    while let Some(start) = find(&data[offset..], delimiter.as_bytes()) {
        let part_start = offset + start + delimiter.len();
        let Some(header_end) = find(&data[part_start..], b"\r\n\r\n") else {
            break;
        };
        let headers = String::from_utf8_lossy(&data[part_start..part_start + header_end]);
        let body_start = part_start + header_end + 4;
        let body_end = find(&data[body_start..], delimiter.as_bytes())
            .map(|next| body_start + next)
            .unwrap_or(data.len());

        if let Some(name) = headers
            .split("filename=\"")
            .nth(1)
            .and_then(|rest| rest.split('"').next())
        {
            if !name.is_empty() {
                // Strip the trailing CRLF before the next delimiter.
                let content = data[body_start..body_end]
                    .strip_suffix(b"\r\n")
                    .unwrap_or(&data[body_start..body_end]);
                return Some((name.to_string(), content.to_vec()));
            }
        }
        offset = body_end;
    }
    None
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn is_protected(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    matches!(name, SECRET_FILE | CONFIG_FILE | USER_CONFIG_FILE)
}

/// Serve a file from the data partition, preferring a `.gz` sibling.
/// Answers with 404 when nothing matches.
fn serve_file(req: HttpRequest, path: &str, download: bool) -> anyhow::Result<()> {
    if path.contains("..") || is_protected(path) {
        return write_plain(req, 403, "Forbidden");
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

    let full = format!("{DATA_MOUNT}/www/{path}");
    let gz = format!("{full}.gz");

    if let Ok(body) = std::fs::read(&gz) {
        req.into_response(
            200,
            Some("OK"),
            &[("Content-Type", content_type), ("Content-Encoding", "gzip")],
        )?
        .write_all(&body)?;
        return Ok(());
    }
    if let Ok(body) = std::fs::read(&full) {
        req.into_response(200, Some("OK"), &[("Content-Type", content_type)])?
            .write_all(&body)?;
        return Ok(());
    }
    write_plain(req, 404, "FileNotFound")
}

// ---- HTTP server ----

macro_rules! authed {
    ($state:ident, $req:ident) => {
        if !auth_ok(&$state, &$req) {
            return request_authentication($req);
        }
    };
}

fn handle_network_form(state: &SharedState, mut req: HttpRequest) -> anyhow::Result<()> {
    authed!(state, req);
    let args = request_args(&mut req)?;
    if args.is_empty() {
        return serve_file(req, "/config.html", false);
    }
    let mut network = state.network.lock().unwrap();
    pages::apply_network_args(&mut network, &args);
    state.store.save_network(&network)?;
    drop(network);
    write_html(req, pages::PAGE_WAIT_AND_RELOAD)?;
    restart_device();
}

fn handle_general_form(state: &SharedState, mut req: HttpRequest) -> anyhow::Result<()> {
    authed!(state, req);
    let args = request_args(&mut req)?;
    if args.is_empty() {
        return serve_file(req, "/general.html", false);
    }
    let mut network = state.network.lock().unwrap();
    pages::apply_general_args(&mut network, &args);
    state.store.save_network(&network)?;
    drop(network);
    write_html(req, pages::PAGE_RESTART)?;
    restart_device();
}

fn handle_ntp_form(state: &SharedState, mut req: HttpRequest) -> anyhow::Result<()> {
    authed!(state, req);
    let args = request_args(&mut req)?;
    if !args.is_empty() {
        let mut network = state.network.lock().unwrap();
        pages::apply_ntp_args(&mut network, &args);
        state.store.save_network(&network)?;
        let period = network.ntp_period_minutes;
        drop(network);
        state.link.lock().unwrap().set_ntp_period_minutes(period);
    }
    serve_file(req, "/ntp.html", false)
}

fn handle_auth_form(state: &SharedState, mut req: HttpRequest) -> anyhow::Result<()> {
    authed!(state, req);
    let args = request_args(&mut req)?;
    if !args.is_empty() {
        let mut auth = state.auth.lock().unwrap();
        pages::apply_auth_args(&mut auth, &args);
        state.store.save_auth(&auth)?;
    }
    serve_file(req, "/system.html", false)
}

fn handle_set_md5(state: &SharedState, mut req: HttpRequest) -> anyhow::Result<()> {
    authed!(state, req);
    let args = request_args(&mut req)?;
    let mut update = state.update.lock().unwrap();
    update.expected_md5.clear();
    update.expected_size = 0;
    for (name, value) in &args {
        match name.as_str() {
            "md5" => update.expected_md5 = value.to_ascii_lowercase(),
            "size" => update.expected_size = value.trim().parse().unwrap_or(0),
            _ => {}
        }
    }
    let message = format!("OK --> MD5: {}", update.expected_md5);
    drop(update);
    write_html(req, &message)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/list", Method::Get, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let Some(dir) = uri
                .split_once('?')
                .map(|(_, q)| urlcodec::parse_query(q, true))
                .and_then(|args| args.into_iter().find(|(n, _)| n == "dir").map(|(_, v)| v))
            else {
                return write_plain(req, 500, "BAD ARGS");
            };

            let base = format!("{DATA_MOUNT}/www/{}", dir.trim_start_matches('/'));
            let mut entries = Vec::new();
            if let Ok(reader) = std::fs::read_dir(&base) {
                for entry in reader.flatten() {
                    let kind = match entry.file_type() {
                        Ok(ft) if ft.is_dir() => "dir",
                        _ => "file",
                    };
                    entries.push(serde_json::json!({
                        "type": kind,
                        "name": entry.file_name().to_string_lossy(),
                    }));
                }
            }
            write_json_text(req, &serde_json::Value::Array(entries).to_string())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/edit", Method::Get, move |req| {
            authed!(state, req);
            serve_file(req, "/edit.html", false)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/edit", Method::Put, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let args = uri
                .split_once('?')
                .map(|(_, q)| urlcodec::parse_query(q, true))
                .unwrap_or_default();
            let Some(path) = urlcodec::arg_or_first(&args, "path").map(str::to_string) else {
                return write_plain(req, 500, "BAD ARGS");
            };
            if path == "/" {
                return write_plain(req, 500, "BAD PATH");
            }
            let full = format!("{DATA_MOUNT}/www/{}", path.trim_start_matches('/'));
            if std::path::Path::new(&full).exists() {
                return write_plain(req, 500, "FILE EXISTS");
            }
            match std::fs::write(&full, b"") {
                Ok(()) => write_plain(req, 200, ""),
                Err(_) => write_plain(req, 500, "CREATE FAILED"),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/edit", Method::Delete, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let args = uri
                .split_once('?')
                .map(|(_, q)| urlcodec::parse_query(q, true))
                .unwrap_or_default();
            let Some(path) = urlcodec::arg_or_first(&args, "path").map(str::to_string) else {
                return write_plain(req, 500, "BAD ARGS");
            };
            let full = format!("{DATA_MOUNT}/www/{}", path.trim_start_matches('/'));
            if !std::path::Path::new(&full).exists() {
                return write_plain(req, 404, "FileNotFound");
            }
            match std::fs::remove_file(&full) {
                Ok(()) => write_plain(req, 200, ""),
                Err(err) => write_plain(req, 500, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/edit", Method::Post, move |mut req| {
            authed!(state, req);
            let content_type = req.header("Content-Type").unwrap_or("").to_string();
            let body = read_request_body(&mut req)?;
            match parse_multipart(&content_type, &body) {
                Some((filename, data)) => {
                    let full = format!("{DATA_MOUNT}/www/{}", filename.trim_start_matches('/'));
                    std::fs::write(&full, &data)?;
                    info!(
                        "uploaded {filename} ({})",
                        urlcodec::format_bytes(data.len() as u64)
                    );
                    write_plain(req, 200, "")
                }
                None => write_plain(req, 500, "BAD ARGS"),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin", Method::Get, move |req| {
            authed!(state, req);
            serve_file(req, "/admin.html", false)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/generalvalues", Method::Get, move |req| {
            authed!(state, req);
            let network = state.network.lock().unwrap();
            write_plain(
                req,
                200,
                &pages::general_values(&network.device_name, SERVER_VERSION),
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/values", Method::Get, move |req| {
            authed!(state, req);
            let network = state.network.lock().unwrap();
            write_plain(req, 200, &pages::network_values(&network))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/connectionstate", Method::Get, move |req| {
            authed!(state, req);
            let status = state.link.lock().unwrap().status();
            let text = match status {
                WifiStatus::Connected => "CONNECTED",
                WifiStatus::Connecting => "DISCONNECTED",
                WifiStatus::ApMode => "AP MODE",
            };
            write_plain(req, 200, &pages::connection_state_value(text))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/infovalues", Method::Get, move |req| {
            authed!(state, req);
            write_plain(req, 200, &pages::info_values(&info_snapshot(&state)))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/ntpvalues", Method::Get, move |req| {
            authed!(state, req);
            let network = state.network.lock().unwrap();
            write_plain(req, 200, &pages::ntp_values(&network))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/wwwauth", Method::Get, move |req| {
            authed!(state, req);
            let auth = state.auth.lock().unwrap();
            write_plain(req, 200, &pages::auth_values(&auth))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/admin/restart", Method::Get, move |req| {
            authed!(state, req);
            write_html(req, pages::PAGE_RESTART)?;
            restart_device();
        })?;
    }

    // The config forms submit via GET or POST depending on the page, so each
    // route answers both methods with the same handler.
    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/config.html", method, move |req| {
            handle_network_form(&state, req)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/general.html", method, move |req| {
            handle_general_form(&state, req)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/ntp.html", method, move |req| {
            handle_ntp_form(&state, req)
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/system.html", method, move |req| {
            handle_auth_form(&state, req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/scan", Method::Get, move |req| {
            let mut out = String::from("[");
            match state.wifi.lock().unwrap().scan() {
                Ok(points) => {
                    for (i, ap) in points.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        let bssid = ap
                            .bssid
                            .iter()
                            .map(|b| format!("{b:02X}"))
                            .collect::<Vec<_>>()
                            .join(":");
                        let _ = write!(
                            out,
                            "{{\"rssi\":{},\"ssid\":\"{}\",\"bssid\":\"{}\",\"channel\":{},\"secure\":{},\"hidden\":false}}",
                            ap.signal_strength,
                            ap.ssid,
                            bssid,
                            ap.channel,
                            u8::from(ap.auth_method.is_some() && ap.auth_method != Some(AuthMethod::None)),
                        );
                    }
                }
                Err(err) => warn!("wifi scan failed: {err:?}"),
            }
            out.push(']');
            write_json_text(req, &out)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/update/updatepossible", Method::Get, move |req| {
            authed!(state, req);
            let update = state.update.lock().unwrap();
            let possible = EspOta::new().is_ok();
            write_plain(
                req,
                200,
                &pages::update_possible_values(possible, update.last_error.as_deref()),
            )
        })?;
    }

    for method in [Method::Get, Method::Post] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/setmd5", method, move |req| {
            handle_set_md5(&state, req)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/update", Method::Get, move |req| {
            authed!(state, req);
            serve_file(req, "/update.html", false)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/update", Method::Post, move |mut req| {
            authed!(state, req);
            match apply_firmware_upload(&state, &mut req) {
                Ok(()) => {
                    write_html(req, pages::PAGE_UPDATE_OK)?;
                    restart_device();
                }
                Err(err) => {
                    warn!("firmware update failed: {err:#}");
                    state.update.lock().unwrap().last_error = Some(format!("{err:#}"));
                    write_plain(req, 200, "FAIL")
                }
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/rconfig/*", Method::Get, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let path = uri.split('?').next().unwrap_or("");
            let names = path.trim_start_matches("/rconfig/");
            let mut out = String::new();
            for segment in names.split('/').filter(|s| !s.is_empty()) {
                let (name, kind) = pages::rconfig_kind(segment);
                let value = state.store.load_user_string(name).unwrap_or_default();
                out.push_str(&pages::pipe_line(name, &value, kind));
            }
            write_plain(req, 200, &out)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/pconfig", Method::Post, move |mut req| {
            authed!(state, req);
            let args = request_args(&mut req)?;
            let mut target = "/".to_string();
            for (name, value) in &args {
                if name == "afterpost" {
                    target = value.clone();
                } else {
                    state.store.save_user_value(name, value)?;
                }
            }

            match state.store.mqtt_settings(state.chip_id) {
                Ok(settings) => {
                    state
                        .link
                        .lock()
                        .unwrap()
                        .set_mqtt_initialized(settings.is_complete());
                    *state.mqtt_settings.lock().unwrap() = settings;
                }
                Err(err) => warn!("failed to reload MQTT settings: {err}"),
            }

            req.into_response(302, Some("Found"), &[("Location", target.as_str())])?
                .write_all(b"")?;
            Ok(())
        })?;
    }

    for path in ["/json", "/post"] {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let path = uri.split('?').next().unwrap_or(&uri).to_string();
            write_plain(req, 400, &format!("Can't understand: {path}\n"))
        })?;
    }

    // `/rest` stays reachable without credentials for unattended clients.
    server.fn_handler::<anyhow::Error, _>("/rest", Method::Get, move |req| {
        let uri = req.uri().to_string();
        let path = uri.split('?').next().unwrap_or(&uri).to_string();
        write_plain(req, 400, &format!("Can't understand: {path}\n"))
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/events", Method::Get, move |req| {
            let mut resp = req.into_response(
                200,
                Some("OK"),
                &[
                    ("Content-Type", "text/event-stream"),
                    ("Cache-Control", "no-cache"),
                ],
            )?;
            // The httpd dispatches every route on one server task, so the
            // stream must not hold it forever. Send a bounded burst of clock
            // records and close; EventSource reconnects on its own.
            for _ in 0..SSE_EVENTS_PER_CONNECTION {
                let now = Utc::now();
                let last_sync = state
                    .last_ntp_sync
                    .lock()
                    .unwrap()
                    .map(|at| at.format("%H:%M:%S %d/%m/%Y").to_string())
                    .unwrap_or_default();
                let uptime_secs = (now - state.started_at).num_seconds().max(0);
                let payload = serde_json::json!({
                    "time": now.format("%H:%M:%S").to_string(),
                    "date": now.format("%d/%m/%Y").to_string(),
                    "lastSync": last_sync,
                    "uptime": format!(
                        "{}d {:02}:{:02}:{:02}",
                        uptime_secs / 86_400,
                        (uptime_secs % 86_400) / 3_600,
                        (uptime_secs % 3_600) / 60,
                        uptime_secs % 60
                    ),
                    "lastBoot": state.started_at.format("%H:%M:%S %d/%m/%Y").to_string(),
                });
                let frame = format!("event: timeDate\ndata: {payload}\n\n");
                if resp.write_all(frame.as_bytes()).is_err() {
                    break;
                }
                if resp.flush().is_err() {
                    break;
                }
                thread::sleep(Duration::from_secs(1));
            }
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/all", Method::Get, move |req| {
        let body = serde_json::json!({
            "heap": free_heap(),
            "analog": 0,
            "gpio": 0,
        });
        write_json_text(req, &body.to_string())
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/*", Method::Get, move |req| {
            authed!(state, req);
            let uri = req.uri().to_string();
            let (path, query) = match uri.split_once('?') {
                Some((path, query)) => (path.to_string(), Some(query.to_string())),
                None => (uri.clone(), None),
            };
            let download = query
                .as_deref()
                .map(|q| urlcodec::parse_query(q, true).iter().any(|(n, _)| n == "download"))
                .unwrap_or(false);
            serve_file(req, &path, download)
        })?;
    }

    info!("HTTP server started");
    Ok(server)
}

fn apply_firmware_upload(state: &SharedState, req: &mut HttpRequest) -> anyhow::Result<()> {
    let (expected_md5, expected_size) = {
        let update = state.update.lock().unwrap();
        (update.expected_md5.clone(), update.expected_size)
    };

    // `\r\n--<boundary>` marks the end of the file content inside the
    // multipart body; everything before the first blank line is part headers.
    let boundary = req
        .header("Content-Type")
        .and_then(|ct| ct.split_once("boundary=").map(|(_, b)| b.trim().to_string()))
        .ok_or_else(|| anyhow!("missing multipart boundary"))?;
    let delimiter = format!("\r\n--{boundary}").into_bytes();

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut slot = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Md5::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::with_capacity(2 * OTA_CHUNK_SIZE);
    let mut in_content = false;
    let mut done = false;

    loop {
        let read = req.read(&mut chunk).map_err(|err| anyhow!("{err:?}"))?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);

        if !in_content {
            if let Some(at) = find(&pending, b"\r\n\r\n") {
                pending.drain(..at + 4);
                in_content = true;
            } else {
                continue;
            }
        }

        if let Some(at) = find(&pending, &delimiter) {
            pending.truncate(at);
            done = true;
        }

        // Hold back a delimiter's worth of bytes so one split across reads
        // is still caught.
        let flush = if done {
            pending.len()
        } else {
            pending.len().saturating_sub(delimiter.len())
        };
        if flush > 0 {
            slot.write(&pending[..flush])
                .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
            hasher.update(&pending[..flush]);
            total_written += flush as u64;
            pending.drain(..flush);
        }
        if done {
            break;
        }
    }

    if !done && in_content && !pending.is_empty() {
        if let Some(at) = find(&pending, &delimiter) {
            pending.truncate(at);
        }
        slot.write(&pending)
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&pending);
        total_written += pending.len() as u64;
    }

    if total_written == 0 {
        let _ = slot.abort();
        return Err(anyhow!("empty firmware upload"));
    }
    if expected_size != 0 && total_written != expected_size {
        let _ = slot.abort();
        return Err(anyhow!(
            "firmware size mismatch: got {total_written}, expected {expected_size} bytes"
        ));
    }

    let digest = format!("{:x}", hasher.finalize());
    if !expected_md5.is_empty() && digest != expected_md5 {
        let _ = slot.abort();
        return Err(anyhow!("MD5 mismatch (expected {expected_md5}, got {digest})"));
    }

    slot.complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    state.update.lock().unwrap().last_error = None;
    info!(
        "firmware update written ({})",
        urlcodec::format_bytes(total_written)
    );
    Ok(())
}

fn info_snapshot(state: &SharedState) -> InfoSnapshot {
    let network = state.network.lock().unwrap().clone();
    let (mut ip, mut gateway, netmask, dns) = pages::static_info(&network);
    if let Ok(info) = state.wifi.lock().unwrap().sta_netif().get_ip_info() {
        ip = info.ip.to_string();
        gateway = info.subnet.gateway.to_string();
    }
    let now = Utc::now();
    let uptime = {
        let total = (now - state.started_at).num_seconds().max(0);
        format!(
            "{}d {:02}:{:02}:{:02}",
            total / 86_400,
            (total % 86_400) / 3_600,
            (total % 3_600) / 60,
            total % 60
        )
    };
    InfoSnapshot {
        ssid: network.ssid,
        ip,
        gateway,
        netmask,
        mac: format_mac(),
        dns,
        ntp_last_sync: state
            .last_ntp_sync
            .lock()
            .unwrap()
            .map(|at| at.format("%H:%M:%S %d/%m/%Y").to_string())
            .unwrap_or_default(),
        ntp_time: now.format("%H:%M:%S").to_string(),
        ntp_date: now.format("%d/%m/%Y").to_string(),
        uptime,
        last_boot: state.started_at.format("%H:%M:%S %d/%m/%Y").to_string(),
    }
}
