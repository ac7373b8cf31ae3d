//! Admin page wire format.
//!
//! The bundled web pages fetch their values as plain text lines of
//! `name|value|kind`, where kind is `input`, `div` or `chk`. Form saves post
//! the same names back. Rendering and applying both live here so the host
//! and esp32 frontends share one implementation.

use crate::config::{format_ip, HttpAuthConfig, NetworkConfig};

/// Shown after a network config save; the page reloads once the device is
/// back up.
pub const PAGE_WAIT_AND_RELOAD: &str = "<meta http-equiv=\"refresh\" content=\"10; URL=/config.html\">\nPlease Wait....Configuring and Restarting.\n";

/// Shown after a general config save or an explicit restart.
pub const PAGE_RESTART: &str = "<meta http-equiv=\"refresh\" content=\"10; URL=/general.html\">\nPlease Wait....Configuring and Restarting.\n";

/// Shown when a firmware upload verified correctly.
pub const PAGE_UPDATE_OK: &str =
    "<META http-equiv=\"refresh\" content=\"15;URL=/update\">Update correct. Restarting...";

pub fn pipe_line(name: &str, value: &str, kind: &str) -> String {
    format!("{name}|{value}|{kind}\n")
}

fn checkbox(value: bool) -> &'static str {
    if value {
        "checked"
    } else {
        ""
    }
}

pub fn general_values(device_name: &str, server_version: &str) -> String {
    let mut out = pipe_line("devicename", device_name, "input");
    out.push_str(&pipe_line("userversion", server_version, "div"));
    out
}

pub fn network_values(config: &NetworkConfig) -> String {
    let mut out = pipe_line("ssid", &config.ssid, "input");
    out.push_str(&pipe_line("password", &config.password, "input"));
    for (prefix, octets) in [
        ("ip", &config.ip),
        ("nm", &config.netmask),
        ("gw", &config.gateway),
        ("dns", &config.dns),
    ] {
        for (i, octet) in octets.iter().enumerate() {
            out.push_str(&pipe_line(&format!("{prefix}_{i}"), &octet.to_string(), "input"));
        }
    }
    out.push_str(&pipe_line("dhcp", checkbox(config.dhcp), "chk"));
    out
}

pub fn ntp_values(config: &NetworkConfig) -> String {
    let mut out = pipe_line("ntpserver", &config.ntp_server, "input");
    out.push_str(&pipe_line("update", &config.ntp_period_minutes.to_string(), "input"));
    out.push_str(&pipe_line("tz", &config.timezone.to_string(), "input"));
    out.push_str(&pipe_line("dst", checkbox(config.daylight), "chk"));
    out
}

pub fn auth_values(auth: &HttpAuthConfig) -> String {
    let mut out = pipe_line("wwwauth", checkbox(auth.auth), "chk");
    out.push_str(&pipe_line("wwwuser", &auth.user, "input"));
    out.push_str(&pipe_line("wwwpass", &auth.pass, "input"));
    out
}

pub fn connection_state_value(state: &str) -> String {
    pipe_line("connectionstate", state, "div")
}

/// Live network and clock values for the information page.
#[derive(Debug, Default, Clone)]
pub struct InfoSnapshot {
    pub ssid: String,
    pub ip: String,
    pub gateway: String,
    pub netmask: String,
    pub mac: String,
    pub dns: String,
    pub ntp_last_sync: String,
    pub ntp_time: String,
    pub ntp_date: String,
    pub uptime: String,
    pub last_boot: String,
}

pub fn info_values(info: &InfoSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&pipe_line("x_ssid", &info.ssid, "div"));
    out.push_str(&pipe_line("x_ip", &info.ip, "div"));
    out.push_str(&pipe_line("x_gateway", &info.gateway, "div"));
    out.push_str(&pipe_line("x_netmask", &info.netmask, "div"));
    out.push_str(&pipe_line("x_mac", &info.mac, "div"));
    out.push_str(&pipe_line("x_dns", &info.dns, "div"));
    out.push_str(&pipe_line("x_ntp_sync", &info.ntp_last_sync, "div"));
    out.push_str(&pipe_line("x_ntp_time", &info.ntp_time, "div"));
    out.push_str(&pipe_line("x_ntp_date", &info.ntp_date, "div"));
    out.push_str(&pipe_line("x_uptime", &info.uptime, "div"));
    out.push_str(&pipe_line("x_last_boot", &info.last_boot, "div"));
    out
}

pub fn update_possible_values(possible: bool, last_error: Option<&str>) -> String {
    let mut out = pipe_line("remupd", if possible { "OK" } else { "ERROR" }, "div");
    out.push_str(&pipe_line("remupdResult", last_error.unwrap_or(""), "div"));
    out
}

/// Kind selection for `/rconfig/<name>` segments: a `i_`/`d_`/`c_` prefix
/// picks the rendered kind, default is `input`.
pub fn rconfig_kind(segment: &str) -> (&str, &'static str) {
    match segment.as_bytes() {
        [b'i', b'_', ..] => (&segment[2..], "input"),
        [b'd', b'_', ..] => (&segment[2..], "div"),
        [b'c', b'_', ..] => (&segment[2..], "chk"),
        _ => (segment, "input"),
    }
}

fn in_octet_range(value: &str) -> Option<u8> {
    value.trim().parse::<i64>().ok().and_then(|v| u8::try_from(v).ok())
}

fn apply_octet(target: &mut [u8; 4], index: usize, value: &str) {
    if let Some(octet) = in_octet_range(value) {
        target[index] = octet;
    }
}

/// Apply posted network form args. Checkbox semantics: the `dhcp` arg is
/// only present when checked, but a save carrying just `devicename` must
/// not clear it.
pub fn apply_network_args(config: &mut NetworkConfig, args: &[(String, String)]) {
    let old_dhcp = config.dhcp;
    config.dhcp = false;
    for (name, value) in args {
        match name.as_str() {
            "devicename" => {
                config.device_name = value.clone();
                config.dhcp = old_dhcp;
            }
            "ssid" => config.ssid = value.clone(),
            "password" => config.password = value.clone(),
            "dhcp" => config.dhcp = true,
            _ => {
                if let Some((prefix, index)) = name.split_once('_') {
                    if let Ok(index @ 0..=3) = index.parse::<usize>() {
                        match prefix {
                            "ip" => apply_octet(&mut config.ip, index, value),
                            "nm" => apply_octet(&mut config.netmask, index, value),
                            "gw" => apply_octet(&mut config.gateway, index, value),
                            "dns" => apply_octet(&mut config.dns, index, value),
                            _ => {}
                        }
                    }
                }
            }
        }
    }
}

pub fn apply_general_args(config: &mut NetworkConfig, args: &[(String, String)]) {
    for (name, value) in args {
        if name == "devicename" {
            config.device_name = value.clone();
        }
    }
}

pub fn apply_ntp_args(config: &mut NetworkConfig, args: &[(String, String)]) {
    config.daylight = false;
    for (name, value) in args {
        match name.as_str() {
            "ntpserver" => config.ntp_server = value.clone(),
            "update" => config.ntp_period_minutes = value.trim().parse().unwrap_or(0),
            "tz" => config.timezone = value.trim().parse().unwrap_or(0),
            "dst" => config.daylight = true,
            _ => {}
        }
    }
}

pub fn apply_auth_args(auth: &mut HttpAuthConfig, args: &[(String, String)]) {
    auth.auth = false;
    for (name, value) in args {
        match name.as_str() {
            "wwwuser" => auth.user = value.clone(),
            "wwwpass" => auth.pass = value.clone(),
            "wwwauth" => auth.auth = true,
            _ => {}
        }
    }
}

/// Information page IP fields for a config-derived (static) setup.
pub fn static_info(config: &NetworkConfig) -> (String, String, String, String) {
    (
        format_ip(&config.ip),
        format_ip(&config.gateway),
        format_ip(&config.netmask),
        format_ip(&config.dns),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn network_values_render_every_octet() {
        let rendered = network_values(&NetworkConfig::default());
        assert!(rendered.starts_with("ssid|WIFI_SSID|input\n"));
        assert!(rendered.contains("ip_3|4|input\n"));
        assert!(rendered.contains("nm_0|255|input\n"));
        assert!(rendered.ends_with("dhcp|checked|chk\n"));
    }

    #[test]
    fn ntp_values_round_trip_through_the_form() {
        let mut config = NetworkConfig::default();
        apply_ntp_args(
            &mut config,
            &args(&[("ntpserver", "time.nist.gov"), ("update", "30"), ("tz", "-25")]),
        );
        assert_eq!(config.ntp_server, "time.nist.gov");
        assert_eq!(config.ntp_period_minutes, 30);
        assert_eq!(config.timezone, -25);
        // Checkbox absent means daylight saving off.
        assert!(!config.daylight);

        let rendered = ntp_values(&config);
        assert!(rendered.contains("update|30|input\n"));
        assert!(rendered.contains("dst||chk\n"));
    }

    #[test]
    fn out_of_range_octets_are_ignored() {
        let mut config = NetworkConfig::default();
        apply_network_args(
            &mut config,
            &args(&[("ip_0", "300"), ("ip_1", "-1"), ("ip_2", "77")]),
        );
        assert_eq!(config.ip, [192, 168, 77, 4]);
    }

    #[test]
    fn device_name_save_preserves_dhcp() {
        let mut config = NetworkConfig::default();
        assert!(config.dhcp);
        apply_network_args(&mut config, &args(&[("devicename", "garage")]));
        assert_eq!(config.device_name, "garage");
        assert!(config.dhcp);

        // A full network save without the checkbox clears it.
        apply_network_args(&mut config, &args(&[("ssid", "net")]));
        assert!(!config.dhcp);
    }

    #[test]
    fn auth_args_follow_checkbox_semantics() {
        let mut auth = HttpAuthConfig::default();
        apply_auth_args(
            &mut auth,
            &args(&[("wwwauth", "checked"), ("wwwuser", "admin"), ("wwwpass", "pw")]),
        );
        assert!(auth.auth);
        assert_eq!(auth.user, "admin");

        apply_auth_args(&mut auth, &args(&[("wwwuser", "admin")]));
        assert!(!auth.auth);
    }

    #[test]
    fn rconfig_prefixes_select_the_kind() {
        assert_eq!(rconfig_kind("i_threshold"), ("threshold", "input"));
        assert_eq!(rconfig_kind("d_status"), ("status", "div"));
        assert_eq!(rconfig_kind("c_enabled"), ("enabled", "chk"));
        assert_eq!(rconfig_kind("plain"), ("plain", "input"));
    }

    #[test]
    fn update_values_report_capacity_and_error() {
        assert_eq!(
            update_possible_values(true, None),
            "remupd|OK|div\nremupdResult||div\n"
        );
        assert_eq!(
            update_possible_values(false, Some("md5 mismatch")),
            "remupd|ERROR|div\nremupdResult|md5 mismatch|div\n"
        );
    }
}
