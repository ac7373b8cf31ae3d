//! Domoticz MQTT payload builders.
//!
//! Domoticz listens on `domoticz/in` for JSON commands. Payload layout
//! (including the spacing inside the inner command) matches what the
//! existing Domoticz flows expect. The battery level is a fixed 255
//! ("not available") since the host has no VCC reading.

pub const BATTERY_UNAVAILABLE: u8 = 255;

/// Map a WiFi RSSI reading in dBm to the 0..10 scale Domoticz displays.
pub fn map_rssi(rssi_dbm: i32) -> u8 {
    if rssi_dbm > -50 {
        return 10;
    }
    if rssi_dbm <= -98 {
        return 0;
    }
    ((rssi_dbm + 97) / 5 + 1) as u8
}

/// Wrap an inner command fragment into the full `domoticz/in` payload.
pub fn envelope(command: &str, rssi_dbm: i32) -> String {
    format!(
        "{{\"command\": {command}, \"rssi\": {}, \"battery\": {BATTERY_UNAVAILABLE}}}",
        map_rssi(rssi_dbm)
    )
}

pub fn switch_payload(idx: i32, is_on: bool, rssi_dbm: i32) -> String {
    let cmd = format!(
        "\"switchlight\", \"idx\": {idx}, \"switchcmd\": \"{}\"",
        if is_on { "On" } else { "Off" }
    );
    envelope(&cmd, rssi_dbm)
}

pub fn dimmer_payload(idx: i32, level: u8, rssi_dbm: i32) -> String {
    let cmd = format!("\"switchlight\", \"idx\": {idx}, \"switchcmd\":\"Set Level\", \"level\": {level}");
    envelope(&cmd, rssi_dbm)
}

/// Generic device update with nValue and a comma separated sValue.
pub fn values_payload(idx: i32, nvalue: i32, svalue: &str, rssi_dbm: i32) -> String {
    let cmd = format!("\"udevice\", \"idx\": {idx}, \"nvalue\": {nvalue}, \"svalue\": \"{svalue}\"");
    envelope(&cmd, rssi_dbm)
}

/// Energy meter update. Energy arrives in kWh and is reported in Wh.
pub fn power_payload(idx: i32, power_w: f64, energy_kwh: f64, rssi_dbm: i32) -> String {
    let svalue = format!("{power_w:.3};{:.3};0;0;0;0", energy_kwh * 1000.0);
    values_payload(idx, 0, &svalue, rssi_dbm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rssi_maps_to_domoticz_bars() {
        assert_eq!(map_rssi(-40), 10);
        assert_eq!(map_rssi(-98), 0);
        assert_eq!(map_rssi(-110), 0);
        assert_eq!(map_rssi(-97), 1);
        assert_eq!(map_rssi(-52), 10);
    }

    #[test]
    fn switch_payload_shape() {
        assert_eq!(
            switch_payload(12, true, -60),
            "{\"command\": \"switchlight\", \"idx\": 12, \"switchcmd\": \"On\", \"rssi\": 8, \"battery\": 255}"
        );
    }

    #[test]
    fn power_payload_converts_energy_to_wh() {
        let payload = power_payload(7, 1500.5, 2.5, -40);
        assert!(payload.contains("\"svalue\": \"1500.500;2500.000;0;0;0;0\""));
        assert!(payload.contains("\"nvalue\": 0"));
    }

    #[test]
    fn dimmer_payload_shape() {
        let payload = dimmer_payload(3, 42, -40);
        assert!(payload.contains("\"switchcmd\":\"Set Level\", \"level\": 42"));
    }
}
