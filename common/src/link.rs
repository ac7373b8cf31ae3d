//! Connectivity supervision policy.
//!
//! The platform layers own the actual WiFi, SNTP and MQTT clients; this
//! supervisor only decides *when* things should happen. It is driven by a
//! one-second tick plus link events, and answers with action lists, so the
//! whole policy is testable with a counter for a clock.

pub const AP_FALLBACK_TIMEOUT_SECS: u64 = 30;
pub const MQTT_RETRY_SECS: u64 = 30;
pub const NTP_INITIAL_RETRY_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiStatus {
    Connecting,
    Connected,
    ApMode,
}

/// Link events reported by the platform layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    WifiConnected,
    WifiGotIp,
    WifiDisconnected,
    NtpSynced,
    MqttConnected,
    MqttDisconnected,
}

/// Actions the platform layer must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    /// Station never came up inside the timeout; switch to the setup AP.
    StartAccessPoint,
    ConnectMqtt,
    SyncNtp,
}

#[derive(Debug)]
pub struct LinkSupervisor {
    status: WifiStatus,
    now_secs: u64,
    connecting_secs: u64,
    ap_timeout_secs: u64,

    has_ip: bool,
    disconnected_at: Option<u64>,

    mqtt_initialized: bool,
    mqtt_connected: bool,
    last_mqtt_attempt: Option<u64>,

    ntp_period_secs: u64,
    ntp_requested: bool,
    ntp_synced: bool,
    last_ntp_attempt: Option<u64>,
}

impl LinkSupervisor {
    /// `ntp_period_minutes` of zero disables NTP scheduling.
    pub fn new(start_in_ap: bool, ntp_period_minutes: i64) -> Self {
        Self {
            status: if start_in_ap {
                WifiStatus::ApMode
            } else {
                WifiStatus::Connecting
            },
            now_secs: 0,
            connecting_secs: 0,
            ap_timeout_secs: AP_FALLBACK_TIMEOUT_SECS,
            has_ip: false,
            disconnected_at: None,
            mqtt_initialized: false,
            mqtt_connected: false,
            last_mqtt_attempt: None,
            ntp_period_secs: ntp_period_minutes.max(0) as u64 * 60,
            ntp_requested: false,
            ntp_synced: false,
            last_ntp_attempt: None,
        }
    }

    pub fn set_ap_timeout_secs(&mut self, secs: u64) {
        self.ap_timeout_secs = secs;
    }

    /// Applies a changed NTP resync period without waiting for a restart.
    pub fn set_ntp_period_minutes(&mut self, minutes: i64) {
        self.ntp_period_secs = minutes.max(0) as u64 * 60;
        if self.ntp_period_secs == 0 {
            self.ntp_requested = false;
        } else if self.has_ip {
            self.ntp_requested = true;
        }
    }

    pub fn set_mqtt_initialized(&mut self, initialized: bool) {
        self.mqtt_initialized = initialized;
        if !initialized {
            self.mqtt_connected = false;
        }
    }

    pub fn status(&self) -> WifiStatus {
        self.status
    }

    pub fn has_ip(&self) -> bool {
        self.has_ip
    }

    pub fn ntp_synced(&self) -> bool {
        self.ntp_synced
    }

    /// Seconds the station link has been down, for diagnostics.
    pub fn disconnected_for_secs(&self) -> Option<u64> {
        self.disconnected_at.map(|at| self.now_secs - at)
    }

    pub fn handle_event(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        let mut actions = Vec::new();
        match event {
            LinkEvent::WifiConnected => {
                // Once associated the driver reconnects on its own, so the
                // status never returns to Connecting.
                self.status = WifiStatus::Connected;
                self.connecting_secs = 0;
                self.disconnected_at = None;
            }
            LinkEvent::WifiGotIp => {
                self.has_ip = true;
                self.disconnected_at = None;
                if self.ntp_period_secs > 0 {
                    self.ntp_requested = true;
                    self.last_ntp_attempt = Some(self.now_secs);
                    actions.push(LinkAction::SyncNtp);
                }
            }
            LinkEvent::WifiDisconnected => {
                self.has_ip = false;
                if self.disconnected_at.is_none() {
                    self.disconnected_at = Some(self.now_secs);
                }
            }
            LinkEvent::NtpSynced => {
                self.ntp_synced = true;
                self.last_ntp_attempt = Some(self.now_secs);
            }
            LinkEvent::MqttConnected => {
                self.mqtt_connected = true;
            }
            LinkEvent::MqttDisconnected => {
                self.mqtt_connected = false;
            }
        }
        actions
    }

    pub fn tick_second(&mut self) -> Vec<LinkAction> {
        self.now_secs += 1;
        let mut actions = Vec::new();

        if self.status == WifiStatus::Connecting {
            self.connecting_secs += 1;
            if self.connecting_secs >= self.ap_timeout_secs {
                self.status = WifiStatus::ApMode;
                actions.push(LinkAction::StartAccessPoint);
                return actions;
            }
        }

        if self.mqtt_initialized && !self.mqtt_connected && self.has_ip {
            let due = match self.last_mqtt_attempt {
                None => true,
                Some(at) => self.now_secs - at >= MQTT_RETRY_SECS,
            };
            if due {
                self.last_mqtt_attempt = Some(self.now_secs);
                actions.push(LinkAction::ConnectMqtt);
            }
        }

        if self.ntp_requested && self.has_ip {
            let interval = if self.ntp_synced {
                self.ntp_period_secs
            } else {
                NTP_INITIAL_RETRY_SECS
            };
            let due = match self.last_ntp_attempt {
                None => true,
                Some(at) => self.now_secs - at >= interval,
            };
            if due {
                self.last_ntp_attempt = Some(self.now_secs);
                actions.push(LinkAction::SyncNtp);
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ticks(link: &mut LinkSupervisor, secs: u64) -> Vec<LinkAction> {
        let mut all = Vec::new();
        for _ in 0..secs {
            all.extend(link.tick_second());
        }
        all
    }

    #[test]
    fn falls_back_to_ap_when_station_never_connects() {
        let mut link = LinkSupervisor::new(false, 15);
        assert_eq!(ticks(&mut link, 29), vec![]);
        assert_eq!(link.tick_second(), vec![LinkAction::StartAccessPoint]);
        assert_eq!(link.status(), WifiStatus::ApMode);
        // The fallback fires once.
        assert_eq!(ticks(&mut link, 60), vec![]);
    }

    #[test]
    fn stays_connected_after_first_association() {
        let mut link = LinkSupervisor::new(false, 15);
        ticks(&mut link, 5);
        link.handle_event(LinkEvent::WifiConnected);
        link.handle_event(LinkEvent::WifiDisconnected);
        assert_eq!(link.status(), WifiStatus::Connected);
        assert_eq!(ticks(&mut link, 120), vec![]);
        assert_eq!(link.disconnected_for_secs(), Some(120));
    }

    #[test]
    fn mqtt_reconnects_are_rate_limited() {
        let mut link = LinkSupervisor::new(false, 0);
        link.handle_event(LinkEvent::WifiConnected);
        link.handle_event(LinkEvent::WifiGotIp);
        link.set_mqtt_initialized(true);

        assert_eq!(link.tick_second(), vec![LinkAction::ConnectMqtt]);
        assert_eq!(ticks(&mut link, 29), vec![]);
        assert_eq!(link.tick_second(), vec![LinkAction::ConnectMqtt]);

        link.handle_event(LinkEvent::MqttConnected);
        assert_eq!(ticks(&mut link, 120), vec![]);

        // A drop re-arms the retry schedule.
        link.handle_event(LinkEvent::MqttDisconnected);
        assert_eq!(ticks(&mut link, 30).last(), Some(&LinkAction::ConnectMqtt));
    }

    #[test]
    fn mqtt_waits_for_an_ip() {
        let mut link = LinkSupervisor::new(false, 0);
        link.set_mqtt_initialized(true);
        link.handle_event(LinkEvent::WifiConnected);
        assert_eq!(ticks(&mut link, 10), vec![]);
        link.handle_event(LinkEvent::WifiGotIp);
        assert_eq!(link.tick_second(), vec![LinkAction::ConnectMqtt]);
    }

    #[test]
    fn ntp_retries_fast_until_first_sync_then_uses_the_period() {
        let mut link = LinkSupervisor::new(false, 1);
        link.handle_event(LinkEvent::WifiConnected);
        let actions = link.handle_event(LinkEvent::WifiGotIp);
        assert_eq!(actions, vec![LinkAction::SyncNtp]);

        // Unsynced: retry every 15 seconds.
        assert_eq!(ticks(&mut link, 14), vec![]);
        assert_eq!(link.tick_second(), vec![LinkAction::SyncNtp]);

        link.handle_event(LinkEvent::NtpSynced);
        assert_eq!(ticks(&mut link, 59), vec![]);
        assert_eq!(link.tick_second(), vec![LinkAction::SyncNtp]);
    }

    #[test]
    fn zero_period_disables_ntp() {
        let mut link = LinkSupervisor::new(false, 0);
        link.handle_event(LinkEvent::WifiConnected);
        assert_eq!(link.handle_event(LinkEvent::WifiGotIp), vec![]);
        assert_eq!(ticks(&mut link, 300), vec![]);
    }

    #[test]
    fn boot_into_ap_mode_skips_the_station_timeout() {
        let mut link = LinkSupervisor::new(true, 15);
        assert_eq!(link.status(), WifiStatus::ApMode);
        assert_eq!(ticks(&mut link, 60), vec![]);
    }
}
