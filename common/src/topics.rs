/// Subtopic carrying the last-will / birth state payloads.
pub const WILL_SUBTOPIC: &str = "LWT";

/// Retained payload published by the broker when the device drops off.
pub const WILL_PAYLOAD: &str = "{\"state\":\"down\"}";

/// Topic the Domoticz home automation bridge listens on.
pub const DOMOTICZ_IN_TOPIC: &str = "domoticz/in";

/// Join the configured root topic with a subtopic.
pub fn full_topic(root: &str, sub: &str) -> String {
    format!("{root}/{sub}")
}

pub fn will_topic(root: &str) -> String {
    full_topic(root, WILL_SUBTOPIC)
}

/// Retained birth message announcing the device and its versions.
pub fn birth_payload(user_version: &str, server_version: &str) -> String {
    format!("{{\"state\":\"up\",\"version\":\"{user_version}/{server_version}\"}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn will_topic_hangs_off_the_root() {
        assert_eq!(will_topic("myDevice"), "myDevice/LWT");
    }

    #[test]
    fn birth_payload_carries_both_versions() {
        assert_eq!(
            birth_payload("1.2.0", "0.1.0"),
            "{\"state\":\"up\",\"version\":\"1.2.0/0.1.0\"}"
        );
    }
}
