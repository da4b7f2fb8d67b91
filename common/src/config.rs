use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";
pub const DEFAULT_DEVICE_NAME: &str = "BedJet";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub mac: String,
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac: String::new(),
            name: DEFAULT_DEVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkConfig {
    pub max_attempts: u32,
    pub admission_wait_ms: u64,
    pub scan_window_ms: u64,
    pub scan_passes: u32,
    pub scan_retry_backoff_ms: u64,
    pub fallback_backoff_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub endpoint_backoff_ms: u64,
    pub liveness_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            admission_wait_ms: 4_000,
            scan_window_ms: 10_000,
            scan_passes: 2,
            scan_retry_backoff_ms: 250,
            fallback_backoff_ms: 350,
            reconnect_backoff_ms: 900,
            endpoint_backoff_ms: 450,
            liveness_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct AutomationConfig {
    pub tick_interval_ms: u64,
    pub status_stale_ms: u64,
    pub settle_ms: u64,
    pub clock_sync_gap_ms: u64,
    pub mode_gap_ms: u64,
    pub command_gap_ms: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2_000,
            status_stale_ms: 5_000,
            settle_ms: 250,
            clock_sync_gap_ms: 40,
            mode_gap_ms: 80,
            command_gap_ms: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub device: DeviceConfig,
    pub timezone: String,
    pub schedules_paused: bool,
    pub link: LinkConfig,
    pub automation: AutomationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            schedules_paused: false,
            link: LinkConfig::default(),
            automation: AutomationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.device.sanitize();
        if parse_timezone(&self.timezone).is_none() {
            self.timezone = DEFAULT_TIMEZONE.to_string();
        }
        self.link.sanitize();
        self.automation.sanitize();
    }

    pub fn tz(&self) -> Tz {
        parse_timezone(&self.timezone).unwrap_or(chrono_tz::America::Los_Angeles)
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.mac = normalize_mac(&self.mac);
        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            self.name = DEFAULT_DEVICE_NAME.to_string();
        }
    }
}

impl LinkConfig {
    pub fn sanitize(&mut self) {
        self.max_attempts = self.max_attempts.clamp(1, 20);
        self.admission_wait_ms = self.admission_wait_ms.clamp(100, 30_000);
        self.scan_window_ms = self.scan_window_ms.clamp(500, 60_000);
        self.scan_passes = self.scan_passes.clamp(1, 5);
        self.scan_retry_backoff_ms = self.scan_retry_backoff_ms.min(10_000);
        self.fallback_backoff_ms = self.fallback_backoff_ms.min(10_000);
        self.reconnect_backoff_ms = self.reconnect_backoff_ms.min(30_000);
        self.endpoint_backoff_ms = self.endpoint_backoff_ms.min(10_000);
        self.liveness_interval_ms = self.liveness_interval_ms.clamp(100, 60_000);
    }
}

impl AutomationConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(250, 60_000);
        self.status_stale_ms = self.status_stale_ms.clamp(500, 60_000);
        self.settle_ms = self.settle_ms.min(5_000);
        self.clock_sync_gap_ms = self.clock_sync_gap_ms.min(5_000);
        self.mode_gap_ms = self.mode_gap_ms.min(5_000);
        self.command_gap_ms = self.command_gap_ms.min(5_000);
    }
}

pub fn parse_timezone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Canonical `AA:BB:CC:DD:EE:FF` form. Input that does not hold exactly twelve hex digits is
/// returned trimmed and upper-cased so the operator can see what was entered.
pub fn normalize_mac(input: &str) -> String {
    let hex: Vec<char> = input
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect();

    if hex.len() != 12 || !hex.iter().all(char::is_ascii_hexdigit) {
        return input.trim().to_ascii_uppercase();
    }

    hex.chunks(2)
        .map(|pair| pair.iter().collect::<String>().to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(":")
}

pub fn is_mac_likely_valid(mac: &str) -> bool {
    let bytes: Vec<&str> = mac.split(':').collect();
    bytes.len() == 6
        && bytes
            .iter()
            .all(|b| b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit()))
        && mac != "00:00:00:00:00:00"
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalizes_mac_spellings() {
        assert_eq!(normalize_mac("aabbccddeeff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac("aa-bb-cc-dd-ee-ff"), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac(" aa:bb:cc:dd:ee:ff "), "AA:BB:CC:DD:EE:FF");
        assert_eq!(normalize_mac("not a mac"), "NOT A MAC");
        assert_eq!(normalize_mac(""), "");
    }

    #[test]
    fn mac_validity() {
        assert!(is_mac_likely_valid("AA:BB:CC:DD:EE:FF"));
        assert!(!is_mac_likely_valid("AA:BB:CC:DD:EE"));
        assert!(!is_mac_likely_valid("00:00:00:00:00:00"));
        assert!(!is_mac_likely_valid(""));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"device":{"mac":"aabbccddeeff"},"link":{"maxAttempts":3},"schedulesPaused":true}"#,
        )
        .unwrap();

        assert_eq!(config.device.name, DEFAULT_DEVICE_NAME);
        assert_eq!(config.link.max_attempts, 3);
        assert_eq!(config.link.reconnect_backoff_ms, 900);
        assert_eq!(config.automation, AutomationConfig::default());
        assert!(config.schedules_paused);
    }

    #[test]
    fn sanitize_repairs_values() {
        let mut config = RuntimeConfig {
            device: DeviceConfig {
                mac: "aa-bb-cc-dd-ee-ff".to_string(),
                name: "   ".to_string(),
            },
            timezone: "Mars/Olympus".to_string(),
            ..RuntimeConfig::default()
        };
        config.link.max_attempts = 0;
        config.automation.tick_interval_ms = 1;

        config.sanitize();

        assert_eq!(config.device.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.device.name, DEFAULT_DEVICE_NAME);
        assert_eq!(config.timezone, DEFAULT_TIMEZONE);
        assert_eq!(config.link.max_attempts, 1);
        assert_eq!(config.automation.tick_interval_ms, 250);
    }

    #[test]
    fn keeps_known_timezone() {
        let mut config = RuntimeConfig {
            timezone: "Europe/Berlin".to_string(),
            ..RuntimeConfig::default()
        };
        config.sanitize();
        assert_eq!(config.tz(), chrono_tz::Europe::Berlin);
    }
}
