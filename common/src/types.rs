use std::{fmt, str::FromStr};

use chrono::Timelike;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{protocol::DeviceStatus, schedule::ScheduleEntry};

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "OFF")]
    Off,
    #[serde(rename = "HEAT")]
    Heat,
    #[serde(rename = "TURBO")]
    Turbo,
    #[serde(rename = "DRY")]
    Dry,
    #[serde(rename = "COOL")]
    Cool,
    #[serde(rename = "EXT-HEAT", alias = "EXTHT", alias = "EXT_HEAT")]
    ExtHeat,
}

impl Mode {
    pub const ALL: [Mode; 6] = [
        Self::Off,
        Self::Heat,
        Self::Turbo,
        Self::Dry,
        Self::Cool,
        Self::ExtHeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Heat => "HEAT",
            Self::Turbo => "TURBO",
            Self::Dry => "DRY",
            Self::Cool => "COOL",
            Self::ExtHeat => "EXT-HEAT",
        }
    }

    /// Button code the appliance expects in a `BUTTON` command.
    pub fn button(self) -> u8 {
        match self {
            Self::Off => 0x01,
            Self::Cool => 0x02,
            Self::Heat => 0x03,
            Self::Turbo => 0x04,
            Self::Dry => 0x05,
            Self::ExtHeat => 0x06,
        }
    }

    /// Maps the mode index reported at byte 9 of a status frame. Unknown values read as OFF.
    pub fn from_status_index(index: u8) -> Self {
        match index {
            1 => Self::Heat,
            2 => Self::Turbo,
            3 => Self::ExtHeat,
            4 => Self::Cool,
            5 => Self::Dry,
            _ => Self::Off,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode '{0}' (expected OFF, HEAT, TURBO, DRY, COOL or EXT-HEAT)")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "HEAT" => Ok(Self::Heat),
            "TURBO" => Ok(Self::Turbo),
            "DRY" => Ok(Self::Dry),
            "COOL" => Ok(Self::Cool),
            "EXT-HEAT" | "EXTHT" | "EXT_HEAT" => Ok(Self::ExtHeat),
            _ => Err(UnknownMode(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Linked,
}

impl LinkState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Linked => "LINKED",
        }
    }
}

/// Local wall-clock time of day at minute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LocalTime {
    pub hour: u8,
    pub minute: u8,
}

impl LocalTime {
    pub fn from_minute_of_day(minute_of_day: u16) -> Self {
        let minute_of_day = minute_of_day % MINUTES_PER_DAY;
        Self {
            hour: (minute_of_day / 60) as u8,
            minute: (minute_of_day % 60) as u8,
        }
    }

    pub fn from_chrono<T: Timelike>(time: &T) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    pub fn minute_of_day(self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }

    /// 12-hour rendering used by the state payload, e.g. `6:30 AM`.
    pub fn format_12h(self) -> String {
        let hour12 = match self.hour % 12 {
            0 => 12,
            h => h,
        };
        let suffix = if self.hour >= 12 { "PM" } else { "AM" };
        format!("{hour12}:{:02} {suffix}", self.minute)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleEntryView {
    #[serde(flatten)]
    pub entry: ScheduleEntry,
    pub start: String,
    pub stop: String,
}

impl From<&ScheduleEntry> for ScheduleEntryView {
    fn from(entry: &ScheduleEntry) -> Self {
        Self {
            entry: entry.clone(),
            start: LocalTime::from_minute_of_day(entry.start_minute).format_12h(),
            stop: LocalTime::from_minute_of_day(entry.stop_minute).format_12h(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerState {
    pub time: Option<String>,
    #[serde(rename = "timeValid")]
    pub time_valid: bool,
    pub timezone: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "deviceMac")]
    pub device_mac: String,
    #[serde(rename = "linkState")]
    pub link_state: &'static str,
    #[serde(rename = "bleConnected")]
    pub ble_connected: bool,
    pub status: Option<DeviceStatus>,
    #[serde(rename = "statusSummary")]
    pub status_summary: String,
    #[serde(rename = "statusAgeMs")]
    pub status_age_ms: Option<u64>,
    #[serde(rename = "activeScheduleId")]
    pub active_schedule_id: Option<u16>,
    #[serde(rename = "schedulesPaused")]
    pub schedules_paused: bool,
    pub schedule: Vec<ScheduleEntryView>,
}
