use serde::Serialize;
use uuid::Uuid;

use crate::types::{LocalTime, Mode};

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00001000_bed0_0080_aa55_4265644a6574);
pub const STATUS_UUID: Uuid = Uuid::from_u128(0x00002000_bed0_0080_aa55_4265644a6574);
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x00002004_bed0_0080_aa55_4265644a6574);

/// Advertised-name fragment used as the last-resort discovery match.
pub const NAME_HINT: &str = "BEDJET";

pub const MIN_FRAME_LEN: usize = 18;
pub const FRAME_MARKER_1: u8 = 0x56;
pub const FRAME_MARKER_3: u8 = 0x01;

pub const FAN_STEP_MAX: u8 = 19;
pub const MODE_INDEX_MAX: u8 = 5;
pub const RUNTIME_MAX_MINUTES: u16 = 23 * 60 + 59;

const OP_BUTTON: u8 = 0x01;
const OP_SET_RUNTIME: u8 = 0x02;
const OP_SET_TEMP: u8 = 0x03;
const OP_SET_FAN: u8 = 0x07;
const OP_SET_CLOCK: u8 = 0x08;

const TEMP_BYTE_OFFSET: i32 = 0x26;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Button(Mode),
    SetFan(u8),
    SetTemp(f32),
    SetRuntime { minutes: u16 },
    SetClock(LocalTime),
}

impl Command {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::Button(mode) => vec![OP_BUTTON, mode.button()],
            Self::SetFan(step) => vec![OP_SET_FAN, step.min(FAN_STEP_MAX)],
            Self::SetTemp(temp_f) => vec![OP_SET_TEMP, temp_f_to_step(temp_f)],
            Self::SetRuntime { minutes } => {
                let minutes = minutes.min(RUNTIME_MAX_MINUTES);
                vec![OP_SET_RUNTIME, (minutes / 60) as u8, (minutes % 60) as u8]
            }
            Self::SetClock(time) => vec![OP_SET_CLOCK, time.hour, time.minute],
        }
    }
}

/// Temperature setpoint step: `F = 0.9 * step + 32`.
pub fn temp_f_to_step(temp_f: f32) -> u8 {
    if !temp_f.is_finite() {
        return 0;
    }
    ((temp_f - 32.0) / 0.9).round().clamp(0.0, 255.0) as u8
}

/// Decodes a status temperature byte. The appliance computes `x / 9` with integer
/// truncation, so this must not use floating point.
pub fn decode_temp_f(byte: u8) -> i32 {
    let x = i32::from(byte) - TEMP_BYTE_OFFSET;
    (x + 66) - x / 9
}

pub fn fan_percent(step: u8) -> u8 {
    5 + 5 * step.min(FAN_STEP_MAX)
}

pub fn is_valid_frame(frame: &[u8]) -> bool {
    frame.len() >= MIN_FRAME_LEN && frame[1] == FRAME_MARKER_1 && frame[3] == FRAME_MARKER_3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub mode: Mode,
    #[serde(rename = "modeIndex")]
    pub mode_index: u8,
    #[serde(rename = "fanStep")]
    pub fan_step: u8,
    #[serde(rename = "fanPercent")]
    pub fan_percent: u8,
    #[serde(rename = "airTempF")]
    pub air_temp_f: i32,
    #[serde(rename = "targetTempF")]
    pub target_temp_f: i32,
    #[serde(rename = "remainingHours")]
    pub remaining_hours: u8,
    #[serde(rename = "remainingMinutes")]
    pub remaining_minutes: u8,
    #[serde(rename = "remainingSeconds")]
    pub remaining_seconds: u8,
}

impl DeviceStatus {
    /// Decodes a notification frame; `None` unless the frame passes [`is_valid_frame`].
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if !is_valid_frame(frame) {
            return None;
        }

        Some(Self {
            mode: Mode::from_status_index(frame[9]),
            mode_index: frame[9],
            fan_step: frame[10],
            fan_percent: fan_percent(frame[10]),
            air_temp_f: decode_temp_f(frame[7]),
            target_temp_f: decode_temp_f(frame[8]),
            remaining_hours: frame[4],
            remaining_minutes: frame[5],
            remaining_seconds: frame[6],
        })
    }

    pub fn summary(&self, age_ms: u64) -> String {
        let mode = if self.mode_index <= MODE_INDEX_MAX {
            self.mode.as_str().to_ascii_lowercase()
        } else {
            "unknown".to_string()
        };
        format!(
            "mode={}({}) fan={}% target={}F air={}F remaining={}:{:02}:{:02} age={}ms",
            mode,
            self.mode_index,
            self.fan_percent,
            self.target_temp_f,
            self.air_temp_f,
            self.remaining_hours,
            self.remaining_minutes,
            self.remaining_seconds,
            age_ms
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_frame(mode_index: u8, fan_step: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 20];
    frame[1] = FRAME_MARKER_1;
    frame[3] = FRAME_MARKER_3;
    frame[4] = 1;
    frame[5] = 0;
    frame[6] = 0;
    frame[7] = 0x26 + 6;
    frame[8] = 0x26 + 12;
    frame[9] = mode_index;
    frame[10] = fan_step;
    frame
}
