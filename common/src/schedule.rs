use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    protocol::FAN_STEP_MAX,
    types::{Mode, MINUTES_PER_DAY},
};

pub const MAX_ENTRIES: usize = 16;
pub const EXPORT_SCHEMA: u32 = 1;

const IMPORT_DEFAULT_FAN: i64 = 10;
const IMPORT_DEFAULT_TEMP_F: f32 = 90.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Invalid startMin {0} (expected 0-1439)")]
    InvalidStart(i64),
    #[error("Invalid stopMin {0} (expected 0-1439)")]
    InvalidStop(i64),
    #[error("Start and stop cannot be the same")]
    ZeroLengthWindow,
    #[error("Invalid temperature")]
    InvalidTemperature,
    #[error("Schedule full (max {max} entries)")]
    Full { max: usize },
    #[error("Schedule entry {0} not found")]
    NotFound(u16),
    #[error("Duplicate schedule id {0}")]
    DuplicateId(u16),
    #[error("No free schedule id")]
    IdsExhausted,
    #[error("Invalid import: {0}")]
    Import(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub id: u16,
    pub mode: Mode,
    #[serde(rename = "fan")]
    pub fan_step: u8,
    #[serde(rename = "tempF")]
    pub target_temp_f: f32,
    #[serde(rename = "startMin")]
    pub start_minute: u16,
    #[serde(rename = "stopMin")]
    pub stop_minute: u16,
    pub enabled: bool,
}

impl ScheduleEntry {
    /// Whether `now` (minute of day) falls inside this entry's window. Windows with
    /// `start > stop` wrap past midnight.
    pub fn contains(&self, now: u16) -> bool {
        window_contains(self.start_minute, self.stop_minute, now)
    }

    pub fn duration_minutes(&self) -> u16 {
        window_duration(self.start_minute, self.stop_minute)
    }
}

pub fn window_contains(start: u16, stop: u16, now: u16) -> bool {
    match start.cmp(&stop) {
        std::cmp::Ordering::Less => start <= now && now < stop,
        std::cmp::Ordering::Greater => now >= start || now < stop,
        std::cmp::Ordering::Equal => false,
    }
}

pub fn window_duration(start: u16, stop: u16) -> u16 {
    (stop + MINUTES_PER_DAY - start) % MINUTES_PER_DAY
}

/// Caller-supplied fields of an entry; the id is assigned by [`Schedule`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySpec {
    pub mode: Mode,
    pub fan_step: u8,
    pub target_temp_f: f32,
    pub start_minute: u16,
    pub stop_minute: u16,
    pub enabled: bool,
}

impl EntrySpec {
    fn validate(&self) -> Result<(), ScheduleError> {
        if self.start_minute >= MINUTES_PER_DAY {
            return Err(ScheduleError::InvalidStart(i64::from(self.start_minute)));
        }
        if self.stop_minute >= MINUTES_PER_DAY {
            return Err(ScheduleError::InvalidStop(i64::from(self.stop_minute)));
        }
        if self.start_minute == self.stop_minute {
            return Err(ScheduleError::ZeroLengthWindow);
        }
        if !self.target_temp_f.is_finite() {
            return Err(ScheduleError::InvalidTemperature);
        }
        Ok(())
    }

    fn into_entry(self, id: u16) -> ScheduleEntry {
        ScheduleEntry {
            id,
            mode: self.mode,
            fan_step: self.fan_step.min(FAN_STEP_MAX),
            target_temp_f: self.target_temp_f,
            start_minute: self.start_minute,
            stop_minute: self.stop_minute,
            enabled: self.enabled,
        }
    }
}

/// Ordered schedule; position is evaluation priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    #[serde(rename = "nextId")]
    next_id: u16,
    #[serde(rename = "schedule")]
    entries: Vec<ScheduleEntry>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl Schedule {
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub fn next_id(&self) -> u16 {
        self.next_id
    }

    pub fn get(&self, id: u16) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Repairs a collection loaded from storage: drops entries that could never have been
    /// created, duplicate ids and overflow, and moves `next_id` past every id in use.
    pub fn normalize(&mut self) {
        let mut seen = Vec::with_capacity(self.entries.len());
        self.entries.retain(|entry| {
            let keep = entry.id != 0
                && !seen.contains(&entry.id)
                && entry.start_minute < MINUTES_PER_DAY
                && entry.stop_minute < MINUTES_PER_DAY
                && entry.start_minute != entry.stop_minute
                && entry.target_temp_f.is_finite();
            if keep {
                seen.push(entry.id);
            }
            keep
        });
        self.entries.truncate(MAX_ENTRIES);
        for entry in &mut self.entries {
            entry.fan_step = entry.fan_step.min(FAN_STEP_MAX);
        }
        self.next_id = self.next_id.max(1);
        if let Some(max_id) = self.entries.iter().map(|entry| entry.id).max() {
            if self.next_id <= max_id {
                self.next_id = max_id.checked_add(1).unwrap_or(1);
            }
        }
    }

    pub fn add(&mut self, spec: EntrySpec) -> Result<&ScheduleEntry, ScheduleError> {
        if self.entries.len() >= MAX_ENTRIES {
            return Err(ScheduleError::Full { max: MAX_ENTRIES });
        }
        spec.validate()?;

        let id = self.allocate_id()?;
        self.entries.push(spec.into_entry(id));
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn update(&mut self, id: u16, spec: EntrySpec) -> Result<&ScheduleEntry, ScheduleError> {
        let index = self.index_of(id).ok_or(ScheduleError::NotFound(id))?;
        spec.validate()?;
        self.entries[index] = spec.into_entry(id);
        Ok(&self.entries[index])
    }

    pub fn delete(&mut self, id: u16) -> Result<ScheduleEntry, ScheduleError> {
        let index = self.index_of(id).ok_or(ScheduleError::NotFound(id))?;
        Ok(self.entries.remove(index))
    }

    /// First enabled entry, in collection order, whose window contains `now`.
    pub fn resolve(&self, now: u16) -> Option<&ScheduleEntry> {
        self.entries
            .iter()
            .find(|entry| entry.enabled && entry.contains(now))
    }

    pub fn export(&self, exported: String, device_name: &str, device_mac: &str) -> ScheduleExport {
        ScheduleExport {
            schema: EXPORT_SCHEMA,
            exported,
            device_name: device_name.to_string(),
            device_mac: device_mac.to_string(),
            schedule: self.clone(),
        }
    }

    /// Builds a replacement schedule from an import document. Nothing is returned unless
    /// every item is valid.
    pub fn from_import(import: ScheduleImport) -> Result<Self, ScheduleError> {
        if import.schedule.len() > MAX_ENTRIES {
            return Err(ScheduleError::Import(format!(
                "too many items ({} > {MAX_ENTRIES})",
                import.schedule.len()
            )));
        }

        let next_id = import
            .next_id
            .filter(|id| (1..i64::from(u16::MAX)).contains(id))
            .map_or(1, |id| id as u16);

        let mut parsed = Vec::with_capacity(import.schedule.len());
        let mut explicit_ids: Vec<u16> = Vec::new();
        for (position, item) in import.schedule.into_iter().enumerate() {
            let requested_id = item
                .id
                .filter(|id| (1..i64::from(u16::MAX)).contains(id))
                .map(|id| id as u16);
            let spec = item
                .into_spec()
                .map_err(|err| ScheduleError::Import(format!("item {position}: {err}")))?;
            spec.validate()
                .map_err(|err| ScheduleError::Import(format!("item {position}: {err}")))?;

            if let Some(id) = requested_id {
                if explicit_ids.contains(&id) {
                    return Err(ScheduleError::DuplicateId(id));
                }
                explicit_ids.push(id);
            }
            parsed.push((requested_id, spec));
        }

        // Generated ids skip every explicit id in the document, including later ones.
        let mut used = explicit_ids;
        let mut candidate = next_id;
        let mut entries = Vec::with_capacity(parsed.len());
        for (requested_id, spec) in parsed {
            let id = match requested_id {
                Some(id) => id,
                None => {
                    while used.contains(&candidate) {
                        candidate = candidate.wrapping_add(1).max(1);
                    }
                    used.push(candidate);
                    candidate
                }
            };
            entries.push(spec.into_entry(id));
        }

        let mut schedule = Self {
            next_id: candidate,
            entries,
        };
        schedule.normalize();
        Ok(schedule)
    }

    fn index_of(&self, id: u16) -> Option<usize> {
        self.entries.iter().position(|entry| entry.id == id)
    }

    fn allocate_id(&mut self) -> Result<u16, ScheduleError> {
        let mut candidate = self.next_id.max(1);
        for _ in 0..u16::MAX {
            if self.index_of(candidate).is_none() {
                self.next_id = candidate.wrapping_add(1).max(1);
                return Ok(candidate);
            }
            candidate = candidate.wrapping_add(1).max(1);
        }
        Err(ScheduleError::IdsExhausted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleExport {
    pub schema: u32,
    pub exported: String,
    pub device_name: String,
    pub device_mac: String,
    #[serde(flatten)]
    pub schedule: Schedule,
}

/// Lenient import document: accepts exports from this controller and older field names.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleImport {
    #[serde(rename = "nextId", default)]
    pub next_id: Option<i64>,
    pub schedule: Vec<ImportedEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportedEntry {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(rename = "modeButton", default)]
    pub mode_button: Option<u8>,
    #[serde(alias = "fanStep", default)]
    pub fan: Option<i64>,
    #[serde(rename = "tempF", alias = "temp", default)]
    pub temp_f: Option<f32>,
    #[serde(rename = "startMin", alias = "start", default)]
    pub start_min: Option<i64>,
    #[serde(rename = "stopMin", alias = "stop", default)]
    pub stop_min: Option<i64>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ImportedEntry {
    fn into_spec(self) -> Result<EntrySpec, String> {
        let mode = match (self.mode, self.mode_button) {
            (Some(name), _) => name.parse::<Mode>().map_err(|err| err.to_string())?,
            (None, Some(button)) => Mode::ALL
                .into_iter()
                .find(|mode| mode.button() == button)
                .ok_or_else(|| format!("unknown modeButton {button}"))?,
            (None, None) => Mode::Off,
        };

        let start = self.start_min.unwrap_or(0);
        if !(0..i64::from(MINUTES_PER_DAY)).contains(&start) {
            return Err(ScheduleError::InvalidStart(start).to_string());
        }
        let stop = self.stop_min.unwrap_or(0);
        if !(0..i64::from(MINUTES_PER_DAY)).contains(&stop) {
            return Err(ScheduleError::InvalidStop(stop).to_string());
        }

        let fan = self
            .fan
            .unwrap_or(IMPORT_DEFAULT_FAN)
            .clamp(0, i64::from(FAN_STEP_MAX));

        Ok(EntrySpec {
            mode,
            fan_step: fan as u8,
            target_temp_f: self.temp_f.unwrap_or(IMPORT_DEFAULT_TEMP_F),
            start_minute: start as u16,
            stop_minute: stop as u16,
            enabled: self.enabled.unwrap_or(true),
        })
    }
}
