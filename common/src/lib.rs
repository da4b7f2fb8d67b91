pub mod config;
pub mod protocol;
pub mod schedule;
pub mod telemetry;
pub mod transition;
pub mod types;

pub use config::{AutomationConfig, DeviceConfig, LinkConfig, RuntimeConfig};
pub use protocol::{Command, DeviceStatus};
pub use schedule::{
    EntrySpec, Schedule, ScheduleEntry, ScheduleError, ScheduleExport, ScheduleImport,
};
pub use telemetry::{TelemetrySnapshot, TelemetryStore};
pub use transition::{plan_transition, ModeFamily, TransitionPlan};
pub use types::{ControllerState, LinkState, LocalTime, Mode, ScheduleEntryView};
