use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use bedjet_common::{
    EntrySpec, RuntimeConfig, Schedule, ScheduleEntry, ScheduleError, ScheduleExport,
    ScheduleImport,
};

use crate::{
    appliance::Appliance,
    clock::WallClock,
    link::LinkError,
    store::Store,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("failed to persist: {0:#}")]
    Persist(anyhow::Error),
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    ClockInvalid,
    Paused,
    Idle,
    Unchanged,
    Started(u16),
    Stopped(u16),
    Failed,
}

struct EngineState {
    schedule: Schedule,
    active: Option<u16>,
    paused: bool,
}

pub struct ScheduleEngine {
    appliance: Arc<Appliance>,
    clock: Arc<dyn WallClock>,
    store: Arc<dyn Store>,
    state: Mutex<EngineState>,
    writer: tokio::sync::Mutex<()>,
}

impl ScheduleEngine {
    pub fn new(
        appliance: Arc<Appliance>,
        clock: Arc<dyn WallClock>,
        store: Arc<dyn Store>,
        schedule: Schedule,
        paused: bool,
    ) -> Self {
        Self {
            appliance,
            clock,
            store,
            state: Mutex::new(EngineState {
                schedule,
                active: None,
                paused,
            }),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    pub fn active_entry_id(&self) -> Option<u16> {
        self.state.lock().active
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn list_entries(&self) -> Vec<ScheduleEntry> {
        self.state.lock().schedule.entries().to_vec()
    }

    /// One evaluation of the schedule against the current wall-clock minute.
    pub async fn tick(&self) -> TickOutcome {
        let Some(now) = self.clock.now() else {
            return TickOutcome::ClockInvalid;
        };

        let (desired, active) = {
            let state = self.state.lock();
            if state.paused {
                return TickOutcome::Paused;
            }
            (
                state.schedule.resolve(now.minute_of_day()).cloned(),
                state.active,
            )
        };

        match (desired, active) {
            (None, None) => TickOutcome::Idle,
            (Some(entry), Some(id)) if entry.id == id => TickOutcome::Unchanged,
            (None, Some(id)) => match self.appliance.turn_off().await {
                Ok(()) => {
                    self.clear_active_if(id);
                    info!(id, "schedule window ended; appliance off");
                    TickOutcome::Stopped(id)
                }
                Err(err) => {
                    warn!(id, "failed to stop schedule entry, will retry: {err}");
                    TickOutcome::Failed
                }
            },
            (Some(entry), _) => match self.appliance.apply_entry(&entry).await {
                Ok(()) => {
                    self.state.lock().active = Some(entry.id);
                    info!(id = entry.id, at = %now.format_12h(), "schedule entry active");
                    TickOutcome::Started(entry.id)
                }
                Err(err) => {
                    warn!(id = entry.id, "failed to apply schedule entry, will retry: {err}");
                    TickOutcome::Failed
                }
            },
        }
    }

    pub async fn add_entry(&self, spec: EntrySpec) -> Result<ScheduleEntry, EngineError> {
        self.mutate(move |state| state.schedule.add(spec).cloned())
            .await
    }

    pub async fn update_entry(
        &self,
        id: u16,
        spec: EntrySpec,
    ) -> Result<ScheduleEntry, EngineError> {
        self.mutate(move |state| state.schedule.update(id, spec).cloned())
            .await
    }

    pub async fn delete_entry(&self, id: u16) -> Result<ScheduleEntry, EngineError> {
        self.mutate(move |state| {
            let removed = state.schedule.delete(id)?;
            if state.active == Some(id) {
                state.active = None;
            }
            Ok(removed)
        })
        .await
    }

    /// Replaces the whole collection. Nothing changes unless every item is valid.
    pub async fn import_schedule(&self, import: ScheduleImport) -> Result<usize, EngineError> {
        let schedule = Schedule::from_import(import)?;
        let count = schedule.entries().len();
        self.mutate(move |state| {
            state.schedule = schedule;
            state.active = None;
            Ok(())
        })
        .await?;
        info!(count, "schedule imported");
        Ok(count)
    }

    pub fn export_schedule(
        &self,
        exported: String,
        device_name: &str,
        device_mac: &str,
    ) -> ScheduleExport {
        self.state
            .lock()
            .schedule
            .export(exported, device_name, device_mac)
    }

    /// Enacts an entry immediately, regardless of its window. The active indicator is left
    /// alone, so the next tick may re-enact whatever the schedule wants.
    pub async fn run_entry_now(&self, id: u16) -> Result<ScheduleEntry, EngineError> {
        let entry = self
            .state
            .lock()
            .schedule
            .get(id)
            .cloned()
            .ok_or(ScheduleError::NotFound(id))?;
        self.appliance.apply_entry(&entry).await?;
        info!(id, "schedule entry run on demand");
        Ok(entry)
    }

    pub async fn set_paused(&self, paused: bool) -> Result<(), EngineError> {
        let _writer = self.writer.lock().await;
        let previous = std::mem::replace(&mut self.state.lock().paused, paused);

        let persisted = self
            .store
            .update_runtime_config(Box::new(move |runtime: &mut RuntimeConfig| {
                runtime.schedules_paused = paused;
            }))
            .await;

        if let Err(err) = persisted {
            self.state.lock().paused = previous;
            return Err(EngineError::Persist(err));
        }
        info!(paused, "schedule pause changed");
        Ok(())
    }

    async fn mutate<T, F>(&self, op: F) -> Result<T, EngineError>
    where
        T: Send,
        F: FnOnce(&mut EngineState) -> Result<T, ScheduleError> + Send,
    {
        let _writer = self.writer.lock().await;

        let (result, before, after) = {
            let mut state = self.state.lock();
            let before = (state.schedule.clone(), state.active);
            let result = op(&mut *state)?;
            (result, before, state.schedule.clone())
        };

        if let Err(err) = self.store.save_schedule(&after).await {
            warn!("schedule change rolled back: {err:#}");
            let mut state = self.state.lock();
            state.schedule = before.0;
            state.active = before.1;
            return Err(EngineError::Persist(err));
        }
        Ok(result)
    }

    fn clear_active_if(&self, id: u16) {
        let mut state = self.state.lock();
        if state.active == Some(id) {
            state.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::fixed::FixedClock,
        link::DeviceLink,
        radio::fake::{FakeRadio, BEDJET_MAC},
        store::{memory::MemoryStore, FileStore},
    };
    use bedjet_common::{
        config::{AutomationConfig, LinkConfig},
        Mode, TelemetryStore,
    };

    struct Harness {
        radio: FakeRadio,
        clock: Arc<FixedClock>,
        store: Arc<MemoryStore>,
        engine: ScheduleEngine,
    }

    fn harness(minute: u16) -> Harness {
        let radio = FakeRadio::bedjet();
        let clock = Arc::new(FixedClock::at(minute));
        let store = Arc::new(MemoryStore::default());
        let link = Arc::new(DeviceLink::new(
            Arc::new(radio.clone()),
            TelemetryStore::new(),
            clock.clone(),
            LinkConfig::default(),
            BEDJET_MAC,
        ));
        let appliance = Arc::new(Appliance::new(link, AutomationConfig::default()));
        let engine = ScheduleEngine::new(
            appliance,
            clock.clone(),
            store.clone(),
            Schedule::default(),
            false,
        );
        Harness {
            radio,
            clock,
            store,
            engine,
        }
    }

    fn heat_morning() -> EntrySpec {
        EntrySpec {
            mode: Mode::Heat,
            fan_step: 10,
            target_temp_f: 78.0,
            start_minute: 360,
            stop_minute: 420,
            enabled: true,
        }
    }

    fn mode_presses(writes: &[Vec<u8>]) -> Vec<Vec<u8>> {
        writes
            .iter()
            .filter(|w| w.first() == Some(&0x01))
            .cloned()
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn morning_heat_window_starts_and_stops_once() {
        let h = harness(390);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();

        assert_eq!(h.engine.tick().await, TickOutcome::Started(entry.id));
        assert_eq!(h.engine.active_entry_id(), Some(entry.id));
        let writes = h.radio.writes();
        // Link-up clock sync, then the entry: clock, OFF + HEAT (no status yet), fan, temp, runtime.
        assert_eq!(
            writes,
            vec![
                vec![0x08, 6, 30],
                vec![0x08, 6, 30],
                vec![0x01, 0x01],
                vec![0x01, 0x03],
                vec![0x07, 10],
                vec![0x03, 51],
                vec![0x02, 1, 0],
            ]
        );

        h.radio.clear_writes();
        h.clock.set(400);
        assert_eq!(h.engine.tick().await, TickOutcome::Unchanged);
        assert!(h.radio.writes().is_empty());

        h.clock.set(450);
        assert_eq!(h.engine.tick().await, TickOutcome::Stopped(entry.id));
        assert_eq!(h.radio.writes(), vec![vec![0x01, 0x01]]);
        assert_eq!(h.engine.active_entry_id(), None);

        h.radio.clear_writes();
        assert_eq!(h.engine.tick().await, TickOutcome::Idle);
        assert!(h.radio.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ticks_send_nothing_new() {
        let h = harness(390);
        h.engine.add_entry(heat_morning()).await.unwrap();
        h.engine.tick().await;
        h.radio.clear_writes();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            h.engine.tick().await;
        }

        assert!(h.radio.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_clock_and_pause_suppress_ticks() {
        let h = harness(390);
        h.engine.add_entry(heat_morning()).await.unwrap();

        h.clock.invalidate();
        assert_eq!(h.engine.tick().await, TickOutcome::ClockInvalid);

        h.clock.set(390);
        h.engine.set_paused(true).await.unwrap();
        assert_eq!(h.engine.tick().await, TickOutcome::Paused);
        assert!(h.radio.connects().is_empty());
        assert!(h.store.saved_runtime().schedules_paused);

        h.engine.set_paused(false).await.unwrap();
        assert!(matches!(h.engine.tick().await, TickOutcome::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn link_failure_keeps_indicator_for_retry() {
        let h = harness(390);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();
        h.engine.tick().await;
        h.radio.clear_writes();

        h.clock.set(450);
        h.radio.drop_link();
        h.radio.refuse_connects(true);

        assert_eq!(h.engine.tick().await, TickOutcome::Failed);
        assert_eq!(h.engine.active_entry_id(), Some(entry.id));

        h.radio.refuse_connects(false);
        assert_eq!(h.engine.tick().await, TickOutcome::Stopped(entry.id));
        assert_eq!(mode_presses(&h.radio.writes()), vec![vec![0x01, 0x01]]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_enactment_is_retried_next_tick() {
        let h = harness(390);
        h.engine.add_entry(heat_morning()).await.unwrap();
        h.radio.refuse_connects(true);

        assert_eq!(h.engine.tick().await, TickOutcome::Failed);
        assert_eq!(h.engine.active_entry_id(), None);

        h.radio.refuse_connects(false);
        assert!(matches!(h.engine.tick().await, TickOutcome::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_mid_enactment_is_retried_next_tick() {
        let h = harness(390);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();
        // Link-up clock sync, entry clock sync and the OFF press get through; HEAT fails.
        h.radio.fail_writes_after(3);

        assert_eq!(h.engine.tick().await, TickOutcome::Failed);
        assert_eq!(h.engine.active_entry_id(), None);
        assert_eq!(mode_presses(&h.radio.writes()), vec![vec![0x01, 0x01]]);

        h.radio.fail_writes(false);
        h.radio.clear_writes();
        assert_eq!(h.engine.tick().await, TickOutcome::Started(entry.id));
        assert_eq!(h.engine.active_entry_id(), Some(entry.id));
        assert_eq!(
            mode_presses(&h.radio.writes()),
            vec![vec![0x01, 0x01], vec![0x01, 0x03]]
        );
    }

    #[tokio::test]
    async fn pause_and_timezone_writes_do_not_clobber_each_other() {
        let dir =
            std::env::temp_dir().join(format!("bedjet-engine-pause-{}", std::process::id()));
        let store = Arc::new(FileStore::new(&dir));
        let clock = Arc::new(FixedClock::at(390));
        let link = Arc::new(DeviceLink::new(
            Arc::new(FakeRadio::bedjet()),
            TelemetryStore::new(),
            clock.clone(),
            LinkConfig::default(),
            BEDJET_MAC,
        ));
        let engine = ScheduleEngine::new(
            Arc::new(Appliance::new(link, AutomationConfig::default())),
            clock,
            store.clone(),
            Schedule::default(),
            false,
        );

        let (paused, timezone) = tokio::join!(
            engine.set_paused(true),
            store.update_runtime_config(Box::new(|runtime: &mut RuntimeConfig| {
                runtime.timezone = "Europe/Berlin".to_string();
            })),
        );
        paused.unwrap();
        timezone.unwrap();

        let stored = store.load_runtime_config().await.unwrap();
        assert!(stored.schedules_paused);
        assert_eq!(stored.timezone, "Europe/Berlin");

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_enabled_entry_wins_overlaps() {
        let h = harness(390);
        h.engine
            .add_entry(EntrySpec {
                enabled: false,
                ..heat_morning()
            })
            .await
            .unwrap();
        let cool = h
            .engine
            .add_entry(EntrySpec {
                mode: Mode::Cool,
                start_minute: 300,
                stop_minute: 480,
                ..heat_morning()
            })
            .await
            .unwrap();
        h.engine.add_entry(heat_morning()).await.unwrap();

        assert_eq!(h.engine.tick().await, TickOutcome::Started(cool.id));
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_active_entry_clears_indicator() {
        let h = harness(390);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();
        h.engine.tick().await;

        h.engine.delete_entry(entry.id).await.unwrap();

        assert_eq!(h.engine.active_entry_id(), None);
        assert!(h.engine.list_entries().is_empty());
        assert_eq!(h.engine.tick().await, TickOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_persist_and_roll_back_on_failure() {
        let h = harness(100);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();
        assert_eq!(
            h.store.saved_schedule().map(|s| s.entries().to_vec()),
            Some(vec![entry.clone()])
        );

        h.store.fail_saves(true);
        let err = h.engine.delete_entry(entry.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Persist(_)));
        assert_eq!(h.engine.list_entries(), vec![entry.clone()]);

        let err = h.engine.set_paused(true).await.unwrap_err();
        assert!(matches!(err, EngineError::Persist(_)));
        assert!(!h.engine.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_mutation_leaves_collection_untouched() {
        let h = harness(100);
        h.engine.add_entry(heat_morning()).await.unwrap();

        let err = h
            .engine
            .update_entry(
                1,
                EntrySpec {
                    stop_minute: 360,
                    ..heat_morning()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Schedule(ScheduleError::ZeroLengthWindow)
        ));
        assert_eq!(h.engine.list_entries()[0].stop_minute, 420);
        assert!(matches!(
            h.engine.delete_entry(99).await,
            Err(EngineError::Schedule(ScheduleError::NotFound(99)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn import_replaces_schedule_and_resets_indicator() {
        let h = harness(390);
        h.engine.add_entry(heat_morning()).await.unwrap();
        h.engine.tick().await;

        let import: ScheduleImport = serde_json::from_str(
            r#"{"nextId":10,"schedule":[{"id":4,"mode":"COOL","fan":3,"tempF":66,"startMin":380,"stopMin":400}]}"#,
        )
        .unwrap();
        let count = h.engine.import_schedule(import).await.unwrap();

        assert_eq!(count, 1);
        assert_eq!(h.engine.active_entry_id(), None);
        assert_eq!(h.store.saved_schedule().unwrap().next_id(), 10);
        assert_eq!(h.engine.tick().await, TickOutcome::Started(4));

        let bad: ScheduleImport =
            serde_json::from_str(r#"{"schedule":[{"startMin":5,"stopMin":5}]}"#).unwrap();
        assert!(h.engine.import_schedule(bad).await.is_err());
        assert_eq!(h.engine.list_entries()[0].id, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn run_now_enacts_without_touching_indicator() {
        let h = harness(100);
        let entry = h.engine.add_entry(heat_morning()).await.unwrap();

        h.engine.run_entry_now(entry.id).await.unwrap();

        assert_eq!(h.engine.active_entry_id(), None);
        assert_eq!(h.radio.writes().last(), Some(&vec![0x02, 1, 0]));
        assert!(matches!(
            h.engine.run_entry_now(42).await,
            Err(EngineError::Schedule(ScheduleError::NotFound(42)))
        ));
    }

    #[test]
    fn export_carries_device_identity() {
        let h = harness(0);
        let export = h
            .engine
            .export_schedule("2026-01-05 07:00:00".to_string(), "Bedroom", BEDJET_MAC);
        let json = serde_json::to_value(&export).unwrap();

        assert_eq!(json["schema"], 1);
        assert_eq!(json["device_mac"], BEDJET_MAC);
        assert_eq!(json["nextId"], 1);
        assert!(json["schedule"].as_array().unwrap().is_empty());
    }
}
