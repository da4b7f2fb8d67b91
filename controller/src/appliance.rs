use std::{sync::Arc, time::Duration};

use tracing::{debug, info};

use bedjet_common::{
    config::AutomationConfig,
    plan_transition,
    protocol::{Command, RUNTIME_MAX_MINUTES},
    Mode, ScheduleEntry, TransitionPlan,
};

use crate::{
    clock::monotonic_ms,
    link::{DeviceLink, LinkError},
};

/// One-off request from the HTTP surface; unset fields are left as the appliance has them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdHocCommand {
    pub mode: Mode,
    pub fan_step: Option<u8>,
    pub temp_f: Option<f32>,
    pub runtime_minutes: Option<u16>,
}

/// Multi-command sequences on top of [`DeviceLink`], paced so the appliance keeps up.
pub struct Appliance {
    link: Arc<DeviceLink>,
    automation: AutomationConfig,
}

impl Appliance {
    pub fn new(link: Arc<DeviceLink>, automation: AutomationConfig) -> Self {
        Self { link, automation }
    }

    pub fn link(&self) -> &Arc<DeviceLink> {
        &self.link
    }

    /// Switches mode, inserting an OFF press when the current mode is unknown or the switch
    /// crosses mode families. A failure after the OFF press leaves the appliance off.
    pub async fn set_mode_smart(&self, target: Mode) -> Result<TransitionPlan, LinkError> {
        if target == Mode::Off {
            self.link.send_command(Command::Button(Mode::Off)).await?;
            return Ok(TransitionPlan::Direct);
        }

        let current = self
            .link
            .telemetry()
            .current_mode(monotonic_ms(), self.automation.status_stale_ms);
        let plan = plan_transition(current, target);

        if plan == TransitionPlan::OffFirst {
            self.link.send_command(Command::Button(Mode::Off)).await?;
            self.pause(self.automation.settle_ms).await;
        }
        self.link.send_command(Command::Button(target)).await?;

        info!(?current, %target, ?plan, "mode set");
        Ok(plan)
    }

    /// Enacts a schedule entry: clock sync, mode, fan, temperature and a runtime equal to the
    /// window length.
    pub async fn apply_entry(&self, entry: &ScheduleEntry) -> Result<(), LinkError> {
        self.link.ensure_connected().await?;

        if let Err(err) = self.link.sync_clock().await {
            debug!("clock sync before schedule entry failed: {err}");
        }
        self.pause(self.automation.clock_sync_gap_ms).await;

        if entry.mode == Mode::Off {
            self.link.send_command(Command::Button(Mode::Off)).await?;
            info!(id = entry.id, "schedule entry applied (off)");
            return Ok(());
        }

        self.set_mode_smart(entry.mode).await?;
        self.pause(self.automation.mode_gap_ms).await;

        self.link
            .send_command(Command::SetFan(entry.fan_step))
            .await?;
        self.pause(self.automation.command_gap_ms).await;

        self.link
            .send_command(Command::SetTemp(entry.target_temp_f))
            .await?;
        self.pause(self.automation.command_gap_ms).await;

        self.link
            .send_command(Command::SetRuntime {
                minutes: entry.duration_minutes(),
            })
            .await?;

        info!(
            id = entry.id,
            mode = %entry.mode,
            fan = entry.fan_step,
            temp_f = entry.target_temp_f,
            minutes = entry.duration_minutes(),
            "schedule entry applied"
        );
        Ok(())
    }

    pub async fn send_ad_hoc(&self, command: AdHocCommand) -> Result<(), LinkError> {
        self.link.ensure_connected().await?;
        self.set_mode_smart(command.mode).await?;
        if command.mode == Mode::Off {
            return Ok(());
        }

        if let Some(temp_f) = command.temp_f {
            self.pause(self.automation.command_gap_ms).await;
            self.link.send_command(Command::SetTemp(temp_f)).await?;
        }
        if let Some(fan_step) = command.fan_step {
            self.pause(self.automation.command_gap_ms).await;
            self.link.send_command(Command::SetFan(fan_step)).await?;
        }
        if let Some(minutes) = command.runtime_minutes {
            self.pause(self.automation.command_gap_ms).await;
            self.link
                .send_command(Command::SetRuntime {
                    minutes: minutes.min(RUNTIME_MAX_MINUTES),
                })
                .await?;
        }
        Ok(())
    }

    pub async fn turn_off(&self) -> Result<(), LinkError> {
        self.link.ensure_connected().await?;
        self.link.send_command(Command::Button(Mode::Off)).await
    }

    async fn pause(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}
