use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use bedjet_common::{
    config::{normalize_mac, LinkConfig},
    protocol::{Command, COMMAND_UUID, NAME_HINT, SERVICE_UUID, STATUS_UUID},
    LinkState, TelemetryStore,
};

use crate::{
    clock::{monotonic_ms, WallClock},
    radio::{
        AddressKind, Advertisement, NotificationStream, PeerAddress, RadioError, RadioSession,
        RadioTransport,
    },
};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("not linked to the appliance")]
    NotLinked,
    #[error("could not link to the appliance after {attempts} attempts")]
    ConnectFailed { attempts: u32 },
    #[error("appliance does not expose characteristic {0}")]
    EndpointMissing(Uuid),
    #[error("link attempt cancelled by a disconnect")]
    Cancelled,
    #[error(transparent)]
    Radio(#[from] RadioError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMatch {
    Address,
    Service,
    Name,
}

/// Picks the appliance out of a scan: exact address, then advertised service, then name hint.
/// Within a rule the earliest advertisement wins.
pub fn select_peer<'a>(
    advertisements: &'a [Advertisement],
    target: &str,
) -> Option<(&'a Advertisement, PeerMatch)> {
    if !target.is_empty() {
        if let Some(ad) = advertisements
            .iter()
            .find(|ad| ad.peer.address.eq_ignore_ascii_case(target))
        {
            return Some((ad, PeerMatch::Address));
        }
    }

    if let Some(ad) = advertisements
        .iter()
        .find(|ad| ad.services.contains(&SERVICE_UUID))
    {
        return Some((ad, PeerMatch::Service));
    }

    advertisements
        .iter()
        .find(|ad| {
            ad.name
                .as_deref()
                .is_some_and(|name| name.to_ascii_uppercase().contains(NAME_HINT))
        })
        .map(|ad| (ad, PeerMatch::Name))
}

struct Session {
    state: LinkState,
    connection: Option<Arc<dyn RadioSession>>,
    notifications: Option<JoinHandle<()>>,
    /// Bumped by every explicit disconnect; attempts started under an older value never link.
    generation: u64,
}

impl Session {
    /// Detaches everything and marks the link down. The caller decides whether the radio
    /// still needs an explicit disconnect.
    fn clear(&mut self) -> Option<Arc<dyn RadioSession>> {
        self.state = LinkState::Disconnected;
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
        self.connection.take()
    }
}

/// Owns the single radio connection to the appliance.
pub struct DeviceLink {
    radio: Arc<dyn RadioTransport>,
    telemetry: TelemetryStore,
    clock: Arc<dyn WallClock>,
    config: LinkConfig,
    target: Mutex<String>,
    admission: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

impl DeviceLink {
    pub fn new(
        radio: Arc<dyn RadioTransport>,
        telemetry: TelemetryStore,
        clock: Arc<dyn WallClock>,
        config: LinkConfig,
        target_mac: &str,
    ) -> Self {
        Self {
            radio,
            telemetry,
            clock,
            config,
            target: Mutex::new(normalize_mac(target_mac)),
            admission: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session {
                state: LinkState::Disconnected,
                connection: None,
                notifications: None,
                generation: 0,
            }),
        }
    }

    pub fn state(&self) -> LinkState {
        self.session.lock().state
    }

    pub fn is_linked(&self) -> bool {
        self.state() == LinkState::Linked
    }

    pub fn target(&self) -> String {
        self.target.lock().clone()
    }

    /// Takes effect on the next connection attempt.
    pub fn set_target(&self, mac: &str) {
        *self.target.lock() = normalize_mac(mac);
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub async fn ensure_connected(&self) -> Result<(), LinkError> {
        if self.is_live().await {
            return Ok(());
        }

        let wait = Duration::from_millis(self.config.admission_wait_ms);
        let _admission = match tokio::time::timeout(wait, self.admission.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!(
                    wait_ms = self.config.admission_wait_ms,
                    "link busy; proceeding with a concurrent connection attempt"
                );
                None
            }
        };

        if self.is_live().await {
            return Ok(());
        }

        self.connect_with_retries().await
    }

    pub async fn send_command(&self, command: Command) -> Result<(), LinkError> {
        let connection = {
            let session = self.session.lock();
            if session.state != LinkState::Linked {
                return Err(LinkError::NotLinked);
            }
            session.connection.clone()
        }
        .ok_or(LinkError::NotLinked)?;

        let payload = command.encode();
        debug!(?command, "write {payload:02X?}");
        connection.write(COMMAND_UUID, &payload).await?;
        Ok(())
    }

    /// Drops the current link and cancels any attempt still in flight.
    pub async fn disconnect(&self) {
        let connection = {
            let mut session = self.session.lock();
            session.generation += 1;
            session.clear()
        };
        if let Some(connection) = connection {
            if let Err(err) = connection.disconnect().await {
                debug!("radio disconnect failed: {err}");
            }
            info!("link closed");
        }
    }

    /// Demotes a link whose radio session has gone away. Returns whether the link is up.
    pub async fn check_liveness(&self) -> bool {
        let connection = {
            let session = self.session.lock();
            if session.state != LinkState::Linked {
                return false;
            }
            session.connection.clone()
        };

        if let Some(connection) = &connection {
            if connection.is_connected().await {
                return true;
            }
        }

        let mut session = self.session.lock();
        let unchanged = session.state == LinkState::Linked
            && match (&session.connection, &connection) {
                (Some(current), Some(probed)) => Arc::ptr_eq(current, probed),
                (None, None) => true,
                _ => false,
            };
        if !unchanged {
            return session.state == LinkState::Linked;
        }

        warn!("appliance link dropped");
        session.clear();
        false
    }

    /// Sets the appliance clock to local wall time. Skipped while the wall clock is invalid.
    pub async fn sync_clock(&self) -> Result<(), LinkError> {
        let Some(now) = self.clock.now() else {
            debug!("wall clock not set; skipping appliance clock sync");
            return Ok(());
        };
        self.send_command(Command::SetClock(now)).await
    }

    async fn is_live(&self) -> bool {
        let connection = {
            let session = self.session.lock();
            if session.state != LinkState::Linked {
                return false;
            }
            session.connection.clone()
        };
        match connection {
            Some(connection) => connection.is_connected().await,
            None => false,
        }
    }

    async fn connect_with_retries(&self) -> Result<(), LinkError> {
        let (stale, generation) = {
            let mut session = self.session.lock();
            let stale = session.clear();
            session.state = LinkState::Connecting;
            (stale, session.generation)
        };
        if let Some(stale) = stale {
            let _ = stale.disconnect().await;
        }

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            if self.session.lock().generation != generation {
                info!("link attempt cancelled");
                return Err(LinkError::Cancelled);
            }
            info!(attempt, attempts, "connecting to appliance");
            match self.try_link(generation).await {
                Ok(()) => {
                    info!("appliance linked");
                    if let Err(err) = self.sync_clock().await {
                        warn!("appliance clock sync failed: {err}");
                    }
                    return Ok(());
                }
                Err(LinkError::Cancelled) => {
                    info!("link attempt cancelled");
                    return Err(LinkError::Cancelled);
                }
                Err(LinkError::EndpointMissing(uuid)) => {
                    warn!(attempt, "appliance is missing characteristic {uuid}");
                }
                Err(err) => {
                    warn!(attempt, "link attempt failed: {err}");
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.reconnect_backoff_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        {
            let mut session = self.session.lock();
            if session.generation == generation && session.state == LinkState::Connecting {
                session.clear();
            }
        }
        warn!(attempts, "giving up on appliance link");
        Err(LinkError::ConnectFailed { attempts })
    }

    async fn try_link(&self, generation: u64) -> Result<(), LinkError> {
        let target = self.target();
        let connection = self.open_connection(&target).await?;

        let endpoints = match connection.discover(SERVICE_UUID).await {
            Ok(endpoints) => endpoints,
            Err(err) => {
                warn!("service discovery failed: {err}");
                Vec::new()
            }
        };
        let status = endpoints.iter().find(|e| e.uuid == STATUS_UUID).copied();
        let command = endpoints.iter().find(|e| e.uuid == COMMAND_UUID).copied();

        let status = match (status, command) {
            (Some(status), Some(_)) => status,
            (status, _) => {
                let _ = connection.disconnect().await;
                tokio::time::sleep(Duration::from_millis(self.config.endpoint_backoff_ms)).await;
                let missing = if status.is_none() {
                    STATUS_UUID
                } else {
                    COMMAND_UUID
                };
                return Err(LinkError::EndpointMissing(missing));
            }
        };

        let mut notifications = if status.notify {
            match connection.subscribe(STATUS_UUID).await {
                Ok(stream) => Some(spawn_forwarder(stream, self.telemetry.clone())),
                Err(err) => {
                    warn!("status subscription failed: {err}");
                    None
                }
            }
        } else {
            warn!("status characteristic cannot notify");
            None
        };

        let (installed, current) = {
            let mut session = self.session.lock();
            let current = session.generation == generation;
            let installed = current && session.state != LinkState::Linked;
            if installed {
                session.connection = Some(connection.clone());
                session.notifications = notifications.take();
                session.state = LinkState::Linked;
            }
            (installed, current)
        };
        if installed {
            return Ok(());
        }

        // Cancelled, or a concurrent attempt linked first and keeps its session.
        if let Some(task) = notifications {
            task.abort();
        }
        let _ = connection.disconnect().await;
        if current {
            debug!("another attempt linked first; dropping duplicate session");
            Ok(())
        } else {
            Err(LinkError::Cancelled)
        }
    }

    async fn open_connection(&self, target: &str) -> Result<Arc<dyn RadioSession>, LinkError> {
        let mut last_error = None;

        if let Some(peer) = self.resolve_peer(target).await {
            match self.radio.connect(&peer).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    warn!(%peer, "connect to resolved peer failed: {err}");
                    last_error = Some(err);
                }
            }
        }

        if !target.is_empty() {
            for kind in [AddressKind::Public, AddressKind::Random] {
                let peer = PeerAddress {
                    address: target.to_string(),
                    kind,
                };
                match self.radio.connect(&peer).await {
                    Ok(connection) => return Ok(connection),
                    Err(err) => {
                        warn!(%peer, "fallback connect failed: {err}");
                        last_error = Some(err);
                        tokio::time::sleep(Duration::from_millis(
                            self.config.fallback_backoff_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RadioError::PeerNotFound(target.to_string()))
            .into())
    }

    async fn resolve_peer(&self, target: &str) -> Option<PeerAddress> {
        let window = Duration::from_millis(self.config.scan_window_ms);
        let passes = self.config.scan_passes.max(1);

        let mut found = Vec::new();
        for pass in 1..=passes {
            found = match self.radio.scan(window).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(pass, "scan failed: {err}");
                    Vec::new()
                }
            };
            if !found.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.scan_retry_backoff_ms)).await;
        }

        debug!(results = found.len(), target, "scan finished");
        match select_peer(&found, target) {
            Some((ad, matched)) => {
                info!(peer = %ad.peer, ?matched, "resolved appliance address");
                Some(ad.peer.clone())
            }
            None => {
                debug!("no appliance in scan results");
                None
            }
        }
    }
}

fn spawn_forwarder(mut stream: NotificationStream, telemetry: TelemetryStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let snapshot = telemetry.record(&frame, monotonic_ms());
            if !snapshot.valid {
                debug!(len = frame.len(), "stored malformed status frame");
            }
        }
        debug!("status notifications ended");
    })
}
