use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use btleplug::{
    api::{
        AddressType, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::StreamExt;
use tracing::debug;
use uuid::Uuid;

use crate::radio::{
    AddressKind, Advertisement, Endpoint, NotificationStream, PeerAddress, RadioError,
    RadioSession, RadioTransport,
};

impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => RadioError::PeerNotFound("device".to_string()),
            btleplug::Error::NotConnected => RadioError::NotConnected,
            other => RadioError::Backend(other.to_string()),
        }
    }
}

/// btleplug-backed radio for hosts with a BlueZ, CoreBluetooth or WinRT adapter.
pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    /// Uses the first adapter the platform reports.
    pub async fn first_adapter() -> Result<Self, RadioError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(RadioError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            debug!("using bluetooth adapter {info}");
        }
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, RadioError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral
                .address()
                .to_string()
                .eq_ignore_ascii_case(address)
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RadioTransport for BtleRadio {
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, RadioError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(window).await;
        let peripherals = self.adapter.peripherals().await;
        if let Err(err) = self.adapter.stop_scan().await {
            debug!("stop_scan failed: {err}");
        }

        let mut found = Vec::new();
        for peripheral in peripherals? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            let kind = match props.address_type {
                Some(AddressType::Random) => AddressKind::Random,
                _ => AddressKind::Public,
            };
            found.push(Advertisement {
                peer: PeerAddress {
                    address: props.address.to_string(),
                    kind,
                },
                name: props.local_name,
                services: props.services,
            });
        }
        Ok(found)
    }

    async fn connect(&self, peer: &PeerAddress) -> Result<Arc<dyn RadioSession>, RadioError> {
        // The platform stacks pick the address type themselves; a peer must have been seen
        // by a scan before it can be connected.
        let peripheral = self
            .find_peripheral(&peer.address)
            .await?
            .ok_or_else(|| RadioError::PeerNotFound(peer.address.clone()))?;

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(Arc::new(BtleSession { peripheral }))
    }
}

struct BtleSession {
    peripheral: Peripheral,
}

impl BtleSession {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, RadioError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(RadioError::MissingCharacteristic(uuid))
    }
}

#[async_trait]
impl RadioSession for BtleSession {
    async fn discover(&self, service: Uuid) -> Result<Vec<Endpoint>, RadioError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .map(|c| Endpoint {
                uuid: c.uuid,
                notify: c
                    .properties
                    .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
            })
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, RadioError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&target).await?;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), RadioError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, payload, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
