use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Public,
    Random,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub address: String,
    pub kind: AddressKind,
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.address, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub peer: PeerAddress,
    pub name: Option<String>,
    pub services: Vec<Uuid>,
}

/// A characteristic found during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub uuid: Uuid,
    pub notify: bool,
}

#[derive(Debug, Error)]
pub enum RadioError {
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("characteristic {0} not found")]
    MissingCharacteristic(Uuid),
    #[error("not connected")]
    NotConnected,
    #[error("radio backend error: {0}")]
    Backend(String),
}

pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Radio capability consumed by the link manager.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Active scan for `window`; returns advertisements in the order they were seen.
    async fn scan(&self, window: Duration) -> Result<Vec<Advertisement>, RadioError>;

    async fn connect(&self, peer: &PeerAddress) -> Result<Arc<dyn RadioSession>, RadioError>;
}

#[async_trait]
pub trait RadioSession: Send + Sync {
    /// Characteristics of `service`; empty when the service is absent.
    async fn discover(&self, service: Uuid) -> Result<Vec<Endpoint>, RadioError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, RadioError>;

    /// Write without response.
    async fn write(&self, characteristic: Uuid, payload: &[u8]) -> Result<(), RadioError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), RadioError>;
}

/// Stand-in for builds without a radio backend; every operation reports a missing adapter.
#[cfg(not(feature = "ble"))]
pub struct NoRadio;

#[cfg(not(feature = "ble"))]
#[async_trait]
impl RadioTransport for NoRadio {
    async fn scan(&self, _window: Duration) -> Result<Vec<Advertisement>, RadioError> {
        Err(RadioError::NoAdapter)
    }

    async fn connect(&self, _peer: &PeerAddress) -> Result<Arc<dyn RadioSession>, RadioError> {
        Err(RadioError::NoAdapter)
    }
}
