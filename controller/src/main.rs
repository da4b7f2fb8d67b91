mod appliance;
#[cfg(feature = "ble")]
mod ble;
mod clock;
mod engine;
mod host;
mod link;
mod radio;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
