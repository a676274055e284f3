use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

pub fn setup_tracing() -> Result<()> {
  let registry = Registry::default()
    .with(tracing_subscriber::fmt::layer())
    .with(EnvFilter::from_default_env());

  tracing::subscriber::set_global_default(registry)?;

  info!("Tracing initialized");

  Ok(())
}
