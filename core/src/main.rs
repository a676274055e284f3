use mimalloc::MiMalloc;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use trawler::context::ApplicationContext;
use trawler::supervisor::supervisor::Supervisor;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
  tokio::spawn(async move {
    let mut sigterm = match signal(SignalKind::terminate()) {
      Ok(sigterm) => sigterm,
      Err(e) => {
        error!(error = e.to_string(), "Failed to install SIGTERM handler");
        return;
      }
    };
    tokio::select! {
      _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
      _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
    let _ = shutdown_tx.send(true);
  });
}

#[tokio::main]
async fn main() {
  let context = match ApplicationContext::init().await {
    Ok(context) => context,
    Err(e) => {
      eprintln!("Startup failed: {:#}", e);
      std::process::exit(1);
    }
  };

  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  spawn_signal_handler(shutdown_tx);

  let supervisor = Supervisor::new(Arc::clone(&context));
  if let Err(e) = supervisor.run(shutdown_rx).await {
    error!(error = e.to_string(), "Supervisor failed");
    std::process::exit(1);
  }
}
