use super::health::HealthMonitor;
use crate::context::ApplicationContext;
use crate::crawler::crawl_listener::CrawlListener;
use crate::ingest::bulk_admitter::BulkAdmitter;
use crate::parser::parse_worker::ParseWorker;
use anyhow::{bail, Result};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerRole {
  CrawlListener,
  ParseWorker(String),
  BulkAdmitter,
}

/// One entry of the declared fleet.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
  pub role: WorkerRole,
  pub name: String,
  pub instances: u32,
  pub required: bool,
  pub restart: bool,
}

struct WorkerInstance {
  spec_index: usize,
  instance_id: u32,
  handle: JoinHandle<()>,
}

/// Keeps the declared worker fleet alive: starts every instance at boot,
/// restarts crashed ones on the health interval, and drains the fleet on
/// shutdown with a bounded grace period before aborting stragglers.
pub struct Supervisor {
  context: Arc<ApplicationContext>,
  specs: Vec<WorkerSpec>,
  health: HealthMonitor,
}

pub fn declared_fleet(context: &ApplicationContext) -> Vec<WorkerSpec> {
  let mut specs = vec![
    WorkerSpec {
      role: WorkerRole::CrawlListener,
      name: "crawl_listener".to_string(),
      instances: context.settings.crawler.instances,
      required: true,
      restart: true,
    },
    WorkerSpec {
      role: WorkerRole::BulkAdmitter,
      name: "bulk_admitter".to_string(),
      instances: 1,
      required: false,
      restart: true,
    },
  ];
  for (task_type, task) in context.task_registry.tasks() {
    specs.push(WorkerSpec {
      role: WorkerRole::ParseWorker(task_type.to_string()),
      name: format!("parse_worker.{}", task_type),
      instances: task.settings.instances,
      required: false,
      restart: true,
    });
  }
  specs
}

impl Supervisor {
  pub fn new(context: Arc<ApplicationContext>) -> Self {
    let specs = declared_fleet(&context);
    let health = HealthMonitor::new(
      Arc::clone(&context.job_queue),
      Arc::clone(&context.crawl_job_repository),
    );
    Self {
      context,
      specs,
      health,
    }
  }

  fn spawn_instance(
    &self,
    spec: &WorkerSpec,
    instance_id: u32,
    shutdown: watch::Receiver<bool>,
  ) -> JoinHandle<()> {
    let name = spec.name.clone();
    info!(worker = name.as_str(), instance_id, "Starting worker");
    match &spec.role {
      WorkerRole::CrawlListener => {
        let listener = CrawlListener::new(
          instance_id,
          Arc::clone(&self.context.settings),
          Arc::clone(&self.context.queue_manager),
          Arc::clone(&self.context.crawl_job_repository),
          Arc::clone(&self.context.content_store),
          Arc::clone(&self.context.parse_job_dispatcher),
          Arc::clone(&self.context.crawl_engine),
        );
        tokio::spawn(async move {
          if let Err(e) = listener.run(shutdown).await {
            error!(worker = name.as_str(), instance_id, error = e.to_string(), "Worker exited with error");
          }
        })
      }
      WorkerRole::ParseWorker(task_type) => {
        let task = self
          .context
          .task_registry
          .get(task_type)
          .cloned()
          .expect("Registered task type disappeared from registry");
        let worker = ParseWorker::new(
          instance_id,
          &task,
          Arc::clone(&self.context.queue_manager),
          Arc::clone(&self.context.parsed_document_repository),
          Arc::clone(&self.context.content_store),
        );
        tokio::spawn(async move {
          if let Err(e) = worker.run(shutdown).await {
            error!(worker = name.as_str(), instance_id, error = e.to_string(), "Worker exited with error");
          }
        })
      }
      WorkerRole::BulkAdmitter => {
        let admitter = BulkAdmitter::new(
          Arc::clone(&self.context.settings),
          Arc::clone(&self.context.queue_manager),
          Arc::clone(&self.context.source_domain_repository),
          Arc::clone(&self.context.crawl_job_repository),
        );
        tokio::spawn(async move {
          if let Err(e) = admitter.run(shutdown).await {
            error!(worker = name.as_str(), instance_id, error = e.to_string(), "Worker exited with error");
          }
        })
      }
    }
  }

  fn spawn_fleet(&self, shutdown: &watch::Receiver<bool>) -> Vec<WorkerInstance> {
    let mut instances = Vec::new();
    for (spec_index, spec) in self.specs.iter().enumerate() {
      for instance_id in 0..spec.instances {
        instances.push(WorkerInstance {
          spec_index,
          instance_id,
          handle: self.spawn_instance(spec, instance_id, shutdown.clone()),
        });
      }
    }
    instances
  }

  fn check_fleet(&self, instances: &mut Vec<WorkerInstance>, shutdown: &watch::Receiver<bool>) {
    for instance in instances.iter_mut() {
      if !instance.handle.is_finished() {
        continue;
      }
      let spec = &self.specs[instance.spec_index];
      warn!(
        worker = spec.name.as_str(),
        instance_id = instance.instance_id,
        "Worker instance terminated"
      );
      if spec.restart && !*shutdown.borrow() {
        info!(
          worker = spec.name.as_str(),
          instance_id = instance.instance_id,
          "Restarting worker instance"
        );
        instance.handle = self.spawn_instance(spec, instance.instance_id, shutdown.clone());
      } else if spec.required {
        error!(
          worker = spec.name.as_str(),
          instance_id = instance.instance_id,
          "Required worker is down and not restartable"
        );
      }
    }
  }

  async fn drain(&self, instances: Vec<WorkerInstance>) {
    let grace = Duration::from_secs(self.context.settings.supervisor.shutdown_timeout_seconds);
    info!(
      grace_seconds = grace.as_secs(),
      "Draining worker fleet"
    );
    let mut handles = Vec::new();
    let mut aborts = Vec::new();
    for instance in instances {
      aborts.push(instance.handle.abort_handle());
      handles.push(instance.handle);
    }
    if timeout(grace, join_all(handles)).await.is_err() {
      warn!("Workers did not drain in time, aborting stragglers");
      for abort in aborts {
        abort.abort();
      }
    }
  }

  /// Runs until the shutdown signal fires. Refuses to start when the broker
  /// or the database probe fails at boot.
  #[instrument(skip(self, shutdown))]
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    if let Err(e) = self.health.probe_queue().await {
      bail!("Broker probe failed at startup: {}", e);
    }
    if let Err(e) = self.health.probe_database().await {
      bail!("Database probe failed at startup: {}", e);
    }
    let boot_report = self.health.report().await;
    info!(
      cpu = boot_report.cpu_percent,
      memory = boot_report.memory_percent,
      disk = boot_report.disk_percent,
      "Startup health probes passed"
    );

    let mut instances = self.spawn_fleet(&shutdown);
    info!(count = instances.len(), "Worker fleet started");

    let interval = Duration::from_secs(
      self
        .context
        .settings
        .supervisor
        .health_check_interval_seconds,
    );
    loop {
      tokio::select! {
        _ = shutdown.changed() => break,
        _ = sleep(interval) => {
          let report = self.health.report().await;
          info!(
            healthy = report.is_healthy(),
            ready = report.total_ready,
            reserved = report.total_reserved,
            buried = report.total_buried,
            cpu = report.cpu_percent,
            memory = report.memory_percent,
            disk = report.disk_percent,
            warnings = report.warnings.len(),
            "Health report"
          );
          self.check_fleet(&mut instances, &shutdown);
        }
      }
      if *shutdown.borrow() {
        break;
      }
    }

    self.drain(instances).await;
    info!("Supervisor shut down");
    Ok(())
  }
}
