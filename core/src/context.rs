use crate::{
  crawler::{
    crawl_engine::{CrawlEngine, HttpCrawlEngine},
    crawl_job_repository::CrawlJobRepository,
    crawl_service::CrawlService,
  },
  files::content_store::ContentStore,
  helpers::key_value_store::KeyValueStore,
  ingest::source_domain_repository::SourceDomainRepository,
  parser::{
    parse_job_dispatcher::ParseJobDispatcher, parsed_document_repository::ParsedDocumentRepository,
    task_registry::TaskRegistry,
  },
  queue::{
    job_queue::JobQueue,
    queue_manager::{QueueManager, CRAWL_TUBE},
    sqlite_job_queue::SqliteJobQueue,
  },
  settings::Settings,
  sqlite::SqliteConnection,
  tracing::setup_tracing,
};
use anyhow::Result;
use dotenv::dotenv;
use std::sync::Arc;

pub struct ApplicationContext {
  pub settings: Arc<Settings>,
  pub sqlite_connection: Arc<SqliteConnection>,
  pub kv: Arc<KeyValueStore>,
  pub job_queue: Arc<dyn JobQueue>,
  pub queue_manager: Arc<QueueManager>,
  pub content_store: Arc<ContentStore>,
  pub crawl_job_repository: Arc<CrawlJobRepository>,
  pub parsed_document_repository: Arc<ParsedDocumentRepository>,
  pub source_domain_repository: Arc<SourceDomainRepository>,
  pub task_registry: Arc<TaskRegistry>,
  pub parse_job_dispatcher: Arc<ParseJobDispatcher>,
  pub crawl_engine: Arc<dyn CrawlEngine>,
  pub crawl_service: Arc<CrawlService>,
}

impl ApplicationContext {
  pub async fn init() -> Result<Arc<ApplicationContext>> {
    dotenv().ok();
    let settings = Arc::new(Settings::new()?);
    setup_tracing()?;

    let sqlite_connection = Arc::new(SqliteConnection::new(Arc::clone(&settings)).await?);
    let kv = Arc::new(KeyValueStore::new(Arc::clone(&sqlite_connection)));
    let job_queue: Arc<dyn JobQueue> =
      Arc::new(SqliteJobQueue::new(Arc::clone(&sqlite_connection)));
    let task_registry = Arc::new(TaskRegistry::with_defaults());

    let queue_manager = Arc::new(QueueManager::new(
      Arc::clone(&job_queue),
      settings.queue.max_attempts,
      vec![CRAWL_TUBE.to_string()],
    ));

    let content_store = Arc::new(ContentStore::new(&settings.content_store)?);
    let crawl_job_repository = Arc::new(CrawlJobRepository::new(Arc::clone(&sqlite_connection)));
    let parsed_document_repository =
      Arc::new(ParsedDocumentRepository::new(Arc::clone(&sqlite_connection)));
    let source_domain_repository =
      Arc::new(SourceDomainRepository::new(Arc::clone(&sqlite_connection)));

    let parse_job_dispatcher = Arc::new(ParseJobDispatcher::new(
      Arc::clone(&queue_manager),
      Arc::clone(&parsed_document_repository),
      Arc::clone(&task_registry),
    ));
    let crawl_engine: Arc<dyn CrawlEngine> = Arc::new(HttpCrawlEngine::new(
      settings.crawler.clone(),
      Arc::clone(&kv),
    )?);
    let crawl_service = Arc::new(CrawlService::new(
      Arc::clone(&settings),
      Arc::clone(&queue_manager),
      Arc::clone(&crawl_job_repository),
    ));

    Ok(Arc::new(ApplicationContext {
      settings,
      sqlite_connection,
      kv,
      job_queue,
      queue_manager,
      content_store,
      crawl_job_repository,
      parsed_document_repository,
      source_domain_repository,
      task_registry,
      parse_job_dispatcher,
      crawl_engine,
      crawl_service,
    }))
  }
}
