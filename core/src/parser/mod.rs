pub mod dom;
pub mod handlers;
pub mod parse_job_dispatcher;
pub mod parse_worker;
pub mod parsed_document_repository;
pub mod task_handler;
pub mod task_registry;
