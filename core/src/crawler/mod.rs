pub mod crawl_engine;
pub mod crawl_job;
pub mod crawl_job_repository;
pub mod crawl_listener;
pub mod crawl_service;
