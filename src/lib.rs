pub mod batch;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod id;
pub mod importer;
pub mod kind;
pub mod parent_map;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod reader;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod upload;
