pub mod adapters;
pub mod app;
pub mod cache;
pub mod config;
pub mod coverage;
pub mod database;
pub mod error;
pub mod freshness;
pub mod locks;
pub mod messaging;
pub mod models;
pub mod region;
pub mod routes;
pub mod scan;
pub mod store;
pub mod tasks;
pub mod worker_processing;
pub mod worker_scheduler;
