pub mod config;
pub mod db;
pub mod ingest;
pub mod model;
pub mod query;
pub mod reconcile;
pub mod runner;
pub mod schema;
pub mod scoring;
pub mod upstream;
