pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod firmware;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod parquet_store;
pub mod registry;
pub mod rest;
pub mod schema;
pub mod session;
pub mod store;
pub mod validate;
