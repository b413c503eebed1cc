pub mod auth;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod openapi;
pub mod queue;
pub mod readings;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;

#[cfg(test)]
pub mod test_support;
