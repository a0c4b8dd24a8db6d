//! KPI federation library exports

pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
