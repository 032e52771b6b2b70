pub mod api;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gate;
pub mod geo;
pub mod ledger;
pub mod models;
pub mod observability;
pub mod relay;
pub mod state;
