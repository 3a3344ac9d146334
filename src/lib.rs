// Library surface shared by the hivewatch binary and the integration tests

pub mod actors;
pub mod api;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod detection;
pub mod error;
pub mod messages;
pub mod store;
pub mod utils;
