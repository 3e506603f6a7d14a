pub mod config;
pub mod observability;
