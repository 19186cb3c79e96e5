pub mod config;
pub mod control;
pub mod logging;
pub mod query;
pub mod record;
pub mod restart;
pub mod store;
pub mod web;
