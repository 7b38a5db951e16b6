//! Library crate for sniffscan-rs exposing reusable modules.
pub mod capture;
pub mod classify;
pub mod config;
pub mod coordinator;
pub mod netdetect;
pub mod ports;
pub mod probe;
pub mod report;
pub mod risk;
pub mod scanner;
pub mod services;
pub mod types;
