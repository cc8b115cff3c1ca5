// src/parley/mod.rs

pub mod client_wrapper;
pub mod clients;
pub mod config;
pub mod convergence;
pub mod dispatch;
pub mod event;
pub mod json_repair;
pub mod model;
pub mod oracle;
pub mod orchestrator;
pub mod phases;
pub mod quota;
pub mod scenario;
pub mod validator;
