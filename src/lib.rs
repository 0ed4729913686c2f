pub mod action;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod hook;
pub mod logger;
pub mod manager;
pub mod vmm;
