pub mod backend;
pub mod config;
pub mod core;
pub mod inference;
