pub mod accounts;
pub mod auth;
pub mod db;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod push;
pub mod registry;
pub mod relay;
pub mod str_utils;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
