pub mod adb;
pub mod app_model;
pub mod campaign;
pub mod comp_state;
pub mod config;
pub mod error;
pub mod logcat;
pub mod logging;
pub mod models;
pub mod rpc;
