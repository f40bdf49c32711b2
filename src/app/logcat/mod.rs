pub mod chain;
pub mod handlers;
pub mod monitor;
pub mod parser;
pub mod trace;
