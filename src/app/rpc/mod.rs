pub mod agent;
pub mod controller;
pub mod envelope;
pub mod frame;
pub mod server;
pub mod store;
