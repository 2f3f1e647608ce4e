pub mod config;
pub mod logging;
pub mod message;
pub mod state;
pub mod store;
pub mod utils;
