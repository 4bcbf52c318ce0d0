pub mod agent;
pub mod buffer;
pub mod config;
pub mod delivery;
pub mod models;
pub mod outage;
pub mod probe;
pub mod probe_engine;
pub mod recovery;
pub mod sink;
pub mod utils;
