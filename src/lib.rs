//! ssmanager: supervise a fleet of proxy listeners that all run inside one
//! external server process, driven over a Unix datagram control channel.

pub mod config;
pub mod instance;
pub mod protocol;
pub mod supervisor;
pub mod utils;

pub use supervisor::{Manager, ManagerError};
