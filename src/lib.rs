// Library interface for the daemon and integration tests
pub mod algorithm;
pub mod benchmark;
pub mod cli;
pub mod devices;
pub mod excavator;
pub mod format;
pub mod nicehash;
pub mod session;
pub mod settings;
pub mod switching;
