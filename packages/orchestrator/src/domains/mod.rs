//! Domain models and operations: hosts, proxies, tasks.

pub mod hosts;
pub mod proxies;
pub mod tasks;
