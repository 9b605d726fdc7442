pub mod actions;
pub mod allocator;
pub mod models;

pub use allocator::{AttemptResult, ProxyAllocator, ProxyHandle};
pub use models::{HostProxyBinding, Proxy};
