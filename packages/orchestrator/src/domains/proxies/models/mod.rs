pub mod binding;
mod proxy;

pub use binding::HostProxyBinding;
pub use proxy::Proxy;
