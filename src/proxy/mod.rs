pub mod manager;
pub mod rotation;
pub mod source;

pub use manager::{ProxySessionManager, SessionType, StickySession};
pub use rotation::RotationSettings;
pub use source::{load_proxies, ProxyDescriptor, ProxyScheme};
