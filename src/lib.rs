pub mod addr;
pub mod cache;
pub mod config;
pub mod context;
pub mod delegation;
pub mod dns;
pub mod dnssec;
pub mod error;
pub mod hooks;
pub mod iterate;
pub mod plan;
pub mod random;
pub mod ranked;
pub mod resolver;

pub use config::ResolverConfig;
pub use context::Context;
pub use error::{ErrorKind, MimirError, Result};
pub use resolver::{OutboundQuery, Proto, Resolution, Resolver, ResolutionTask, Step, Transport};
