pub mod config;
pub mod error;
pub mod io_struct;
pub mod logging;
pub mod middleware;
pub mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod relay;
pub mod server;
pub mod upstream;
pub mod validation;

pub use error::ProxyError;
pub use io_struct::{ChatMessage, ChatRequest, Role};
