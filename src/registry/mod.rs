pub mod server;
pub mod store;

pub use store::{
    RegistryError, RegistryResult, ServiceRecord, ServiceRegistry, periodic_persist,
};
