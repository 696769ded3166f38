mod shutdown;

pub mod config;
pub mod log;
pub mod modbus;
pub mod server;

mod error;
pub use error::Error;

pub use log::{LogBuffer, LogSink, TracingLog};
pub use modbus::{dispatch::Dispatcher, registry::SlaveRegistry};
pub use server::Server;

pub type Result<T> = std::result::Result<T, Error>;
