//! The Modbus/TCP side of the simulator.

pub(crate) mod connection;
pub mod dispatch;
pub mod frame;
pub mod registry;
pub mod source;

pub type UnitId = u8;
pub type FunctionCode = u8;
pub type TransactionId = u16;
