//! Runtime layer for the mcpgw gateway: the loopback port pool and the
//! child process supervisor, plus the line-JSON stdio framing the adapter
//! drives through supervisor-owned handles.

pub mod ports;
pub mod process;
pub mod stdio;

pub use ports::{PortAllocation, PortAllocator, RangeInfo, is_port_available};
pub use process::{ProcessInfo, ProcessState, Supervisor};
pub use stdio::{ChildIo, ChildIoError};
