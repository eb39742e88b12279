pub mod decompress;
pub mod device;
pub mod devices;
pub mod error;
pub mod frame;
pub mod memory;
pub mod port;
pub mod pubsub;
pub mod reassembly;
pub mod statemachine;
pub mod suppressor;

pub use device::{BackendRequest, BackendResponse, Driver, DriverConfig, DriverHandle};
pub use devices::Generation;
pub use error::{EmError, ErrorCode};
pub use pubsub::{Message, Value};
pub use statemachine::DeviceState;
