pub mod buffers;
pub mod callback;
pub mod config;
pub mod cpal_driver;
pub mod driver;
pub mod error;
pub mod message;
pub mod sample;
pub mod session;
pub mod sim;
pub mod transform;

pub use buffers::ChannelTopology;
pub use config::RouterConfig;
pub use error::{DriverError, SessionError};
pub use session::{DriverSession, SessionState};
