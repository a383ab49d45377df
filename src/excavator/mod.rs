pub mod protocol;
pub mod resource;
pub mod server;
pub mod transport;

pub use protocol::{ExcavatorError, ExcavatorMethod, ExcavatorResult};
pub use server::{ephemeral_address, ExcavatorServer, ServerConfig, Subscription, WorkerInfo};
pub use transport::Transport;
