pub mod bootstrap;
pub mod close_code;
pub mod compression;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod outbound;
pub mod reconnect;
pub mod session;
pub mod shard;
pub mod transport;

pub use close_code::CloseCode;
pub use config::{GatewayConfig, ShardInfo};
pub use error::GatewayError;
pub use events::{DispatchEvent, EventBus, EventStream, GatewayEvent};
pub use reconnect::{ConnectQueue, ReconnectBackoff};
pub use session::Status;
pub use shard::{GatewayCommand, Shard};
pub use transport::{Connector, TungsteniteConnector};
