pub mod broadcaster;
pub mod error;
pub mod fakes;
pub mod gateway;
pub mod registry;
pub mod suspension;
pub mod tools;
pub mod traits;
pub mod types;

pub use broadcaster::StatusBroadcaster;
pub use error::PendingCallError;
pub use gateway::{DeliveryAck, DeliveryGateway};
pub use registry::{Conversations, PendingCallRegistry, RegistrationHandle};
pub use suspension::{TimeoutPolicy, TurnSuspensionPoint};
pub use traits::*;
pub use types::*;
