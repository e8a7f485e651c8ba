// src/messaging/mod.rs
// Messenger facade and the pieces it is built from

pub mod connection;
pub mod destination;
pub mod errors;
pub mod handle;
pub mod messenger;
pub mod receiver;
pub mod sender;
pub mod session;

pub use connection::{ConnectionManager, ConnectionState};
pub use destination::Destination;
pub use errors::{MessengerError, Result};
pub use handle::{ReceiverHandle, SenderHandle};
pub use messenger::{BrokerMessenger, Messenger, MessengerState};
pub use session::{TransactedSession, TransactionState};
