//! Transacted message-broker client.
//!
//! A [`BrokerMessenger`] owns one broker connection with one transacted
//! session. Senders and receivers bound to named destinations share that
//! session; every operation reports failure as a [`MessengerError`].
//!
//! ```no_run
//! use amq_messenger::{BrokerMessenger, Message, Messenger, Properties};
//!
//! # async fn demo() -> amq_messenger::Result<()> {
//! let messenger = BrokerMessenger::for_address("mock://broker")?;
//! messenger.connect("mock://broker", &Properties::new()).await?;
//!
//! let sender = messenger.create_sender("orders", &Properties::new()).await?;
//! messenger
//!     .send_message(sender, &Message::new("abc").with_header("type", "order"))
//!     .await?;
//!
//! let receiver = messenger.create_receiver("orders", &Properties::new()).await?;
//! let message = messenger.receive_message(receiver).await?;
//! assert_eq!(message.header("type"), Some("order"));
//!
//! messenger.shutdown().await
//! # }
//! ```

pub mod config;
pub mod env;
pub mod logging;
pub mod message;
pub mod messaging;
pub mod properties;
pub mod transport;

pub use message::Message;
pub use messaging::{
    BrokerMessenger, Messenger, MessengerError, MessengerState, ReceiverHandle, Result, SenderHandle,
    TransactionState,
};
pub use properties::{CommitMode, Properties};
