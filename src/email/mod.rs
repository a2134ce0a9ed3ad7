//! Email messages, transports, and the rate limited send path.

mod message;
mod sender;
mod service;

pub use message::{OutboundEmail, Recipient, SendReceipt};
pub use sender::{sender_from_config, EmailSender, LogSender, SimulatedSender};
pub use service::EmailService;
