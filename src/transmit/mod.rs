//! Data plane: transmitter/receiver pairing that moves file content
//! between sites, independent of the command channel.

pub mod protocol;
pub mod receiver;
pub mod transmitter;

pub use protocol::{Ack, AckStatus, TaskFlags, TaskStart, PROTOCOL_VERSION};
pub use receiver::{RunningReceiver, SiteReceiver, SiteReceiverConfig, DEFAULT_GAP_WAIT};
pub use transmitter::{Outbound, Transmitter};
