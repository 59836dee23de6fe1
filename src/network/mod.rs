//! Network subsystem for UDP audio transport

pub mod dedup;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use dedup::{DedupOutcome, DedupWindow};
pub use receiver::{AudioReceiver, ControlReplies, ReceiverStats, ReceiverStatsSnapshot};
pub use sender::{AudioSender, SenderStats, SenderStatsSnapshot};
pub use udp::{bind_addr, create_socket, UdpSocket};
