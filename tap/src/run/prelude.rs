use super::chan::{ChannelReceiver, ChannelSender};
use crate::request::{Reply, RequestKind};
use tokio::sync::oneshot;

/// Buffer of each per-slave request channel.
pub const CHANNEL_BUFFER_SIZE: usize = 100;

/// One-shot slot the proxy worker answers a single request on.
pub type ReplySender = oneshot::Sender<Reply>;
pub type ReplyReceiver = oneshot::Receiver<Reply>;

/// What the IPC handler hands to a proxy worker: the request kind, the raw
/// serialized request frame, and the slot to answer on.
pub type ProxyRequest = (RequestKind, String, ReplySender);
pub type ProxySender = ChannelSender<ProxyRequest>;
pub type ProxyReceiver = ChannelReceiver<ProxyRequest>;
