//! Stream adapter: frame decoding and the reconnecting consumer loop.

mod frame;
mod subscription;

pub use frame::{decode_frame, ops_by_type, CommitFrame, OpAction, RepoOp, StreamFrame};
pub use subscription::{EventSource, FirehoseSubscription, SubscriptionConfig, SubscriptionStats};
