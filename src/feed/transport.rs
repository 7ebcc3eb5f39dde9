use crate::error::FeedResult;
use crate::feed::types::{FeedMessage, Topic};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// One inbound frame of a push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Payload(Vec<u8>),
    Closed(Option<String>),
}

pub type PushStream = BoxStream<'static, FeedResult<TransportFrame>>;

/// Opens push connections. Dropping the returned stream tears the
/// connection down.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    async fn connect(&self, topic: &Topic) -> FeedResult<PushStream>;
}

/// Request/response source used while the push channel is not delivering.
/// Must return a full snapshot and be safe to retry.
#[async_trait]
pub trait PullSource: Send + Sync + 'static {
    async fn fetch(&self, topic: &Topic) -> FeedResult<FeedMessage>;
}
