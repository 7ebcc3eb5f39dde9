mod error;
mod facade;
pub mod feed;
mod state;

pub use error::{FeedError, FeedResult};
pub use facade::{handlers, FeedEngine, FeedHandler, Handlers, Subscription};
pub use feed::config::{EngineConfig, TopicConfig, TopicConfigArgs};
pub use feed::stabilizer::ListFilter;
pub use feed::transport::{PullSource, PushStream, PushTransport, TransportFrame};
pub use feed::types::{
    Candle, CandleInterval, CandleSeriesView, ChannelState, DataSource, FeedMessage, FeedPayload,
    FeedUpdate, ListSnapshot, MessageKind, Topic, TopicStatusSnapshot,
};
