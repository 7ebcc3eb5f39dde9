use crate::error::{FeedError, FeedResult};
use crate::feed::transport::{PullSource, PushStream, PushTransport, TransportFrame};
use crate::feed::types::{parse_pull_payload, FeedMessage, Topic};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

/// Both sources address a topic by appending its path to their base URL.
fn topic_endpoint(base_url: &str, topic: &Topic) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), topic.as_str())
}

pub struct WebSocketTransport {
    base_url: String,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self, topic: &Topic) -> FeedResult<PushStream> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let request = topic_endpoint(&self.base_url, topic);
        let (stream, _) = connect_async_with_config(request, Some(ws_config), true)
            .await
            .map_err(|error| FeedError::transport(topic.as_str(), error))?;

        let topic_name = topic.to_string();
        let frames = stream.filter_map(move |frame| {
            let topic_name = topic_name.clone();
            async move {
                match frame {
                    Ok(Message::Text(text_payload)) => {
                        Some(Ok(TransportFrame::Payload(text_payload.into_bytes())))
                    }
                    Ok(Message::Binary(binary_payload)) => {
                        Some(Ok(TransportFrame::Payload(binary_payload)))
                    }
                    Ok(Message::Close(close_frame)) => Some(Ok(TransportFrame::Closed(
                        close_frame.map(|frame| frame.reason.to_string()),
                    ))),
                    Ok(_) => None,
                    Err(error) => Some(Err(FeedError::transport(topic_name, error))),
                }
            }
        });

        Ok(frames.boxed())
    }
}

pub struct HttpPullSource {
    client: Client,
    base_url: String,
}

impl HttpPullSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> FeedResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl PullSource for HttpPullSource {
    async fn fetch(&self, topic: &Topic) -> FeedResult<FeedMessage> {
        let endpoint = topic_endpoint(&self.base_url, topic);
        let response = self.client.get(endpoint).send().await?.error_for_status()?;
        let mut body = response.bytes().await?.to_vec();
        parse_pull_payload(topic, &mut body)
    }
}
