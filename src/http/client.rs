use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response};
use std::fmt::Display;

use crate::core::FlagSyncOptions;
use crate::datasource::{EventStream, StreamEvent, Transport};
use crate::error::{DataSourceError, ErrorCode, FlagSyncError};
use crate::types::{Identity, Snapshot};

const POLL_PATH: &str = "/sdk/evalx/context";
const STREAM_PATH: &str = "/sdk/stream";
const SDK_USER_AGENT: &str = concat!("FlagSync-Rust/", env!("CARGO_PKG_VERSION"));

/// [`Transport`] over HTTPS.
///
/// Polling posts the identity to the evaluation endpoint and reads back the
/// full key to item map. Streaming posts it to the stream endpoint and reads
/// `put`/`patch`/`delete`/`ping` server-sent events.
pub struct HttpTransport {
    poll_client: Client,
    stream_client: Client,
    base_uri: String,
    stream_uri: String,
    mobile_key: String,
}

impl HttpTransport {
    pub fn new(options: &FlagSyncOptions) -> crate::error::Result<Self> {
        let poll_client = Client::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| {
                FlagSyncError::with_source(ErrorCode::NetworkError, "Failed to create HTTP client", e)
            })?;

        // A total timeout would cut long-lived streams; bound the connect only.
        let stream_client = Client::builder()
            .connect_timeout(options.timeout)
            .build()
            .map_err(|e| {
                FlagSyncError::with_source(
                    ErrorCode::NetworkError,
                    "Failed to create streaming HTTP client",
                    e,
                )
            })?;

        Ok(Self {
            poll_client,
            stream_client,
            base_uri: options.base_uri.trim_end_matches('/').to_string(),
            stream_uri: options.stream_uri.trim_end_matches('/').to_string(),
            mobile_key: options.mobile_key.clone(),
        })
    }

    pub fn poll_url(&self) -> String {
        format!("{}{}", self.base_uri, POLL_PATH)
    }

    pub fn stream_url(&self) -> String {
        format!("{}{}", self.stream_uri, STREAM_PATH)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_once(&self, identity: &Identity) -> Result<Snapshot, DataSourceError> {
        let response = self
            .poll_client
            .post(self.poll_url())
            .header(AUTHORIZATION, &self.mobile_key)
            .header(USER_AGENT, SDK_USER_AGENT)
            .header(CONTENT_TYPE, "application/json")
            .json(identity)
            .send()
            .await
            .map_err(convert_error)?;
        let response = check_status(response)?;

        let body = response.text().await.map_err(convert_error)?;
        let snapshot: Snapshot = serde_json::from_str(&body)
            .map_err(|e| DataSourceError::invalid_data(format!("Failed to parse flags: {}", e)))?;
        Ok(Snapshot::from_map(snapshot.into_items()))
    }

    async fn subscribe(&self, identity: &Identity) -> Result<EventStream, DataSourceError> {
        let response = self
            .stream_client
            .post(self.stream_url())
            .header(AUTHORIZATION, &self.mobile_key)
            .header(USER_AGENT, SDK_USER_AGENT)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .json(identity)
            .send()
            .await
            .map_err(convert_error)?;
        let response = check_status(response)?;

        Ok(decode_events(response.bytes_stream()))
    }
}

/// Turns a `text/event-stream` body into stream events.
///
/// Unknown event types are skipped; a read failure ends up as a network error.
fn decode_events<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    bytes
        .eventsource()
        .filter_map(|message| async move {
            match message {
                Ok(message) => StreamEvent::parse(&message.event, &message.data).transpose(),
                Err(e) => Some(Err(DataSourceError::network(format!(
                    "Stream read failed: {}",
                    e
                )))),
            }
        })
        .boxed()
}

fn check_status(response: Response) -> Result<Response, DataSourceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(DataSourceError::response(status.as_u16()))
    }
}

fn convert_error(error: reqwest::Error) -> DataSourceError {
    if error.is_timeout() {
        DataSourceError::network(format!("Request timed out: {}", error))
    } else if error.is_connect() {
        DataSourceError::network(format!("Connection failed: {}", error))
    } else if error.is_decode() {
        DataSourceError::invalid_data(error.to_string())
    } else {
        DataSourceError::network(error.to_string())
    }
}
