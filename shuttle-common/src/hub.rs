//! # Hub
//!
//! The authoritative source: its event stream, its identity range and the per-identity message
//! sets used by reconciliation.
use std::collections::VecDeque;
use std::time;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::events::{HubEvent, StoreEvent};
use crate::message::Message;
use crate::reconcile::ReconcileEntry;
use crate::shard::Sharding;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("hub could not be reached but may be retried: {0}")]
    Unavailable(String),
    #[error("hub rejected request to {url} with status {status}")]
    Rejected { url: String, status: u16 },
    #[error("could not decode hub response: {0}")]
    Decode(String),
    #[error("hub event {event_id:?} could not be decoded: {reason}")]
    UndecodableEvent {
        event_id: Option<u64>,
        reason: String,
    },
    #[error("hub reported no registered fids")]
    NoFids,
    #[error("invalid hub url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl HubError {
    /// Whether the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Unavailable(_))
    }
}

pub type EventStream = BoxStream<'static, Result<StoreEvent, HubError>>;

#[async_trait]
pub trait HubClient: Send + Sync {
    /// Ordered observations for the identities owned by `sharding`, starting at hub event `from`
    /// inclusive, or at the start of the retained history if `None`.
    /// The stream ends after yielding an error; callers resubscribe. `UndecodableEvent` is the
    /// exception: it stands in for one event and the stream carries on after it.
    fn subscribe(&self, sharding: Sharding, from: Option<u64>) -> EventStream;

    /// The highest registered identity.
    async fn max_fid(&self) -> Result<u64, HubError>;

    /// Every message the hub holds for an identity, removes included.
    async fn full_message_set(&self, fid: u64) -> Result<Vec<ReconcileEntry>, HubError>;
}

/// Per-family endpoints serving every message held for an identity: adds and removes both.
const ALL_MESSAGES_BY_FID: [&str; 5] = [
    "/v1/allCastMessagesByFid",
    "/v1/allReactionMessagesByFid",
    "/v1/allLinkMessagesByFid",
    "/v1/allVerificationMessagesByFid",
    "/v1/allUserDataMessagesByFid",
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    /// Decoded one at a time, see [`decode_events`].
    #[serde(default)]
    events: Vec<serde_json::Value>,
    next_page_event_id: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesPage {
    #[serde(default)]
    messages: Vec<Message>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct FidsPage {
    #[serde(default)]
    fids: Vec<u64>,
}

/// Client of the hub's HTTP/JSON API.
#[derive(Clone)]
pub struct HttpHubClient {
    client: reqwest::Client,
    base_url: Url,
    page_size: u32,
    poll_interval: time::Duration,
}

impl HttpHubClient {
    pub fn new(
        base_url: &str,
        request_timeout: time::Duration,
        page_size: u32,
        poll_interval: time::Duration,
    ) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .user_agent("Shuttle Hub Mirror")
            .timeout(request_timeout)
            .build()
            .map_err(|error| HubError::Unavailable(error.to_string()))?;

        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            page_size,
            poll_interval,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, HubError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut().extend_pairs(query);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|error| HubError::Unavailable(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(HubError::Unavailable(format!("{url} returned {status}")));
        }
        if !status.is_success() {
            return Err(HubError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|error| HubError::Decode(error.to_string()))
    }

    /// Follow `nextPageToken` through a `ByFid` endpoint.
    async fn messages_by_fid(&self, path: &str, fid: u64) -> Result<Vec<Message>, HubError> {
        let mut messages = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("fid", fid.to_string()), ("pageSize", self.page_size.to_string())];
            if let Some(token) = page_token.take() {
                query.push(("pageToken", token));
            }

            let page: MessagesPage = self.get(path, &query).await?;
            messages.extend(page.messages);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(messages)
    }
}

/// Decode a page of raw events, keeping the observations owned by `sharding`.
/// An event that does not decode is replaced by an `UndecodableEvent` error instead of
/// failing the page, unless it visibly belongs to another shard.
fn decode_events(
    events: Vec<serde_json::Value>,
    sharding: &Sharding,
) -> Vec<Result<StoreEvent, HubError>> {
    let mut decoded = Vec::new();

    for raw in events {
        let event_id = raw.get("id").and_then(serde_json::Value::as_u64);
        let fid = raw_event_fid(&raw);

        match serde_json::from_value::<HubEvent>(raw) {
            Ok(event) => match event.fid() {
                Some(fid) if sharding.owns(fid) => {
                    decoded.extend(event.into_store_events().into_iter().map(Ok))
                }
                _ => (),
            },
            Err(error) if fid.map_or(true, |fid| sharding.owns(fid)) => {
                decoded.push(Err(HubError::UndecodableEvent {
                    event_id,
                    reason: error.to_string(),
                }))
            }
            Err(_) => (),
        }
    }

    decoded
}

fn raw_event_fid(raw: &serde_json::Value) -> Option<u64> {
    ["mergeMessageBody", "pruneMessageBody", "revokeMessageBody"]
        .iter()
        .find_map(|body| {
            raw.pointer(&format!("/{body}/message/data/fid"))
                .and_then(serde_json::Value::as_u64)
        })
}

struct PollState {
    hub: HttpHubClient,
    sharding: Sharding,
    next_event_id: Option<u64>,
    buffered: VecDeque<Result<StoreEvent, HubError>>,
    failed: bool,
}

#[async_trait]
impl HubClient for HttpHubClient {
    fn subscribe(&self, sharding: Sharding, from: Option<u64>) -> EventStream {
        let state = PollState {
            hub: self.clone(),
            sharding,
            next_event_id: from,
            buffered: VecDeque::new(),
            failed: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }

            loop {
                if let Some(event) = state.buffered.pop_front() {
                    return Some((event, state));
                }

                let mut query = vec![("pageSize", state.hub.page_size.to_string())];
                if let Some(from) = state.next_event_id {
                    query.push(("from_event_id", from.to_string()));
                }

                let page: EventsPage = match state.hub.get("/v1/events", &query).await {
                    Ok(page) => page,
                    Err(error) => {
                        state.failed = true;
                        return Some((Err(error), state));
                    }
                };

                let last_id = page
                    .events
                    .iter()
                    .filter_map(|raw| raw.get("id").and_then(serde_json::Value::as_u64))
                    .max();
                state
                    .buffered
                    .extend(decode_events(page.events, &state.sharding));

                match (page.next_page_event_id, last_id) {
                    (Some(next), _) if Some(next) != state.next_event_id => {
                        state.next_event_id = Some(next)
                    }
                    (_, Some(last)) => state.next_event_id = Some(last + 1),
                    _ => {
                        debug!(next_event_id = ?state.next_event_id, "caught up with hub, polling");
                        tokio::time::sleep(state.hub.poll_interval).await;
                    }
                }
            }
        })
        .boxed()
    }

    async fn max_fid(&self) -> Result<u64, HubError> {
        let page: FidsPage = self
            .get(
                "/v1/fids",
                &[("pageSize", "1".to_owned()), ("reverse", "1".to_owned())],
            )
            .await?;

        page.fids.first().copied().ok_or(HubError::NoFids)
    }

    async fn full_message_set(&self, fid: u64) -> Result<Vec<ReconcileEntry>, HubError> {
        let mut messages = Vec::new();
        for path in ALL_MESSAGES_BY_FID {
            messages.extend(self.messages_by_fid(path, fid).await?);
        }

        // Pruned and revoked messages are absent from these sets rather than flagged, so the
        // reconciler reports them as local-only rows.
        Ok(messages.into_iter().map(ReconcileEntry::active).collect())
    }
}
