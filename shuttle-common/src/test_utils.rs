//! Message builders and an in-memory hub for tests, here and in the binaries' crates.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::events::StoreEvent;
use crate::hub::{EventStream, HubClient, HubError};
use crate::message::{
    CastAddBody, CastId, CastRemoveBody, HexBytes, LinkBody, Message, MessageData, MessageType,
    ReactionBody, ReactionType, UserDataBody, UserDataType, VerificationAddAddressBody,
    VerificationRemoveBody,
};
use crate::reconcile::ReconcileEntry;
use crate::shard::Sharding;
use crate::time::TimeSource;

/// A clock stuck at 2023-11-14T22:13:20Z.
pub struct TestClock;

impl TimeSource for TestClock {
    fn current_time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }
}

pub const CLOCK: TestClock = TestClock;

fn message(message_type: MessageType, fid: u64, hash: u8, timestamp: u32) -> (MessageData, HexBytes) {
    (MessageData::new(message_type, fid, timestamp), HexBytes(vec![hash]))
}

fn build(data: MessageData, hash: HexBytes) -> Message {
    Message {
        data: Some(data),
        hash,
    }
}

pub fn cast_add(fid: u64, hash: u8, timestamp: u32, text: &str) -> Message {
    let (mut data, hash) = message(MessageType::CastAdd, fid, hash, timestamp);
    data.cast_add_body = Some(CastAddBody {
        text: text.to_owned(),
        ..Default::default()
    });
    build(data, hash)
}

pub fn cast_reply(
    fid: u64,
    hash: u8,
    timestamp: u32,
    text: &str,
    parent_fid: u64,
    parent_hash: u8,
) -> Message {
    let mut reply = cast_add(fid, hash, timestamp, text);
    if let Some(body) = reply
        .data
        .as_mut()
        .and_then(|data| data.cast_add_body.as_mut())
    {
        body.parent_cast_id = Some(CastId {
            fid: parent_fid,
            hash: HexBytes(vec![parent_hash]),
        });
    }
    reply
}

pub fn cast_remove(fid: u64, hash: u8, timestamp: u32, target_hash: u8) -> Message {
    let (mut data, hash) = message(MessageType::CastRemove, fid, hash, timestamp);
    data.cast_remove_body = Some(CastRemoveBody {
        target_hash: Some(HexBytes(vec![target_hash])),
    });
    build(data, hash)
}

fn reaction_type(code: u8) -> ReactionType {
    match code {
        1 => ReactionType::Like,
        2 => ReactionType::Recast,
        _ => ReactionType::Unspecified,
    }
}

fn reaction(
    message_type: MessageType,
    fid: u64,
    hash: u8,
    timestamp: u32,
    code: u8,
    target_hash: u8,
) -> Message {
    let (mut data, hash) = message(message_type, fid, hash, timestamp);
    data.reaction_body = Some(ReactionBody {
        reaction_type: Some(reaction_type(code)),
        target_cast_id: Some(CastId {
            fid: 1,
            hash: HexBytes(vec![target_hash]),
        }),
        target_url: None,
    });
    build(data, hash)
}

/// A reaction of type `code` (1 like, 2 recast) to the cast `target_hash` of fid 1.
pub fn reaction_add(fid: u64, hash: u8, timestamp: u32, code: u8, target_hash: u8) -> Message {
    reaction(MessageType::ReactionAdd, fid, hash, timestamp, code, target_hash)
}

pub fn reaction_remove(fid: u64, hash: u8, timestamp: u32, code: u8, target_hash: u8) -> Message {
    reaction(MessageType::ReactionRemove, fid, hash, timestamp, code, target_hash)
}

pub fn url_reaction_add(fid: u64, hash: u8, timestamp: u32, code: u8, url: &str) -> Message {
    let (mut data, hash) = message(MessageType::ReactionAdd, fid, hash, timestamp);
    data.reaction_body = Some(ReactionBody {
        reaction_type: Some(reaction_type(code)),
        target_cast_id: None,
        target_url: Some(url.to_owned()),
    });
    build(data, hash)
}

fn link(
    message_type: MessageType,
    fid: u64,
    hash: u8,
    timestamp: u32,
    link_type: &str,
    target_fid: u64,
) -> Message {
    let (mut data, hash) = message(message_type, fid, hash, timestamp);
    data.link_body = Some(LinkBody {
        link_type: Some(link_type.to_owned()),
        target_fid: Some(target_fid),
        display_timestamp: None,
    });
    build(data, hash)
}

pub fn link_add(fid: u64, hash: u8, timestamp: u32, link_type: &str, target_fid: u64) -> Message {
    link(MessageType::LinkAdd, fid, hash, timestamp, link_type, target_fid)
}

pub fn link_remove(fid: u64, hash: u8, timestamp: u32, link_type: &str, target_fid: u64) -> Message {
    link(MessageType::LinkRemove, fid, hash, timestamp, link_type, target_fid)
}

fn user_data_type(code: i16) -> UserDataType {
    match code {
        1 => UserDataType::Pfp,
        2 => UserDataType::Display,
        3 => UserDataType::Bio,
        5 => UserDataType::Url,
        6 => UserDataType::Username,
        7 => UserDataType::Location,
        8 => UserDataType::Twitter,
        9 => UserDataType::Github,
        10 => UserDataType::Banner,
        11 => UserDataType::PrimaryAddressEthereum,
        12 => UserDataType::PrimaryAddressSolana,
        _ => UserDataType::Unspecified,
    }
}

pub fn user_data_add(fid: u64, hash: u8, timestamp: u32, code: i16, value: &str) -> Message {
    let (mut data, hash) = message(MessageType::UserDataAdd, fid, hash, timestamp);
    data.user_data_body = Some(UserDataBody {
        user_data_type: Some(user_data_type(code)),
        value: Some(value.to_owned()),
    });
    build(data, hash)
}

pub fn verification_add(fid: u64, hash: u8, timestamp: u32, address: u8) -> Message {
    let (mut data, hash) = message(MessageType::VerificationAddAddress, fid, hash, timestamp);
    data.verification_add_address_body = Some(VerificationAddAddressBody {
        address: Some(HexBytes(vec![address])),
        claim_signature: Some(HexBytes(vec![0x51])),
        block_hash: Some(HexBytes(vec![0xb1])),
        protocol: None,
    });
    build(data, hash)
}

pub fn verification_remove(fid: u64, hash: u8, timestamp: u32, address: u8) -> Message {
    let (mut data, hash) = message(MessageType::VerificationRemove, fid, hash, timestamp);
    data.verification_remove_body = Some(VerificationRemoveBody {
        address: Some(HexBytes(vec![address])),
        protocol: None,
    });
    build(data, hash)
}

#[derive(Default)]
struct MockHubState {
    events: Vec<StoreEvent>,
    /// Ids of hub events served as undecodable.
    undecodable: Vec<u64>,
    messages: HashMap<u64, Vec<ReconcileEntry>>,
    max_fid: Option<u64>,
    failing_subscriptions: usize,
    unavailable: bool,
    subscriptions: usize,
    /// Events the latest subscription has yet to hand out.
    remaining: Option<Arc<AtomicUsize>>,
    fetched: Vec<u64>,
}

/// A hub serving a fixed event log and fixed per-identity message sets.
/// Subscriptions never end on their own, like a live stream that caught up.
#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<Mutex<MockHubState>>,
}

impl MockHub {
    fn with_state<T>(&self, f: impl FnOnce(&mut MockHubState) -> T) -> T {
        let mut state = self.state.lock().expect("poisoned MockHub mutex");
        f(&mut state)
    }

    pub fn with_events(self, events: Vec<StoreEvent>) -> Self {
        self.with_state(|state| state.events = events);
        self
    }

    pub fn with_undecodable_events(self, event_ids: Vec<u64>) -> Self {
        self.with_state(|state| state.undecodable = event_ids);
        self
    }

    pub fn with_messages(self, fid: u64, entries: Vec<ReconcileEntry>) -> Self {
        self.with_state(|state| state.messages.insert(fid, entries));
        self
    }

    pub fn with_max_fid(self, max_fid: u64) -> Self {
        self.with_state(|state| state.max_fid = Some(max_fid));
        self
    }

    /// The next `count` subscriptions fail with `HubError::Unavailable`.
    pub fn failing_subscriptions(self, count: usize) -> Self {
        self.with_state(|state| state.failing_subscriptions = count);
        self
    }

    /// Every call fails with `HubError::Unavailable`.
    pub fn unavailable(self) -> Self {
        self.with_state(|state| state.unavailable = true);
        self
    }

    pub fn subscriptions(&self) -> usize {
        self.with_state(|state| state.subscriptions)
    }

    /// Whether the latest subscription handed out every event it had.
    pub fn is_drained(&self) -> bool {
        self.with_state(|state| {
            state
                .remaining
                .as_ref()
                .is_some_and(|remaining| remaining.load(Ordering::SeqCst) == 0)
        })
    }

    /// Identities whose message set was fetched, in call order.
    pub fn fetched(&self) -> Vec<u64> {
        self.with_state(|state| state.fetched.clone())
    }
}

fn unavailable() -> HubError {
    HubError::Unavailable("mock hub is down".to_owned())
}

#[async_trait]
impl HubClient for MockHub {
    fn subscribe(&self, sharding: Sharding, from: Option<u64>) -> EventStream {
        self.with_state(|state| {
            state.subscriptions += 1;
            if state.unavailable || state.failing_subscriptions > 0 {
                state.failing_subscriptions = state.failing_subscriptions.saturating_sub(1);
                return stream::iter(vec![Err(unavailable())]).boxed();
            }

            let mut items: Vec<(u64, Result<StoreEvent, HubError>)> = state
                .events
                .iter()
                .filter(|event| event.message.fid().is_some_and(|fid| sharding.owns(fid)))
                .map(|event| (event.event_id, Ok(event.clone())))
                .chain(state.undecodable.iter().map(|event_id| {
                    let undecodable = HubError::UndecodableEvent {
                        event_id: Some(*event_id),
                        reason: "mock hub sent garbage".to_owned(),
                    };
                    (*event_id, Err(undecodable))
                }))
                .filter(|(event_id, _)| from.map_or(true, |from| *event_id >= from))
                .collect();
            items.sort_by_key(|(event_id, _)| *event_id);
            let remaining = Arc::new(AtomicUsize::new(items.len()));
            state.remaining = Some(remaining.clone());

            stream::iter(items.into_iter().map(|(_, item)| item))
                .inspect(move |_| {
                    remaining.fetch_sub(1, Ordering::SeqCst);
                })
                .chain(stream::pending())
                .boxed()
        })
    }

    async fn max_fid(&self) -> Result<u64, HubError> {
        self.with_state(|state| {
            if state.unavailable {
                return Err(unavailable());
            }
            state.max_fid.ok_or(HubError::NoFids)
        })
    }

    async fn full_message_set(&self, fid: u64) -> Result<Vec<ReconcileEntry>, HubError> {
        self.with_state(|state| {
            if state.unavailable {
                return Err(unavailable());
            }
            state.fetched.push(fid);
            Ok(state.messages.get(&fid).cloned().unwrap_or_default())
        })
    }
}
