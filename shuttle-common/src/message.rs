//! # Message
//!
//! Decoded hub protocol messages, as rendered by the hub's HTTP/JSON API.
//!
//! Bodies keep every field optional: the hub may omit fields it considers empty, and it is the
//! job of the per-family mapping functions in `materializer` to decide what is required.
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a valid hex string")]
pub struct ParseHexBytesError(pub String);

/// Raw bytes carried by a message (hashes, addresses, signatures), rendered as `0x`-prefixed hex.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HexBytes(pub Vec<u8>);

impl HexBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        HexBytes(bytes)
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        HexBytes(bytes.to_vec())
    }
}

impl FromStr for HexBytes {
    type Err = ParseHexBytesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        hex::decode(digits)
            .map(HexBytes)
            .map_err(|_| ParseHexBytesError(s.to_owned()))
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for HexBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HexBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Discriminant of a message body.
/// Types the mirror does not materialize are still listed so they are matched explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum MessageType {
    #[serde(rename = "MESSAGE_TYPE_CAST_ADD")]
    CastAdd,
    #[serde(rename = "MESSAGE_TYPE_CAST_REMOVE")]
    CastRemove,
    #[serde(rename = "MESSAGE_TYPE_REACTION_ADD")]
    ReactionAdd,
    #[serde(rename = "MESSAGE_TYPE_REACTION_REMOVE")]
    ReactionRemove,
    #[serde(rename = "MESSAGE_TYPE_LINK_ADD")]
    LinkAdd,
    #[serde(rename = "MESSAGE_TYPE_LINK_REMOVE")]
    LinkRemove,
    #[serde(rename = "MESSAGE_TYPE_LINK_COMPACT_STATE")]
    LinkCompactState,
    #[serde(rename = "MESSAGE_TYPE_VERIFICATION_ADD_ETH_ADDRESS")]
    VerificationAddAddress,
    #[serde(rename = "MESSAGE_TYPE_VERIFICATION_REMOVE")]
    VerificationRemove,
    #[serde(rename = "MESSAGE_TYPE_USER_DATA_ADD")]
    UserDataAdd,
    #[serde(rename = "MESSAGE_TYPE_USERNAME_PROOF")]
    UsernameProof,
    #[serde(rename = "MESSAGE_TYPE_FRAME_ACTION")]
    FrameAction,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Whether this message type adds state (as opposed to removing it).
    pub fn is_add(&self) -> bool {
        matches!(
            self,
            MessageType::CastAdd
                | MessageType::ReactionAdd
                | MessageType::LinkAdd
                | MessageType::VerificationAddAddress
                | MessageType::UserDataAdd
                | MessageType::UsernameProof
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CastId {
    pub fid: u64,
    pub hash: HexBytes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastAddBody {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub embeds: Vec<serde_json::Value>,
    #[serde(default)]
    pub mentions: Vec<u64>,
    #[serde(default)]
    pub mentions_positions: Vec<u32>,
    pub parent_cast_id: Option<CastId>,
    pub parent_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastRemoveBody {
    pub target_hash: Option<HexBytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ReactionType {
    #[serde(rename = "REACTION_TYPE_LIKE")]
    Like,
    #[serde(rename = "REACTION_TYPE_RECAST")]
    Recast,
    #[serde(other)]
    Unspecified,
}

impl ReactionType {
    /// Protocol code stored in the `type` column.
    pub fn code(&self) -> Option<i16> {
        match self {
            ReactionType::Like => Some(1),
            ReactionType::Recast => Some(2),
            ReactionType::Unspecified => None,
        }
    }
}

/// Shared by `ReactionAdd` and `ReactionRemove`: a remove names the reaction it removes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionBody {
    #[serde(rename = "type")]
    pub reaction_type: Option<ReactionType>,
    pub target_cast_id: Option<CastId>,
    pub target_url: Option<String>,
}

/// Shared by `LinkAdd` and `LinkRemove`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkBody {
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    pub target_fid: Option<u64>,
    pub display_timestamp: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UserDataType {
    #[serde(rename = "USER_DATA_TYPE_PFP")]
    Pfp,
    #[serde(rename = "USER_DATA_TYPE_DISPLAY")]
    Display,
    #[serde(rename = "USER_DATA_TYPE_BIO")]
    Bio,
    #[serde(rename = "USER_DATA_TYPE_URL")]
    Url,
    #[serde(rename = "USER_DATA_TYPE_USERNAME")]
    Username,
    #[serde(rename = "USER_DATA_TYPE_LOCATION")]
    Location,
    #[serde(rename = "USER_DATA_TYPE_TWITTER")]
    Twitter,
    #[serde(rename = "USER_DATA_TYPE_GITHUB")]
    Github,
    #[serde(rename = "USER_DATA_TYPE_BANNER")]
    Banner,
    #[serde(rename = "USER_DATA_PRIMARY_ADDRESS_ETHEREUM")]
    PrimaryAddressEthereum,
    #[serde(rename = "USER_DATA_PRIMARY_ADDRESS_SOLANA")]
    PrimaryAddressSolana,
    #[serde(other)]
    Unspecified,
}

impl UserDataType {
    pub fn code(&self) -> Option<i16> {
        match self {
            UserDataType::Pfp => Some(1),
            UserDataType::Display => Some(2),
            UserDataType::Bio => Some(3),
            UserDataType::Url => Some(5),
            UserDataType::Username => Some(6),
            UserDataType::Location => Some(7),
            UserDataType::Twitter => Some(8),
            UserDataType::Github => Some(9),
            UserDataType::Banner => Some(10),
            UserDataType::PrimaryAddressEthereum => Some(11),
            UserDataType::PrimaryAddressSolana => Some(12),
            UserDataType::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataBody {
    #[serde(rename = "type")]
    pub user_data_type: Option<UserDataType>,
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    #[serde(rename = "PROTOCOL_ETHEREUM")]
    Ethereum,
    #[serde(rename = "PROTOCOL_SOLANA")]
    Solana,
    #[serde(other)]
    Unknown,
}

impl Protocol {
    pub fn code(&self) -> Option<i16> {
        match self {
            Protocol::Ethereum => Some(0),
            Protocol::Solana => Some(1),
            Protocol::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationAddAddressBody {
    pub address: Option<HexBytes>,
    pub claim_signature: Option<HexBytes>,
    pub block_hash: Option<HexBytes>,
    pub protocol: Option<Protocol>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRemoveBody {
    pub address: Option<HexBytes>,
    pub protocol: Option<Protocol>,
}

/// The signed payload of a message. At most one body is populated, matching `message_type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub fid: Option<u64>,
    /// Farcaster time, see [`crate::time`].
    pub timestamp: Option<u32>,
    pub cast_add_body: Option<CastAddBody>,
    pub cast_remove_body: Option<CastRemoveBody>,
    pub reaction_body: Option<ReactionBody>,
    pub link_body: Option<LinkBody>,
    pub user_data_body: Option<UserDataBody>,
    #[serde(alias = "verificationAddEthAddressBody")]
    pub verification_add_address_body: Option<VerificationAddAddressBody>,
    pub verification_remove_body: Option<VerificationRemoveBody>,
}

impl MessageData {
    /// Empty data of the given type, to be filled in by the caller.
    pub fn new(message_type: MessageType, fid: u64, timestamp: u32) -> Self {
        Self {
            message_type,
            fid: Some(fid),
            timestamp: Some(timestamp),
            cast_add_body: None,
            cast_remove_body: None,
            reaction_body: None,
            link_body: None,
            user_data_body: None,
            verification_add_address_body: None,
            verification_remove_body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub data: Option<MessageData>,
    pub hash: HexBytes,
}

impl Message {
    pub fn message_type(&self) -> Option<MessageType> {
        self.data.as_ref().map(|data| data.message_type)
    }

    pub fn fid(&self) -> Option<u64> {
        self.data.as_ref().and_then(|data| data.fid)
    }

    pub fn timestamp(&self) -> Option<u32> {
        self.data.as_ref().and_then(|data| data.timestamp)
    }

    pub fn is_add(&self) -> bool {
        self.message_type()
            .map(|message_type| message_type.is_add())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_bytes_parse_and_display() {
        let bytes: HexBytes = "0xaabb".parse().unwrap();
        assert_eq!(bytes.as_bytes(), &[0xaa, 0xbb]);
        assert_eq!(bytes.to_string(), "0xaabb");

        let unprefixed: HexBytes = "aabb".parse().unwrap();
        assert_eq!(unprefixed, bytes);

        assert!("0xzz".parse::<HexBytes>().is_err());
    }

    #[test]
    fn test_deserialize_cast_add_message() {
        let json = r#"{
            "data": {
                "type": "MESSAGE_TYPE_CAST_ADD",
                "fid": 2,
                "timestamp": 48994466,
                "network": "FARCASTER_NETWORK_MAINNET",
                "castAddBody": {
                    "embedsDeprecated": [],
                    "mentions": [3],
                    "parentCastId": {"fid": 226, "hash": "0xa48dd46161d8e57725f5e26e34ec19c13ff7f3b9"},
                    "text": "Cast Text",
                    "mentionsPositions": [5],
                    "embeds": [{"url": "https://example.com"}]
                }
            },
            "hash": "0xd2b1ddc6c88e865a33cb1a565e0058d757042974",
            "hashScheme": "HASH_SCHEME_BLAKE3"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();

        assert_eq!(message.message_type(), Some(MessageType::CastAdd));
        assert_eq!(message.fid(), Some(2));
        assert!(message.is_add());
        let body = message.data.unwrap().cast_add_body.unwrap();
        assert_eq!(body.text, "Cast Text");
        assert_eq!(body.mentions, vec![3]);
        assert_eq!(body.parent_cast_id.unwrap().fid, 226);
    }

    #[test]
    fn test_deserialize_unknown_message_type() {
        let json = r#"{
            "data": {"type": "MESSAGE_TYPE_SOMETHING_NEW", "fid": 1, "timestamp": 1},
            "hash": "0x01"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();

        assert_eq!(message.message_type(), Some(MessageType::Unknown));
        assert!(!message.is_add());
    }

    #[test]
    fn test_deserialize_legacy_verification_body_name() {
        let json = r#"{
            "data": {
                "type": "MESSAGE_TYPE_VERIFICATION_ADD_ETH_ADDRESS",
                "fid": 1,
                "timestamp": 1,
                "verificationAddEthAddressBody": {"address": "0x0102", "blockHash": "0x03"}
            },
            "hash": "0x01"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();
        let body = message.data.unwrap().verification_add_address_body.unwrap();

        assert_eq!(body.address, Some(HexBytes(vec![1, 2])));
        assert_eq!(body.protocol, None);
    }

    #[test]
    fn test_deserialize_unknown_protocol() {
        let json = r#"{
            "data": {
                "type": "MESSAGE_TYPE_VERIFICATION_ADD_ETH_ADDRESS",
                "fid": 1,
                "timestamp": 1,
                "verificationAddAddressBody": {"address": "0x0102", "protocol": "PROTOCOL_FUTURE"}
            },
            "hash": "0x01"
        }"#;

        let message: Message = serde_json::from_str(json).unwrap();
        let body = message.data.unwrap().verification_add_address_body.unwrap();

        assert_eq!(body.protocol, Some(Protocol::Unknown));
        assert_eq!(Protocol::Unknown.code(), None);
    }
}
