// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The event model.
//!
//! Events are a tagged variant keyed on the wire `type` string. Known types
//! decode into the variants of [`AnyEventContent`]; everything else lands in
//! [`AnyEventContent::Unrecognized`], which keeps the raw content so the
//! event round-trips losslessly. Decoding a single event never fails the
//! surrounding batch.

pub mod account_data;
pub mod ephemeral;
pub mod room;

use serde_json::{json, Value as JsonValue};
use tracing::warn;

pub use account_data::{
    DirectEventContent, FullyReadEventContent, IgnoredUserListEventContent, TagEventContent,
    TagInfo,
};
pub use ephemeral::{Receipt, ReceiptEventContent, Receipts, TypingEventContent};
pub use room::{
    AliasesEventContent, CanonicalAliasEventContent, CreateEventContent, MemberEventContent,
    MembershipState, MessageEventContent, NameEventContent, RedactionEventContent,
    TopicEventContent,
};

use crate::identifiers::{EventId, RoomId, UserId};

/// The parsed content of any event the runtime knows about.
#[derive(Clone, Debug, PartialEq)]
pub enum AnyEventContent {
    /// `m.room.message`
    RoomMessage(MessageEventContent),
    /// `m.room.name`
    RoomName(NameEventContent),
    /// `m.room.canonical_alias`
    RoomCanonicalAlias(CanonicalAliasEventContent),
    /// `m.room.aliases`
    RoomAliases(AliasesEventContent),
    /// `m.room.topic`
    RoomTopic(TopicEventContent),
    /// `m.room.member`
    RoomMember(MemberEventContent),
    /// `m.room.create`
    RoomCreate(CreateEventContent),
    /// `m.room.redaction`
    RoomRedaction(RedactionEventContent),
    /// `m.receipt`
    Receipt(ReceiptEventContent),
    /// `m.typing`
    Typing(TypingEventContent),
    /// `m.direct`
    Direct(DirectEventContent),
    /// `m.ignored_user_list`
    IgnoredUserList(IgnoredUserListEventContent),
    /// `m.tag`
    Tag(TagEventContent),
    /// `m.fully_read`
    FullyRead(FullyReadEventContent),
    /// The tombstone left in place of a redacted event.
    Redacted {
        /// The type the event had before it was redacted.
        original_type: String,
    },
    /// An event of a type this crate has no parser for; kept verbatim.
    Unrecognized {
        /// The wire `type` string.
        event_type: String,
        /// The raw, unparsed content object.
        content: JsonValue,
    },
}

macro_rules! parse_content {
    ($variant:ident, $event_type:expr, $content:expr) => {
        match serde_json::from_value($content.clone()) {
            Ok(c) => AnyEventContent::$variant(c),
            Err(e) => {
                warn!("failed to parse content of a {} event: {}", $event_type, e);
                AnyEventContent::Unrecognized {
                    event_type: $event_type.to_owned(),
                    content: $content,
                }
            }
        }
    };
}

impl AnyEventContent {
    /// Dispatch on the wire `type` string and parse the content.
    ///
    /// Unknown types, and known types whose content does not have the
    /// expected shape, become `Unrecognized`; this function never fails.
    pub fn parse(event_type: &str, content: JsonValue) -> Self {
        match event_type {
            "m.room.message" => parse_content!(RoomMessage, event_type, content),
            "m.room.name" => parse_content!(RoomName, event_type, content),
            "m.room.canonical_alias" => parse_content!(RoomCanonicalAlias, event_type, content),
            "m.room.aliases" => parse_content!(RoomAliases, event_type, content),
            "m.room.topic" => parse_content!(RoomTopic, event_type, content),
            "m.room.member" => parse_content!(RoomMember, event_type, content),
            "m.room.create" => parse_content!(RoomCreate, event_type, content),
            "m.room.redaction" => parse_content!(RoomRedaction, event_type, content),
            "m.receipt" => parse_content!(Receipt, event_type, content),
            "m.typing" => parse_content!(Typing, event_type, content),
            "m.direct" => parse_content!(Direct, event_type, content),
            "m.ignored_user_list" => parse_content!(IgnoredUserList, event_type, content),
            "m.tag" => parse_content!(Tag, event_type, content),
            "m.fully_read" => parse_content!(FullyRead, event_type, content),
            _ => AnyEventContent::Unrecognized {
                event_type: event_type.to_owned(),
                content,
            },
        }
    }

    /// The wire `type` string of this content.
    pub fn event_type(&self) -> &str {
        match self {
            AnyEventContent::RoomMessage(_) => "m.room.message",
            AnyEventContent::RoomName(_) => "m.room.name",
            AnyEventContent::RoomCanonicalAlias(_) => "m.room.canonical_alias",
            AnyEventContent::RoomAliases(_) => "m.room.aliases",
            AnyEventContent::RoomTopic(_) => "m.room.topic",
            AnyEventContent::RoomMember(_) => "m.room.member",
            AnyEventContent::RoomCreate(_) => "m.room.create",
            AnyEventContent::RoomRedaction(_) => "m.room.redaction",
            AnyEventContent::Receipt(_) => "m.receipt",
            AnyEventContent::Typing(_) => "m.typing",
            AnyEventContent::Direct(_) => "m.direct",
            AnyEventContent::IgnoredUserList(_) => "m.ignored_user_list",
            AnyEventContent::Tag(_) => "m.tag",
            AnyEventContent::FullyRead(_) => "m.fully_read",
            AnyEventContent::Redacted { original_type } => original_type,
            AnyEventContent::Unrecognized { event_type, .. } => event_type,
        }
    }

    /// Serialize the content back to its wire form.
    pub fn to_json(&self) -> JsonValue {
        match self {
            AnyEventContent::RoomMessage(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomName(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomCanonicalAlias(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomAliases(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomTopic(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomMember(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomCreate(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::RoomRedaction(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::Receipt(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::Typing(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::Direct(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::IgnoredUserList(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::Tag(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::FullyRead(c) => serde_json::to_value(c).unwrap_or_default(),
            AnyEventContent::Redacted { .. } => json!({}),
            AnyEventContent::Unrecognized { content, .. } => content.clone(),
        }
    }
}

/// A basic event: ephemeral events and account data.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// The parsed content.
    pub content: AnyEventContent,
}

impl Event {
    /// Decode an event from its wire JSON object.
    pub fn from_json(json: &JsonValue) -> Self {
        let event_type = json
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let content = json.get("content").cloned().unwrap_or_else(|| json!({}));

        Self {
            content: AnyEventContent::parse(event_type, content),
        }
    }

    /// The wire `type` string.
    pub fn event_type(&self) -> &str {
        self.content.event_type()
    }

    /// Serialize the event back to its wire form.
    pub fn to_json(&self) -> JsonValue {
        json!({
            "type": self.event_type(),
            "content": self.content.to_json(),
        })
    }
}

/// An event that happened in a room: adds the event id, sender and origin
/// timestamp, and for state events the state key.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomEvent {
    /// The globally unique event id.
    pub event_id: Option<EventId>,
    /// The user that sent the event.
    pub sender: Option<UserId>,
    /// The timestamp the origin server assigned, in milliseconds.
    pub origin_server_ts: Option<u64>,
    /// The room the event belongs to; absent inside sync sections, where
    /// the room id is the section key.
    pub room_id: Option<RoomId>,
    /// The state key; present exactly for state events.
    pub state_key: Option<String>,
    /// For `m.room.redaction` events, the id of the redacted event.
    pub redacts: Option<EventId>,
    /// The parsed content.
    pub content: AnyEventContent,
}

fn parse_id<T: std::str::FromStr>(json: &JsonValue, field: &str) -> Option<T> {
    let raw = json.get(field)?.as_str()?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!("discarding malformed {} on an event: {:?}", field, raw);
            None
        }
    }
}

impl RoomEvent {
    /// Decode a room event from its wire JSON object.
    pub fn from_json(json: &JsonValue) -> Self {
        let event_type = json
            .get("type")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let content = json.get("content").cloned().unwrap_or_else(|| json!({}));

        Self {
            event_id: parse_id(json, "event_id"),
            sender: parse_id(json, "sender"),
            origin_server_ts: json.get("origin_server_ts").and_then(JsonValue::as_u64),
            room_id: parse_id(json, "room_id"),
            state_key: json
                .get("state_key")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
            redacts: parse_id(json, "redacts"),
            content: AnyEventContent::parse(event_type, content),
        }
    }

    /// The wire `type` string.
    pub fn event_type(&self) -> &str {
        self.content.event_type()
    }

    /// Whether this is a state event, i.e. carries a state key.
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The `(type, state_key)` pair that identifies a piece of room state.
    pub fn state_identity(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.event_type().to_owned(), key.clone()))
    }

    /// Replace the content with the redaction tombstone, keeping the
    /// envelope (and therefore the timeline position) intact.
    pub fn redact(&mut self) {
        self.content = AnyEventContent::Redacted {
            original_type: self.event_type().to_owned(),
        };
    }

    /// Whether the content has been redacted away.
    pub fn is_redacted(&self) -> bool {
        matches!(self.content, AnyEventContent::Redacted { .. })
    }

    /// Serialize the event back to its wire form.
    pub fn to_json(&self) -> JsonValue {
        let mut json = json!({
            "type": self.event_type(),
            "content": self.content.to_json(),
        });

        let object = json.as_object_mut().unwrap();
        if let Some(event_id) = &self.event_id {
            object.insert("event_id".to_owned(), json!(event_id));
        }
        if let Some(sender) = &self.sender {
            object.insert("sender".to_owned(), json!(sender));
        }
        if let Some(ts) = self.origin_server_ts {
            object.insert("origin_server_ts".to_owned(), json!(ts));
        }
        if let Some(room_id) = &self.room_id {
            object.insert("room_id".to_owned(), json!(room_id));
        }
        if let Some(state_key) = &self.state_key {
            object.insert("state_key".to_owned(), json!(state_key));
        }
        if let Some(redacts) = &self.redacts {
            object.insert("redacts".to_owned(), json!(redacts));
        }

        json
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;

    use super::*;

    #[test]
    fn decode_message_event() {
        let event = RoomEvent::from_json(&json!({
            "type": "m.room.message",
            "event_id": "$152037280074GZeOm:localhost",
            "sender": "@example:localhost",
            "origin_server_ts": 152037280,
            "content": { "msgtype": "m.text", "body": "is dancing" }
        }));

        assert_eq!(event.event_type(), "m.room.message");
        assert!(!event.is_state());
        match &event.content {
            AnyEventContent::RoomMessage(content) => {
                assert_eq!(content.body, "is dancing");
                assert_eq!(content.msgtype, "m.text");
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn unknown_type_round_trips_verbatim() {
        let wire = json!({
            "type": "org.example.custom",
            "event_id": "$custom:localhost",
            "sender": "@example:localhost",
            "content": { "anything": ["goes", 3], "nested": { "deep": true } }
        });

        let event = RoomEvent::from_json(&wire);
        assert_eq!(event.event_type(), "org.example.custom");

        let back = event.to_json();
        assert_eq!(back["type"], wire["type"]);
        assert_eq!(back["content"], wire["content"]);
        assert_eq!(back["event_id"], wire["event_id"]);
    }

    #[test]
    fn malformed_known_content_is_unrecognized_not_an_error() {
        let event = Event::from_json(&json!({
            "type": "m.typing",
            "content": { "user_ids": "not-an-array" }
        }));

        match &event.content {
            AnyEventContent::Unrecognized { event_type, .. } => {
                assert_eq!(event_type, "m.typing")
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn state_identity_uses_type_and_state_key() {
        let event = RoomEvent::from_json(&json!({
            "type": "m.room.member",
            "event_id": "$1:localhost",
            "sender": "@example:localhost",
            "state_key": "@example:localhost",
            "content": { "membership": "join" }
        }));

        assert!(event.is_state());
        assert_eq!(
            event.state_identity(),
            Some(("m.room.member".to_owned(), "@example:localhost".to_owned()))
        );
    }

    #[test]
    fn redaction_event_carries_target() {
        let event = RoomEvent::from_json(&json!({
            "type": "m.room.redaction",
            "event_id": "$2:localhost",
            "sender": "@example:localhost",
            "redacts": "$1:localhost",
            "content": { "reason": "spam" }
        }));

        assert_eq!(
            event.redacts,
            Some(EventId::try_from("$1:localhost").unwrap())
        );
    }

    #[test]
    fn redact_keeps_envelope() {
        let mut event = RoomEvent::from_json(&json!({
            "type": "m.room.message",
            "event_id": "$1:localhost",
            "sender": "@example:localhost",
            "content": { "msgtype": "m.text", "body": "secret" }
        }));

        event.redact();

        assert!(event.is_redacted());
        assert_eq!(event.event_type(), "m.room.message");
        assert_eq!(event.event_id, Some(EventId::try_from("$1:localhost").unwrap()));
        assert_eq!(event.content.to_json(), json!({}));
    }
}
