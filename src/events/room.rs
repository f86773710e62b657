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

//! Content types for the room events the runtime interprets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::{RoomAliasId, UserId};

/// The content of an `m.room.message` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageEventContent {
    /// The kind of message, e.g. `m.text` or `m.image`.
    pub msgtype: String,
    /// The textual representation of the message.
    pub body: String,
    /// Any further, msgtype-specific keys (`url`, `info`, `formatted_body`, ...).
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl MessageEventContent {
    /// A plain-text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_owned(),
            body: body.into(),
            extra: BTreeMap::new(),
        }
    }

    /// An emote ("/me") message.
    pub fn emote(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.emote".to_owned(),
            body: body.into(),
            extra: BTreeMap::new(),
        }
    }
}

/// The content of an `m.room.name` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NameEventContent {
    /// The name of the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// The content of an `m.room.canonical_alias` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalAliasEventContent {
    /// The canonical alias of the room, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<RoomAliasId>,
}

/// The content of an `m.room.aliases` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AliasesEventContent {
    /// The aliases published for the room by one server.
    pub aliases: Vec<RoomAliasId>,
}

/// The content of an `m.room.topic` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicEventContent {
    /// The topic text.
    pub topic: String,
}

/// The membership state of a room member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    /// The user has been banned from the room.
    Ban,
    /// The user has been invited to the room.
    Invite,
    /// The user is a member of the room.
    Join,
    /// The user has knocked on the room.
    Knock,
    /// The user has left the room or was never in it.
    Leave,
}

/// The content of an `m.room.member` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberEventContent {
    /// The membership this event transitions the member to.
    pub membership: MembershipState,
    /// The display name the member uses in this room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    /// The `mxc://` avatar URL of the member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Set on invites into a direct chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
}

/// The content of an `m.room.create` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateEventContent {
    /// The user that created the room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<UserId>,
    /// Whether users from other homeservers may join.
    #[serde(
        rename = "m.federate",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub federate: Option<bool>,
}

/// The content of an `m.room.redaction` event.
///
/// The id of the redacted event lives on the event envelope (the wire
/// format keeps `redacts` outside `content`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RedactionEventContent {
    /// The reason given for the redaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
