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

//! Account-data event contents: per-user overlays that live outside any
//! room timeline.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::identifiers::{EventId, RoomId, UserId};

/// The content of an `m.direct` event: the user to direct-chat-rooms map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectEventContent(
    /// The rooms marked as direct chats, per user.
    pub BTreeMap<UserId, Vec<RoomId>>,
);

/// The content of an `m.ignored_user_list` event.
///
/// The wire format maps each ignored user to an (currently always empty)
/// object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IgnoredUserListEventContent {
    /// The map of ignored users.
    pub ignored_users: BTreeMap<UserId, JsonValue>,
}

impl IgnoredUserListEventContent {
    /// The ignored users as a plain set.
    pub fn users(&self) -> BTreeSet<UserId> {
        self.ignored_users.keys().cloned().collect()
    }
}

/// Ordering data attached to one room tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagInfo {
    /// A number in [0, 1] ordering the room within the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<f64>,
}

/// The content of a per-room `m.tag` event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagEventContent {
    /// The tags on the room, e.g. `m.favourite`.
    pub tags: BTreeMap<String, TagInfo>,
}

/// The content of a per-room `m.fully_read` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FullyReadEventContent {
    /// The event the user's fully-read marker points at.
    pub event_id: EventId,
}
