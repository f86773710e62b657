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

//! The shape of a `/sync` response.
//!
//! Parsing is lenient about events (unknown types are preserved, malformed
//! ones degrade to unrecognized) but strict about the response structure: a
//! response without a `next_batch` token cannot be resumed from and is
//! rejected.

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    events::{Event, RoomEvent},
    identifiers::RoomId,
    job::JobError,
};

/// Counters the server keeps per room on behalf of the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnreadNotificationsCount {
    /// The number of unread notifications; authoritative when present.
    pub notification_count: Option<u64>,
    /// The number of unread highlights; authoritative when present.
    pub highlight_count: Option<u64>,
}

/// The timeline section of one room delta.
#[derive(Clone, Debug, Default)]
pub struct TimelineBatch {
    /// The events of the batch, oldest first.
    pub events: Vec<RoomEvent>,
    /// True when the server skipped events between the previous batch and
    /// this one.
    pub limited: bool,
    /// The token to paginate backwards from the start of the batch.
    pub prev_batch: Option<String>,
}

/// One server delta for one room.
#[derive(Clone, Debug, Default)]
pub struct RoomUpdate {
    /// State events (from `state`, or `invite_state` for invites).
    pub state: Vec<RoomEvent>,
    /// The timeline section.
    pub timeline: TimelineBatch,
    /// Ephemeral events: typing and receipts.
    pub ephemeral: Vec<Event>,
    /// Per-room account data, e.g. tags.
    pub account_data: Vec<Event>,
    /// The server-side unread counters.
    pub unread_notifications: UnreadNotificationsCount,
}

/// The per-join-state room sections of a sync response, in the order the
/// server delivered the rooms.
#[derive(Clone, Debug, Default)]
pub struct Rooms {
    /// Rooms the user has joined.
    pub join: Vec<(RoomId, RoomUpdate)>,
    /// Rooms the user has been invited to.
    pub invite: Vec<(RoomId, RoomUpdate)>,
    /// Rooms the user has left or been banned from.
    pub leave: Vec<(RoomId, RoomUpdate)>,
}

/// A parsed `/sync` response.
#[derive(Clone, Debug)]
pub struct SyncResponse {
    /// The token to resume from on the next sync.
    pub next_batch: String,
    /// The room sections.
    pub rooms: Rooms,
    /// Global account data events.
    pub account_data: Vec<Event>,
    /// Presence events.
    pub presence: Vec<Event>,
    /// To-device events, relevant only to an encryption layer.
    pub to_device: Vec<Event>,
}

fn event_list(json: &JsonValue, section: &str) -> Vec<Event> {
    json.get(section)
        .and_then(|s| s.get("events"))
        .and_then(JsonValue::as_array)
        .map(|events| events.iter().map(Event::from_json).collect())
        .unwrap_or_default()
}

fn room_event_list(json: &JsonValue, section: &str) -> Vec<RoomEvent> {
    json.get(section)
        .and_then(|s| s.get("events"))
        .and_then(JsonValue::as_array)
        .map(|events| events.iter().map(RoomEvent::from_json).collect())
        .unwrap_or_default()
}

impl RoomUpdate {
    pub(crate) fn parse(room: &JsonValue, invited: bool) -> Self {
        let state = if invited {
            room_event_list(room, "invite_state")
        } else {
            room_event_list(room, "state")
        };

        let timeline_json = room.get("timeline");
        let timeline = TimelineBatch {
            events: room_event_list(room, "timeline"),
            limited: timeline_json
                .and_then(|t| t.get("limited"))
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            prev_batch: timeline_json
                .and_then(|t| t.get("prev_batch"))
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
        };

        let unread = room.get("unread_notifications");
        let unread_notifications = UnreadNotificationsCount {
            notification_count: unread
                .and_then(|u| u.get("notification_count"))
                .and_then(JsonValue::as_u64),
            highlight_count: unread
                .and_then(|u| u.get("highlight_count"))
                .and_then(JsonValue::as_u64),
        };

        Self {
            state,
            timeline,
            ephemeral: event_list(room, "ephemeral"),
            account_data: event_list(room, "account_data"),
            unread_notifications,
        }
    }
}

fn room_section(json: &JsonValue, section: &str) -> Vec<(RoomId, RoomUpdate)> {
    let rooms = match json.get("rooms").and_then(|r| r.get(section)) {
        Some(JsonValue::Object(rooms)) => rooms,
        _ => return Vec::new(),
    };

    let mut parsed = Vec::with_capacity(rooms.len());
    for (raw_id, room) in rooms {
        let room_id = match raw_id.parse::<RoomId>() {
            Ok(id) => id,
            Err(e) => {
                warn!("skipping a sync room with a malformed id {:?}: {}", raw_id, e);
                continue;
            }
        };
        parsed.push((room_id, RoomUpdate::parse(room, section == "invite")));
    }
    parsed
}

impl SyncResponse {
    /// Parse a sync response body.
    ///
    /// Fails only on structural problems that would make the response
    /// unresumable; anything event-shaped degrades gracefully.
    pub fn parse(json: &JsonValue) -> Result<Self, JobError> {
        let next_batch = json
            .get("next_batch")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| JobError::incorrect_response("sync response has no next_batch"))?
            .to_owned();

        let rooms = Rooms {
            join: room_section(json, "join"),
            invite: room_section(json, "invite"),
            leave: room_section(json, "leave"),
        };

        let response = Self {
            next_batch,
            rooms,
            account_data: event_list(json, "account_data"),
            presence: event_list(json, "presence"),
            to_device: event_list(json, "to_device"),
        };

        debug!(
            "parsed sync batch: {} joined, {} invited, {} left room(s)",
            response.rooms.join.len(),
            response.rooms.invite.len(),
            response.rooms.leave.len()
        );

        Ok(response)
    }
}
