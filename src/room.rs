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

//! The per-room state machine.
//!
//! A `Room` consumes server deltas and turns them into state, timeline and
//! counter mutations, emitting a signal for every observable change. Rooms
//! are owned by the connection; they borrow user entries from the
//! connection's registry and hold a non-owning handle back to it for
//! posting messages and receipts.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    convert::TryFrom,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, Weak,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use tracing::warn;

use crate::{
    connection::ConnectionHandle,
    events::{
        AnyEventContent, Event, MemberEventContent, MembershipState, MessageEventContent,
        RoomEvent, TagInfo, TypingEventContent,
    },
    http_send::RequestPriority,
    identifiers::{EventId, RoomAliasId, RoomId, UserId},
    job::{
        requests::{Direction, GetMessages, PostReceipt, SendMessage},
        Job,
    },
    members::{member_ordering, RoomMember},
    signals::{Signal, SignalHub},
    sync::{RoomUpdate, TimelineBatch, UnreadNotificationsCount},
    timeline::Timeline,
};

/// The join state of a room, as seen by the local user.
///
/// "None" (a room the user has no relation to) is represented by the room
/// object not existing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinState {
    /// The user has been invited.
    Invite,
    /// The user is a member.
    Join,
    /// The user has left (or been banned).
    Leave,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            JoinState::Invite => "invite",
            JoinState::Join => "join",
            JoinState::Leave => "leave",
        };
        write!(f, "{}", state)
    }
}

/// Observable events of a room.
#[derive(Clone, Debug)]
pub enum RoomSignal {
    /// The join state changed.
    JoinStateChanged {
        /// The state before the transition.
        old_state: JoinState,
        /// The state after the transition.
        new_state: JoinState,
    },
    /// Name, canonical alias or alias list changed.
    NamesChanged,
    /// The topic changed.
    TopicChanged {
        /// The new topic.
        topic: String,
    },
    /// The computed display name changed.
    DisplaynameChanged {
        /// The newly computed display name.
        display_name: String,
    },
    /// A user joined the room.
    UserAdded {
        /// The user that joined.
        user_id: UserId,
    },
    /// A user left the room or was banned.
    UserRemoved {
        /// The user that left.
        user_id: UserId,
    },
    /// A member's display name changed.
    MemberRenamed {
        /// The member that was renamed.
        user_id: UserId,
        /// The display name before the change.
        old_name: Option<String>,
    },
    /// New messages are about to be appended to the timeline.
    AboutToAddNewMessages {
        /// The events that will be appended, oldest first.
        events: Vec<RoomEvent>,
    },
    /// Historical messages are about to be prepended to the timeline.
    AboutToAddHistoricalMessages {
        /// The events that will be prepended, newest first.
        events: Vec<RoomEvent>,
    },
    /// Messages were inserted into the timeline.
    AddedMessages {
        /// The lowest index of the inserted range.
        from_index: i64,
        /// The highest index of the inserted range.
        to_index: i64,
    },
    /// The set of currently typing users changed.
    TypingChanged,
    /// A user's read marker moved.
    LastReadEventChanged {
        /// The user whose marker moved.
        user_id: UserId,
    },
    /// The local user's read marker moved.
    ReadMarkerMoved {
        /// The event the marker now points at.
        event_id: EventId,
    },
    /// The unread counter changed.
    UnreadCountChanged {
        /// The new count.
        count: u64,
    },
    /// The highlight counter changed.
    HighlightCountChanged {
        /// The new count.
        count: u64,
    },
    /// The room's tags changed.
    TagsChanged,
}

/// Payload-free discriminants of [`RoomSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum RoomSignalKind {
    JoinStateChanged,
    NamesChanged,
    TopicChanged,
    DisplaynameChanged,
    UserAdded,
    UserRemoved,
    MemberRenamed,
    AboutToAddNewMessages,
    AboutToAddHistoricalMessages,
    AddedMessages,
    TypingChanged,
    LastReadEventChanged,
    ReadMarkerMoved,
    UnreadCountChanged,
    HighlightCountChanged,
    TagsChanged,
}

impl Signal for RoomSignal {
    type Kind = RoomSignalKind;

    fn kind(&self) -> RoomSignalKind {
        match self {
            RoomSignal::JoinStateChanged { .. } => RoomSignalKind::JoinStateChanged,
            RoomSignal::NamesChanged => RoomSignalKind::NamesChanged,
            RoomSignal::TopicChanged { .. } => RoomSignalKind::TopicChanged,
            RoomSignal::DisplaynameChanged { .. } => RoomSignalKind::DisplaynameChanged,
            RoomSignal::UserAdded { .. } => RoomSignalKind::UserAdded,
            RoomSignal::UserRemoved { .. } => RoomSignalKind::UserRemoved,
            RoomSignal::MemberRenamed { .. } => RoomSignalKind::MemberRenamed,
            RoomSignal::AboutToAddNewMessages { .. } => RoomSignalKind::AboutToAddNewMessages,
            RoomSignal::AboutToAddHistoricalMessages { .. } => {
                RoomSignalKind::AboutToAddHistoricalMessages
            }
            RoomSignal::AddedMessages { .. } => RoomSignalKind::AddedMessages,
            RoomSignal::TypingChanged => RoomSignalKind::TypingChanged,
            RoomSignal::LastReadEventChanged { .. } => RoomSignalKind::LastReadEventChanged,
            RoomSignal::ReadMarkerMoved { .. } => RoomSignalKind::ReadMarkerMoved,
            RoomSignal::UnreadCountChanged { .. } => RoomSignalKind::UnreadCountChanged,
            RoomSignal::HighlightCountChanged { .. } => RoomSignalKind::HighlightCountChanged,
            RoomSignal::TagsChanged => RoomSignalKind::TagsChanged,
        }
    }
}

#[derive(Default)]
struct RoomInner {
    join_state: Option<JoinState>,
    // Last-write-wins state, keyed by (type, state_key).
    state: BTreeMap<(String, String), RoomEvent>,
    name: Option<String>,
    canonical_alias: Option<RoomAliasId>,
    aliases: Vec<RoomAliasId>,
    topic: Option<String>,
    creator: Option<UserId>,
    members: HashMap<UserId, RoomMember>,
    members_left: HashMap<UserId, RoomMember>,
    timeline: Timeline,
    prev_batch: Option<String>,
    unread_count: u64,
    highlight_count: u64,
    read_markers: HashMap<UserId, EventId>,
    typing_users: BTreeSet<UserId>,
    tags: BTreeMap<String, TagInfo>,
    fully_read: Option<EventId>,
    account_data: HashMap<String, Event>,
    displayname: String,
}

/// A Matrix room.
pub struct Room {
    room_id: RoomId,
    own_user_id: UserId,
    connection: ConnectionHandle,
    weak_self: Weak<Room>,
    signals: SignalHub<RoomSignal>,
    inner: RwLock<RoomInner>,
    first_synced: AtomicBool,
    first_sync_notify: Notify,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .field("join_state", &self.join_state())
            .finish()
    }
}

impl Room {
    /// Create a new room.
    ///
    /// # Arguments
    ///
    /// * `connection` - A non-owning handle to the connection that owns
    ///   this room.
    /// * `room_id` - The unique id of the room.
    /// * `join_state` - The join state the room starts out in.
    /// * `own_user_id` - The MXID of our own user.
    pub fn new(
        connection: ConnectionHandle,
        room_id: RoomId,
        join_state: JoinState,
        own_user_id: UserId,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            room_id,
            own_user_id,
            connection,
            weak_self: weak_self.clone(),
            signals: SignalHub::new(),
            inner: RwLock::new(RoomInner {
                join_state: Some(join_state),
                ..Default::default()
            }),
            first_synced: AtomicBool::new(false),
            first_sync_notify: Notify::new(),
        })
    }

    /// The unique id of the room.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The MXID of our own user.
    pub fn own_user_id(&self) -> &UserId {
        &self.own_user_id
    }

    /// The hub for this room's observable events.
    pub fn signals(&self) -> &SignalHub<RoomSignal> {
        &self.signals
    }

    /// The current join state.
    pub fn join_state(&self) -> JoinState {
        self.inner
            .read()
            .unwrap()
            .join_state
            .expect("a room always has a join state")
    }

    pub(crate) fn set_join_state(&self, new_state: JoinState) {
        let old_state = {
            let mut inner = self.inner.write().unwrap();
            let old = inner.join_state;
            inner.join_state = Some(new_state);
            old
        };

        if let Some(old_state) = old_state {
            if old_state != new_state {
                self.signals.emit(&RoomSignal::JoinStateChanged {
                    old_state,
                    new_state,
                });
            }
        }
    }

    /// The `m.room.name` of the room, if any.
    pub fn name(&self) -> Option<String> {
        self.inner.read().unwrap().name.clone()
    }

    /// The canonical alias, if any.
    pub fn canonical_alias(&self) -> Option<RoomAliasId> {
        self.inner.read().unwrap().canonical_alias.clone()
    }

    /// The published aliases of the room.
    pub fn aliases(&self) -> Vec<RoomAliasId> {
        self.inner.read().unwrap().aliases.clone()
    }

    /// The topic, if any.
    pub fn topic(&self) -> Option<String> {
        self.inner.read().unwrap().topic.clone()
    }

    /// The user that created the room, if known.
    pub fn creator(&self) -> Option<UserId> {
        self.inner.read().unwrap().creator.clone()
    }

    /// The number of unread messages, local-user authored ones excluded.
    pub fn unread_count(&self) -> u64 {
        self.inner.read().unwrap().unread_count
    }

    /// The number of unread highlights.
    pub fn highlight_count(&self) -> u64 {
        self.inner.read().unwrap().highlight_count
    }

    /// The users currently typing in the room.
    pub fn typing_users(&self) -> BTreeSet<UserId> {
        self.inner.read().unwrap().typing_users.clone()
    }

    /// The tags set on the room.
    pub fn tags(&self) -> BTreeMap<String, TagInfo> {
        self.inner.read().unwrap().tags.clone()
    }

    /// The event a user has read up to, if known.
    pub fn read_marker(&self, user_id: &UserId) -> Option<EventId> {
        self.inner.read().unwrap().read_markers.get(user_id).cloned()
    }

    /// The event the local user's `m.fully_read` marker points at.
    pub fn fully_read_marker(&self) -> Option<EventId> {
        self.inner.read().unwrap().fully_read.clone()
    }

    /// The joined members of the room, in display order.
    pub fn members(&self) -> Vec<RoomMember> {
        let mut members: Vec<RoomMember> =
            self.inner.read().unwrap().members.values().cloned().collect();
        members.sort_by(|a, b| member_ordering(a, b));
        members
    }

    /// A member of the room, if present.
    pub fn member(&self, user_id: &UserId) -> Option<RoomMember> {
        self.inner.read().unwrap().members.get(user_id).cloned()
    }

    /// Members that have left the room but are retained for history.
    pub fn members_left(&self) -> Vec<RoomMember> {
        self.inner
            .read()
            .unwrap()
            .members_left
            .values()
            .cloned()
            .collect()
    }

    /// Run a closure against the timeline buffer.
    pub fn read_timeline<T>(&self, f: impl FnOnce(&Timeline) -> T) -> T {
        f(&self.inner.read().unwrap().timeline)
    }

    /// The pagination token for fetching events before the oldest cached
    /// ones.
    pub fn prev_batch(&self) -> Option<String> {
        self.inner.read().unwrap().prev_batch.clone()
    }

    /// The display name shown to a member of this room, disambiguated with
    /// the MXID when the plain display name is shared with another member.
    ///
    /// Unknown users are shown as their MXID.
    pub fn room_membername(&self, user_id: &UserId) -> String {
        let inner = self.inner.read().unwrap();

        let member = match inner.members.get(user_id) {
            Some(member) => member,
            None => return user_id.as_str().to_owned(),
        };

        let name = member.name();
        let shared = inner
            .members
            .values()
            .any(|other| other.user_id() != user_id && other.name() == name);

        if shared {
            member.unique_name()
        } else {
            name
        }
    }

    /// The human-readable name of the room: the explicit name if set, an
    /// alias otherwise, and failing both a name synthesized from the
    /// members.
    pub fn display_name(&self) -> String {
        self.calculate_display_name(&self.inner.read().unwrap())
    }

    fn calculate_display_name(&self, inner: &RoomInner) -> String {
        if let Some(name) = &inner.name {
            return name.trim().to_owned();
        }
        if let Some(alias) = &inner.canonical_alias {
            return alias.as_str().trim().to_owned();
        }
        if let Some(alias) = inner.aliases.first() {
            return alias.as_str().trim().to_owned();
        }

        let mut others: Vec<&RoomMember> = inner
            .members
            .values()
            .filter(|m| m.user_id() != &self.own_user_id)
            .collect();
        others.sort_by(|a, b| member_ordering(a, b));

        if others.is_empty() {
            return "Empty room".to_owned();
        }

        let names: Vec<String> = others.iter().take(3).map(|m| m.name()).collect();
        let rest = others.len().saturating_sub(3);
        if rest > 0 {
            format!("{} and {} others", names.join(", "), rest)
        } else {
            names.join(", ")
        }
    }

    fn refresh_display_name(&self) {
        let changed = {
            let mut inner = self.inner.write().unwrap();
            let name = self.calculate_display_name(&inner);
            if inner.displayname != name {
                inner.displayname = name.clone();
                Some(name)
            } else {
                None
            }
        };

        if let Some(display_name) = changed {
            self.signals
                .emit(&RoomSignal::DisplaynameChanged { display_name });
        }
    }

    /// Apply one server delta to the room.
    pub(crate) fn update(&self, update: RoomUpdate) {
        let state_signals = {
            let mut inner = self.inner.write().unwrap();
            let mut signals = Vec::new();
            for event in &update.state {
                self.apply_state_event(&mut inner, event, &mut signals);
            }
            signals
        };
        for signal in &state_signals {
            self.signals.emit(signal);
        }
        self.refresh_display_name();

        self.apply_timeline(update.timeline, false);

        for event in &update.ephemeral {
            match &event.content {
                AnyEventContent::Typing(typing) => self.apply_typing(typing),
                AnyEventContent::Receipt(receipt) => self.apply_receipts(receipt),
                _ => {}
            }
        }

        for event in update.account_data {
            self.apply_account_data(event);
        }

        self.apply_unread_notifications(&update.unread_notifications);

        if !self.first_synced.swap(true, Ordering::SeqCst) {
            self.first_sync_notify.notify_waiters();
        }
    }

    /// Wait until the first sync delta for this room has been applied.
    pub(crate) async fn await_first_sync(&self) {
        loop {
            if self.first_synced.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.first_sync_notify.notified();
            if self.first_synced.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn is_synced(&self) -> bool {
        self.first_synced.load(Ordering::SeqCst)
    }

    fn apply_state_event(
        &self,
        inner: &mut RoomInner,
        event: &RoomEvent,
        signals: &mut Vec<RoomSignal>,
    ) {
        let identity = match event.state_identity() {
            Some(identity) => identity,
            None => return,
        };
        inner.state.insert(identity, event.clone());

        match &event.content {
            AnyEventContent::RoomName(content) => {
                inner.name = content.name.clone();
                signals.push(RoomSignal::NamesChanged);
            }
            AnyEventContent::RoomCanonicalAlias(content) => {
                inner.canonical_alias = content.alias.clone();
                signals.push(RoomSignal::NamesChanged);
            }
            AnyEventContent::RoomAliases(content) => {
                inner.aliases = content.aliases.clone();
                signals.push(RoomSignal::NamesChanged);
            }
            AnyEventContent::RoomTopic(content) => {
                inner.topic = Some(content.topic.clone());
                signals.push(RoomSignal::TopicChanged {
                    topic: content.topic.clone(),
                });
            }
            AnyEventContent::RoomCreate(content) => {
                inner.creator = content.creator.clone();
            }
            AnyEventContent::RoomMember(content) => {
                self.apply_member_event(inner, event, content, signals);
            }
            _ => {}
        }
    }

    fn apply_member_event(
        &self,
        inner: &mut RoomInner,
        event: &RoomEvent,
        content: &MemberEventContent,
        signals: &mut Vec<RoomSignal>,
    ) {
        let state_key = event.state_key.as_deref().unwrap_or_default();
        let user_id = match UserId::try_from(state_key) {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("m.room.member event with a bad state key {:?}: {}", state_key, e);
                return;
            }
        };

        match content.membership {
            MembershipState::Join => {
                if let Some(member) = inner.members.get_mut(&user_id) {
                    if member.display_name != content.displayname {
                        let old_name = member.display_name.clone();
                        member.display_name = content.displayname.clone();
                        member.user.set_display_name(content.displayname.clone());
                        signals.push(RoomSignal::MemberRenamed {
                            user_id: user_id.clone(),
                            old_name,
                        });
                    }
                    member.avatar_url = content.avatar_url.clone();
                    member.membership = MembershipState::Join;
                } else {
                    let user = self.connection.get_or_create_user(&user_id);
                    user.set_display_name(content.displayname.clone());
                    inner
                        .members
                        .insert(user_id.clone(), RoomMember::new(user, content));
                    inner.members_left.remove(&user_id);
                    signals.push(RoomSignal::UserAdded { user_id });
                }
            }
            MembershipState::Leave | MembershipState::Ban => {
                if let Some(mut member) = inner.members.remove(&user_id) {
                    member.membership = content.membership;
                    inner.members_left.insert(user_id.clone(), member);
                    signals.push(RoomSignal::UserRemoved { user_id });
                }
            }
            // Invited and knocking users are tracked in the state map only.
            MembershipState::Invite | MembershipState::Knock => {}
        }
    }

    fn apply_timeline(&self, batch: TimelineBatch, historical: bool) {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.prev_batch.is_none() || batch.limited {
                if let Some(prev_batch) = batch.prev_batch.clone() {
                    inner.prev_batch = Some(prev_batch);
                }
            }
        }

        if batch.events.is_empty() {
            return;
        }

        // Events whose id is already present will be deduplicated by the
        // timeline; only genuinely fresh ones are announced.
        let fresh: Vec<RoomEvent> = {
            let inner = self.inner.read().unwrap();
            batch
                .events
                .iter()
                .filter(|e| {
                    e.event_id
                        .as_ref()
                        .map_or(true, |id| inner.timeline.index_of_id(id).is_none())
                })
                .cloned()
                .collect()
        };

        if !fresh.is_empty() {
            let signal = if historical {
                RoomSignal::AboutToAddHistoricalMessages {
                    events: fresh.clone(),
                }
            } else {
                RoomSignal::AboutToAddNewMessages {
                    events: fresh.clone(),
                }
            };
            self.signals.emit(&signal);
        }

        let (added_range, mut signals) = {
            let mut inner = self.inner.write().unwrap();
            let mut signals = Vec::new();

            let added = if historical {
                inner.timeline.prepend_historical(batch.events)
            } else {
                inner.timeline.append_new(batch.events)
            };

            let mut unread_added = 0u64;
            for event in &added {
                // A state event in the timeline is state all the same.
                if event.is_state() && !historical {
                    self.apply_state_event(&mut inner, event, &mut signals);
                }

                // Redactions tombstone their target wherever it sits.
                if let Some(target) = &event.redacts {
                    if let Some(index) = inner.timeline.index_of_id(target) {
                        if let Some(target_event) = inner.timeline.find_by_index_mut(index) {
                            target_event.redact();
                        }
                    }
                }

                if !historical && event.sender.as_ref() != Some(&self.own_user_id) {
                    unread_added += 1;
                }
            }

            if unread_added > 0 {
                inner.unread_count += unread_added;
                signals.push(RoomSignal::UnreadCountChanged {
                    count: inner.unread_count,
                });
            }

            let range = match (added.first(), added.last()) {
                (Some(first), Some(last)) => {
                    let first_index = first
                        .event_id
                        .as_ref()
                        .and_then(|id| inner.timeline.index_of_id(id));
                    let last_index = last
                        .event_id
                        .as_ref()
                        .and_then(|id| inner.timeline.index_of_id(id));
                    match (first_index, last_index) {
                        (Some(a), Some(b)) => Some((a.min(b), a.max(b))),
                        _ => None,
                    }
                }
                _ => None,
            };

            (range, signals)
        };

        if let Some((from_index, to_index)) = added_range {
            self.signals.emit(&RoomSignal::AddedMessages {
                from_index,
                to_index,
            });
        }
        for signal in signals.drain(..) {
            self.signals.emit(&signal);
        }
        if !historical {
            self.refresh_display_name();
        }
    }

    fn apply_typing(&self, typing: &TypingEventContent) {
        let changed = {
            let mut inner = self.inner.write().unwrap();
            let new_set: BTreeSet<UserId> = typing.user_ids.iter().cloned().collect();
            if new_set != inner.typing_users {
                inner.typing_users = new_set;
                true
            } else {
                false
            }
        };

        if changed {
            self.signals.emit(&RoomSignal::TypingChanged);
        }
    }

    fn apply_receipts(&self, receipt: &crate::events::ReceiptEventContent) {
        let mut signals = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            for (event_id, user_id, _receipt) in receipt.read_receipts() {
                let new_index = inner.timeline.index_of_id(event_id);
                let current_index = inner
                    .read_markers
                    .get(user_id)
                    .and_then(|id| inner.timeline.index_of_id(id));

                // Markers only ever move forward, and the local user's
                // marker must point into the timeline.
                let is_own = user_id == &self.own_user_id;
                let advances = match (current_index, new_index) {
                    (Some(current), Some(new)) => new > current,
                    (Some(_), None) => false,
                    (None, None) => !is_own,
                    (None, Some(_)) => true,
                };
                if !advances {
                    continue;
                }

                if is_own {
                    if let Some(new) = new_index {
                        let read = self.count_unread_between(&inner, current_index, new);
                        inner.unread_count = inner.unread_count.saturating_sub(read);
                        if read > 0 {
                            signals.push(RoomSignal::UnreadCountChanged {
                                count: inner.unread_count,
                            });
                        }
                    }
                    signals.push(RoomSignal::ReadMarkerMoved {
                        event_id: event_id.clone(),
                    });
                }

                inner
                    .read_markers
                    .insert(user_id.clone(), event_id.clone());
                signals.push(RoomSignal::LastReadEventChanged {
                    user_id: user_id.clone(),
                });
            }
        }

        for signal in signals {
            self.signals.emit(&signal);
        }
    }

    // How many events in the (after, upto] index range were not authored
    // by the local user.
    fn count_unread_between(&self, inner: &RoomInner, after: Option<i64>, upto: i64) -> u64 {
        inner
            .timeline
            .iter()
            .filter(|(index, event)| {
                after.map_or(true, |a| *index > a)
                    && *index <= upto
                    && event.sender.as_ref() != Some(&self.own_user_id)
            })
            .count() as u64
    }

    fn apply_account_data(&self, event: Event) {
        match &event.content {
            AnyEventContent::Tag(content) => {
                let changed = {
                    let mut inner = self.inner.write().unwrap();
                    if inner.tags != content.tags {
                        inner.tags = content.tags.clone();
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.signals.emit(&RoomSignal::TagsChanged);
                }
            }
            AnyEventContent::FullyRead(content) => {
                self.inner.write().unwrap().fully_read = Some(content.event_id.clone());
            }
            _ => {
                let event_type = event.event_type().to_owned();
                self.inner
                    .write()
                    .unwrap()
                    .account_data
                    .insert(event_type, event);
            }
        }
    }

    fn apply_unread_notifications(&self, unread: &UnreadNotificationsCount) {
        let mut signals = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            if let Some(count) = unread.notification_count {
                if count != inner.unread_count {
                    inner.unread_count = count;
                    signals.push(RoomSignal::UnreadCountChanged { count });
                }
            }
            if let Some(count) = unread.highlight_count {
                if count != inner.highlight_count {
                    inner.highlight_count = count;
                    signals.push(RoomSignal::HighlightCountChanged { count });
                }
            }
        }
        for signal in signals {
            self.signals.emit(&signal);
        }
    }

    /// Mark everything up to (and including) the given event as read.
    ///
    /// Self-authored events never move the marker on their own: if the
    /// given event was sent by the local user, the marker is advanced to
    /// the nearest older event from someone else, and not at all if there
    /// is none. A receipt is posted to the server on a best-effort basis;
    /// a failure there does not roll the local marker back.
    pub fn mark_messages_as_read(&self, upto_event_id: &EventId) {
        let (target_id, signals) = {
            let mut inner = self.inner.write().unwrap();

            let upto_index = match inner.timeline.index_of_id(upto_event_id) {
                Some(index) => index,
                None => return,
            };

            // Walk back over self-authored events.
            let target = inner
                .timeline
                .iter_reverse()
                .skip_while(|(index, _)| *index > upto_index)
                .find(|(_, event)| event.sender.as_ref() != Some(&self.own_user_id))
                .and_then(|(index, event)| event.event_id.clone().map(|id| (index, id)));

            let (target_index, target_id) = match target {
                Some(found) => found,
                None => return,
            };

            let current_index = inner
                .read_markers
                .get(&self.own_user_id)
                .and_then(|id| inner.timeline.index_of_id(id));
            if let Some(current) = current_index {
                if target_index <= current {
                    return;
                }
            }

            let read = self.count_unread_between(&inner, current_index, target_index);
            inner.unread_count = inner.unread_count.saturating_sub(read);
            inner
                .read_markers
                .insert(self.own_user_id.clone(), target_id.clone());

            let mut signals = vec![RoomSignal::ReadMarkerMoved {
                event_id: target_id.clone(),
            }];
            if read > 0 {
                signals.push(RoomSignal::UnreadCountChanged {
                    count: inner.unread_count,
                });
            }
            (target_id, signals)
        };

        for signal in signals {
            self.signals.emit(&signal);
        }

        self.post_receipt(&target_id);
    }

    /// Post an `m.read` receipt for the given event. Best-effort; the
    /// returned job can be observed but local state does not depend on it.
    pub fn post_receipt(&self, event_id: &EventId) -> Option<Job<PostReceipt>> {
        let connection = self.connection.upgrade()?;
        Some(connection.call_api(
            PostReceipt {
                room_id: self.room_id.clone(),
                event_id: event_id.clone(),
            },
            RequestPriority::Background,
        ))
    }

    /// Post an event of the given type to the room.
    pub fn post_message(&self, event_type: &str, content: JsonValue) -> Option<Job<SendMessage>> {
        let connection = self.connection.upgrade()?;
        Some(connection.call_api(
            SendMessage {
                room_id: self.room_id.clone(),
                event_type: event_type.to_owned(),
                txn_id: connection.generate_txn_id(),
                content,
            },
            RequestPriority::Foreground,
        ))
    }

    /// Post a plain-text `m.room.message` to the room.
    pub fn post_text_message(&self, body: impl Into<String>) -> Option<Job<SendMessage>> {
        let content = serde_json::to_value(MessageEventContent::text(body)).ok()?;
        self.post_message("m.room.message", content)
    }

    /// Fetch up to `limit` events older than the oldest cached timeline
    /// event and prepend them to the timeline.
    pub fn get_previous_content(&self, limit: u32) -> Option<Job<GetMessages>> {
        let connection = self.connection.upgrade()?;
        let from = self.prev_batch()?;

        let job = connection.call_api(
            GetMessages {
                room_id: self.room_id.clone(),
                from,
                to: None,
                dir: Direction::Backwards,
                limit: Some(limit),
            },
            RequestPriority::Background,
        );

        let room = self.weak_self.clone();
        let pagination = job.clone();
        tokio::spawn(async move {
            let response = match pagination.await_response().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("fetching previous messages failed: {}", e);
                    return;
                }
            };
            if let Some(room) = room.upgrade() {
                room.apply_timeline(
                    TimelineBatch {
                        events: response.chunk,
                        limited: false,
                        prev_batch: None,
                    },
                    true,
                );
                if let Some(end) = response.end {
                    room.inner.write().unwrap().prev_batch = Some(end);
                }
            }
        });

        Some(job)
    }

    /// Note that a user was renamed, updating the member entry from the
    /// registry and re-running disambiguation.
    pub fn user_renamed(&self, user_id: &UserId, old_name: Option<String>) {
        let renamed = {
            let mut inner = self.inner.write().unwrap();
            match inner.members.get_mut(user_id) {
                Some(member) => {
                    member.display_name = member.user.display_name();
                    true
                }
                None => false,
            }
        };

        if renamed {
            self.signals.emit(&RoomSignal::MemberRenamed {
                user_id: user_id.clone(),
                old_name,
            });
            self.refresh_display_name();
        }
    }

    /// The current state events, for the state cache. Timelines are not
    /// part of the cached state.
    pub(crate) fn state_events(&self) -> Vec<RoomEvent> {
        self.inner.read().unwrap().state.values().cloned().collect()
    }

    /// The room account data events, for the state cache.
    pub(crate) fn account_data_events(&self) -> Vec<Event> {
        let inner = self.inner.read().unwrap();
        let mut events: Vec<Event> = inner.account_data.values().cloned().collect();
        if !inner.tags.is_empty() {
            events.push(Event {
                content: AnyEventContent::Tag(crate::events::TagEventContent {
                    tags: inner.tags.clone(),
                }),
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::sync::SyncResponse;

    fn get_room() -> Arc<Room> {
        Room::new(
            ConnectionHandle::detached(),
            RoomId::try_from("!SVkFJHzfwvuaIEawgC:localhost").unwrap(),
            JoinState::Join,
            UserId::try_from("@self:localhost").unwrap(),
        )
    }

    fn message(event_id: &str, sender: &str, body: &str) -> JsonValue {
        json!({
            "type": "m.room.message",
            "event_id": event_id,
            "sender": sender,
            "origin_server_ts": 1520372800,
            "content": { "msgtype": "m.text", "body": body }
        })
    }

    fn member(user_id: &str, displayname: Option<&str>, membership: &str) -> JsonValue {
        json!({
            "type": "m.room.member",
            "event_id": format!("$m{}:localhost", user_id.len()),
            "sender": user_id,
            "state_key": user_id,
            "origin_server_ts": 1520372801,
            "content": {
                "membership": membership,
                "displayname": displayname
            }
        })
    }

    fn timeline_update(events: Vec<JsonValue>) -> RoomUpdate {
        RoomUpdate::parse(
            &json!({ "timeline": { "events": events, "limited": false } }),
            false,
        )
    }

    fn state_update(events: Vec<JsonValue>) -> RoomUpdate {
        RoomUpdate::parse(&json!({ "state": { "events": events } }), false)
    }

    fn receipt_update(event_id: &str, user_id: &str) -> RoomUpdate {
        RoomUpdate::parse(
            &json!({
                "ephemeral": {
                    "events": [{
                        "type": "m.receipt",
                        "content": {
                            event_id: { "m.read": { user_id: { "ts": 1 } } }
                        }
                    }]
                }
            }),
            false,
        )
    }

    fn recorder(room: &Room) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        room.signals().subscribe_all(move |signal| {
            let name = match signal {
                RoomSignal::JoinStateChanged { .. } => "join_state_changed",
                RoomSignal::NamesChanged => "names_changed",
                RoomSignal::TopicChanged { .. } => "topic_changed",
                RoomSignal::DisplaynameChanged { .. } => "displayname_changed",
                RoomSignal::UserAdded { .. } => "user_added",
                RoomSignal::UserRemoved { .. } => "user_removed",
                RoomSignal::MemberRenamed { .. } => "member_renamed",
                RoomSignal::AboutToAddNewMessages { .. } => "about_to_add_new_messages",
                RoomSignal::AboutToAddHistoricalMessages { .. } => {
                    "about_to_add_historical_messages"
                }
                RoomSignal::AddedMessages { .. } => "added_messages",
                RoomSignal::TypingChanged => "typing_changed",
                RoomSignal::LastReadEventChanged { .. } => "last_read_event_changed",
                RoomSignal::ReadMarkerMoved { .. } => "read_marker_moved",
                RoomSignal::UnreadCountChanged { .. } => "unread_count_changed",
                RoomSignal::HighlightCountChanged { .. } => "highlight_count_changed",
                RoomSignal::TagsChanged => "tags_changed",
            };
            seen2.lock().unwrap().push(name.to_owned());
        });
        seen
    }

    #[tokio::test]
    async fn first_message_batch_counts_unread() {
        let room = get_room();
        room.update(timeline_update(vec![message("$e1", "@u:s", "hi")]));

        assert_eq!(room.unread_count(), 1);
        room.read_timeline(|timeline| {
            assert_eq!(timeline.len(), 1);
            assert_eq!(timeline.min_index(), timeline.max_index());
        });
    }

    #[tokio::test]
    async fn self_authored_messages_are_not_unread() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@other:localhost", "one"),
            message("$e2", "@self:localhost", "two"),
            message("$e3", "@other:localhost", "three"),
        ]));

        assert_eq!(room.unread_count(), 2);
    }

    #[tokio::test]
    async fn server_notification_count_is_authoritative() {
        let room = get_room();
        let mut update = timeline_update(vec![message("$e1", "@u:s", "hi")]);
        update.unread_notifications = UnreadNotificationsCount {
            notification_count: Some(11),
            highlight_count: Some(2),
        };
        room.update(update);

        assert_eq!(room.unread_count(), 11);
        assert_eq!(room.highlight_count(), 2);
    }

    #[tokio::test]
    async fn about_to_add_fires_before_added() {
        let room = get_room();
        let seen = recorder(&room);

        room.update(timeline_update(vec![message("$e1", "@u:s", "hi")]));

        let seen = seen.lock().unwrap();
        let about = seen
            .iter()
            .position(|s| s == "about_to_add_new_messages")
            .unwrap();
        let added = seen.iter().position(|s| s == "added_messages").unwrap();
        assert!(about < added);
    }

    #[tokio::test]
    async fn duplicate_events_are_dropped_across_batches() {
        let room = get_room();
        room.update(timeline_update(vec![message("$e1", "@u:s", "hi")]));
        room.update(timeline_update(vec![
            message("$e1", "@u:s", "hi"),
            message("$e2", "@u:s", "again"),
        ]));

        room.read_timeline(|timeline| {
            assert_eq!(timeline.len(), 2);
            assert_eq!(
                timeline.index_of_id(&EventId::try_from("$e1").unwrap()),
                Some(0)
            );
        });
        assert_eq!(room.unread_count(), 2);
    }

    #[tokio::test]
    async fn applying_a_batch_twice_is_idempotent() {
        let room = get_room();
        let batch = || {
            let mut update = timeline_update(vec![
                message("$e1", "@u:s", "hi"),
                member("@other:localhost", Some("Other"), "join"),
            ]);
            update.state = state_update(vec![json!({
                "type": "m.room.name",
                "event_id": "$n1",
                "sender": "@u:s",
                "state_key": "",
                "content": { "name": "fixed" }
            })])
            .state;
            update
        };

        room.update(batch());
        let unread = room.unread_count();
        let members = room.members().len();
        let name = room.display_name();
        let timeline_len = room.read_timeline(|t| t.len());

        room.update(batch());
        assert_eq!(room.unread_count(), unread);
        assert_eq!(room.members().len(), members);
        assert_eq!(room.display_name(), name);
        assert_eq!(room.read_timeline(|t| t.len()), timeline_len);
    }

    #[tokio::test]
    async fn state_is_last_write_wins() {
        let room = get_room();
        room.update(state_update(vec![
            json!({
                "type": "m.room.topic",
                "event_id": "$t1",
                "sender": "@u:s",
                "state_key": "",
                "content": { "topic": "first" }
            }),
            json!({
                "type": "m.room.topic",
                "event_id": "$t2",
                "sender": "@u:s",
                "state_key": "",
                "content": { "topic": "second" }
            }),
        ]));

        assert_eq!(room.topic().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn redaction_tombstones_in_place() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@u:s", "doomed"),
            message("$e2", "@u:s", "fine"),
        ]));
        room.update(timeline_update(vec![json!({
            "type": "m.room.redaction",
            "event_id": "$r1",
            "sender": "@u:s",
            "redacts": "$e1",
            "content": { "reason": "spam" }
        })]));

        room.read_timeline(|timeline| {
            let id = EventId::try_from("$e1").unwrap();
            assert_eq!(timeline.index_of_id(&id), Some(0));
            let event = timeline.find_by_id(&id).unwrap();
            assert!(event.is_redacted());
            assert_eq!(event.event_type(), "m.room.message");
        });
    }

    #[tokio::test]
    async fn membership_reflects_the_last_event_of_a_batch() {
        let room = get_room();
        room.update(state_update(vec![
            member("@other:localhost", Some("Other"), "join"),
            member("@other:localhost", Some("Other"), "leave"),
        ]));

        assert!(room.member(&UserId::try_from("@other:localhost").unwrap()).is_none());
        assert_eq!(room.members_left().len(), 1);
    }

    #[tokio::test]
    async fn renames_emit_member_renamed() {
        let room = get_room();
        room.update(state_update(vec![member(
            "@other:localhost",
            Some("Before"),
            "join",
        )]));

        let seen = recorder(&room);
        room.update(state_update(vec![member(
            "@other:localhost",
            Some("After"),
            "join",
        )]));

        assert!(seen.lock().unwrap().contains(&"member_renamed".to_owned()));
        let other = UserId::try_from("@other:localhost").unwrap();
        assert_eq!(room.member(&other).unwrap().display_name.as_deref(), Some("After"));
    }

    #[tokio::test]
    async fn display_name_prefers_name_over_alias_over_members() {
        let room = get_room();
        room.update(state_update(vec![member(
            "@other:localhost",
            Some("Other"),
            "join",
        )]));
        assert_eq!(room.display_name(), "Other");

        room.update(state_update(vec![json!({
            "type": "m.room.canonical_alias",
            "event_id": "$a1",
            "sender": "@u:s",
            "state_key": "",
            "content": { "alias": "#tutorial:localhost" }
        })]));
        assert_eq!(room.display_name(), "#tutorial:localhost");

        room.update(state_update(vec![json!({
            "type": "m.room.name",
            "event_id": "$n1",
            "sender": "@u:s",
            "state_key": "",
            "content": { "name": "room name" }
        })]));
        assert_eq!(room.display_name(), "room name");
    }

    #[tokio::test]
    async fn display_name_counts_the_others() {
        let room = get_room();
        room.update(state_update(vec![
            member("@a:s", Some("Alice"), "join"),
            member("@b:s", Some("Bob"), "join"),
            member("@c:s", Some("Carol"), "join"),
            member("@d:s", Some("Dave"), "join"),
            member("@e:s", Some("Erin"), "join"),
        ]));

        assert_eq!(room.display_name(), "Alice, Bob, Carol and 2 others");
    }

    #[tokio::test]
    async fn shared_display_names_are_disambiguated() {
        let room = get_room();
        room.update(state_update(vec![
            member("@sam1:s", Some("Sam"), "join"),
            member("@sam2:s", Some("Sam"), "join"),
            member("@solo:s", Some("Solo"), "join"),
        ]));

        let sam1 = UserId::try_from("@sam1:s").unwrap();
        let sam2 = UserId::try_from("@sam2:s").unwrap();
        let solo = UserId::try_from("@solo:s").unwrap();

        assert_eq!(room.room_membername(&sam1), "Sam (@sam1:s)");
        assert_eq!(room.room_membername(&sam2), "Sam (@sam2:s)");
        assert_eq!(room.room_membername(&solo), "Solo");
        assert_ne!(room.room_membername(&sam1), room.room_membername(&sam2));
    }

    #[tokio::test]
    async fn typing_is_replaced_wholesale() {
        let room = get_room();
        let update = |users: Vec<&str>| {
            RoomUpdate::parse(
                &json!({
                    "ephemeral": {
                        "events": [
                            { "type": "m.typing", "content": { "user_ids": users } }
                        ]
                    }
                }),
                false,
            )
        };

        room.update(update(vec!["@a:s", "@b:s"]));
        assert_eq!(room.typing_users().len(), 2);

        room.update(update(vec!["@c:s"]));
        let typing = room.typing_users();
        assert_eq!(typing.len(), 1);
        assert!(typing.contains(&UserId::try_from("@c:s").unwrap()));
    }

    #[tokio::test]
    async fn read_markers_are_monotonic() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@u:s", "one"),
            message("$e2", "@u:s", "two"),
        ]));

        let reader = UserId::try_from("@reader:s").unwrap();
        room.update(receipt_update("$e2", "@reader:s"));
        assert_eq!(room.read_marker(&reader), Some(EventId::try_from("$e2").unwrap()));

        // A stale receipt must not move the marker backwards.
        room.update(receipt_update("$e1", "@reader:s"));
        assert_eq!(room.read_marker(&reader), Some(EventId::try_from("$e2").unwrap()));
    }

    #[tokio::test]
    async fn own_receipt_decrements_unread() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@u:s", "one"),
            message("$e2", "@u:s", "two"),
            message("$e3", "@u:s", "three"),
        ]));
        assert_eq!(room.unread_count(), 3);

        room.update(receipt_update("$e2", "@self:localhost"));
        assert_eq!(room.unread_count(), 1);
    }

    #[tokio::test]
    async fn mark_as_read_skips_self_authored_tail() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@other:s", "one"),
            message("$e2", "@self:localhost", "two"),
            message("$e3", "@self:localhost", "three"),
        ]));
        room.update(receipt_update("$e1", "@self:localhost"));

        let seen = recorder(&room);
        room.mark_messages_as_read(&EventId::try_from("$e3").unwrap());

        // The nearest non-self event is $e1, which the marker already
        // points at, so nothing moves.
        assert_eq!(
            room.read_marker(&UserId::try_from("@self:localhost").unwrap()),
            Some(EventId::try_from("$e1").unwrap())
        );
        assert!(!seen.lock().unwrap().contains(&"read_marker_moved".to_owned()));
    }

    #[tokio::test]
    async fn mark_as_read_moves_to_the_target() {
        let room = get_room();
        room.update(timeline_update(vec![
            message("$e1", "@other:s", "one"),
            message("$e2", "@other:s", "two"),
            message("$e3", "@other:s", "three"),
        ]));

        let seen = recorder(&room);
        room.mark_messages_as_read(&EventId::try_from("$e2").unwrap());

        assert_eq!(
            room.read_marker(&UserId::try_from("@self:localhost").unwrap()),
            Some(EventId::try_from("$e2").unwrap())
        );
        assert_eq!(room.unread_count(), 1);
        assert!(seen.lock().unwrap().contains(&"read_marker_moved".to_owned()));
    }

    #[tokio::test]
    async fn unknown_read_target_is_ignored() {
        let room = get_room();
        room.update(timeline_update(vec![message("$e1", "@other:s", "one")]));

        room.mark_messages_as_read(&EventId::try_from("$missing").unwrap());
        assert_eq!(
            room.read_marker(&UserId::try_from("@self:localhost").unwrap()),
            None
        );
    }

    #[tokio::test]
    async fn tags_come_from_room_account_data() {
        let room = get_room();
        let (_, update) = SyncResponse::parse(&crate::test_json::SYNC)
            .unwrap()
            .rooms
            .join
            .remove(0);
        room.update(update);

        assert!(room.tags().contains_key("u.work"));
    }
}

