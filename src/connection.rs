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

//! The connection to one homeserver.
//!
//! A `Connection` owns the rooms and users of one account, runs the sync
//! loop, keeps the account-data overlays (direct chats, ignored users) and
//! persists a state snapshot to disk. Rooms hold a non-owning
//! [`ConnectionHandle`] back to it.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};
use url::Url;

use crate::{
    config::{ClientConfig, SyncSettings},
    error::{Error, Result},
    events::{AnyEventContent, Event, RoomEvent},
    http_send::{DefaultTransport, HttpSend, RequestPriority},
    identifiers::{RoomId, UserId},
    job::{
        requests::{
            self, CreateRoom, ForgetRoom, GetContent, GetThumbnail, GetVersions, GetWellKnown,
            JoinRoom, LeaveRoom, Logout, PasswordLogin, SendToDevice, SetAccountData,
            Sync as SyncRequest, UploadContent, UploadKeys,
        },
        Job, JobError, JobShared, JobSignal, JobSignalKind, Request, SendContext,
        RETRY_INITIAL_DELAY, RETRY_MAX_DELAY,
    },
    members::User,
    room::{JoinState, Room},
    session::Session,
    signals::{Signal, SignalHub},
    state_store::{self, CachedRoom, CachedState, CACHE_VERSION},
    sync::{RoomUpdate, SyncResponse},
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// The lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No login has happened (or the user has logged out).
    Disconnected,
    /// A login is in flight.
    Connecting,
    /// Logged in, with the sync loop entitled to run.
    Connected,
    /// The sync loop is recovering from a network failure.
    Reconnecting,
    /// Logging in failed.
    Failed,
}

/// Observable events of a connection.
#[derive(Clone, Debug)]
pub enum ConnectionSignal {
    /// A login completed and the session is usable.
    Connected,
    /// The session was closed by `logout()`.
    LoggedOut,
    /// Login data (user id, device id, access token) changed.
    StateChanged,
    /// A login attempt failed.
    LoginError {
        /// A human-readable message.
        message: String,
        /// Raw error details, if any.
        details: String,
    },
    /// Resolving the homeserver from an MXID failed.
    ResolveError {
        /// A human-readable message.
        message: String,
    },
    /// The homeserver base URL changed.
    HomeserverChanged {
        /// The new base URL.
        base_url: Url,
    },
    /// A sync batch has been fully applied.
    SyncDone,
    /// A sync attempt failed terminally.
    SyncError {
        /// A human-readable message.
        message: String,
        /// Raw error details, if any.
        details: String,
    },
    /// A job started through this connection failed terminally.
    RequestFailed {
        /// The terminal failure.
        error: JobError,
    },
    /// A job hit a network problem and is retrying on its own.
    NetworkError {
        /// How many retries have already been taken.
        retries_taken: u32,
        /// When the job will retry again.
        next_retry_in_ms: u64,
    },
    /// A new room object has been created.
    NewRoom {
        /// The new room.
        room: Arc<Room>,
    },
    /// A room invitation is seen for the first time.
    InvitedRoom {
        /// The invite-state room object.
        room: Arc<Room>,
        /// The left room with the same id, if one exists.
        prev: Option<Arc<Room>>,
    },
    /// A joined room is seen for the first time.
    JoinedRoom {
        /// The joined room object.
        room: Arc<Room>,
        /// The invite object this room supersedes, if any.
        prev: Option<Arc<Room>>,
    },
    /// A room has just been left.
    LeftRoom {
        /// The left room object.
        room: Arc<Room>,
        /// The invite object this room supersedes, if any.
        prev: Option<Arc<Room>>,
    },
    /// The room object is about to be dropped from the connection.
    AboutToDeleteRoom {
        /// The room being deleted.
        room: Arc<Room>,
    },
    /// A room was created by `create_room` or `request_direct_chat`.
    CreatedRoom {
        /// The created room.
        room: Arc<Room>,
    },
    /// The first delta for the room has been applied; its state (name,
    /// members, aliases) is usable from here on.
    LoadedRoomState {
        /// The room that finished loading.
        room: Arc<Room>,
    },
    /// A user entry was created.
    NewUser {
        /// The new user.
        user: Arc<User>,
    },
    /// Account data other than direct chats and ignored users changed.
    AccountDataChanged {
        /// The changed event type.
        event_type: String,
    },
    /// A direct chat requested via `request_direct_chat` is ready.
    DirectChatAvailable {
        /// The direct chat room.
        room: Arc<Room>,
    },
    /// The direct chats map changed.
    DirectChatsListChanged {
        /// Added `(user, room)` pairs.
        additions: Vec<(UserId, RoomId)>,
        /// Removed `(user, room)` pairs.
        removals: Vec<(UserId, RoomId)>,
    },
    /// The ignored users list changed.
    IgnoredUsersListChanged {
        /// Users that became ignored.
        additions: BTreeSet<UserId>,
        /// Users that are no longer ignored.
        removals: BTreeSet<UserId>,
    },
}

/// Payload-free discriminants of [`ConnectionSignal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ConnectionSignalKind {
    Connected,
    LoggedOut,
    StateChanged,
    LoginError,
    ResolveError,
    HomeserverChanged,
    SyncDone,
    SyncError,
    RequestFailed,
    NetworkError,
    NewRoom,
    InvitedRoom,
    JoinedRoom,
    LeftRoom,
    AboutToDeleteRoom,
    CreatedRoom,
    LoadedRoomState,
    NewUser,
    AccountDataChanged,
    DirectChatAvailable,
    DirectChatsListChanged,
    IgnoredUsersListChanged,
}

impl Signal for ConnectionSignal {
    type Kind = ConnectionSignalKind;

    fn kind(&self) -> ConnectionSignalKind {
        use ConnectionSignal::*;
        match self {
            Connected => ConnectionSignalKind::Connected,
            LoggedOut => ConnectionSignalKind::LoggedOut,
            StateChanged => ConnectionSignalKind::StateChanged,
            LoginError { .. } => ConnectionSignalKind::LoginError,
            ResolveError { .. } => ConnectionSignalKind::ResolveError,
            HomeserverChanged { .. } => ConnectionSignalKind::HomeserverChanged,
            SyncDone => ConnectionSignalKind::SyncDone,
            SyncError { .. } => ConnectionSignalKind::SyncError,
            RequestFailed { .. } => ConnectionSignalKind::RequestFailed,
            NetworkError { .. } => ConnectionSignalKind::NetworkError,
            NewRoom { .. } => ConnectionSignalKind::NewRoom,
            InvitedRoom { .. } => ConnectionSignalKind::InvitedRoom,
            JoinedRoom { .. } => ConnectionSignalKind::JoinedRoom,
            LeftRoom { .. } => ConnectionSignalKind::LeftRoom,
            AboutToDeleteRoom { .. } => ConnectionSignalKind::AboutToDeleteRoom,
            CreatedRoom { .. } => ConnectionSignalKind::CreatedRoom,
            LoadedRoomState { .. } => ConnectionSignalKind::LoadedRoomState,
            NewUser { .. } => ConnectionSignalKind::NewUser,
            AccountDataChanged { .. } => ConnectionSignalKind::AccountDataChanged,
            DirectChatAvailable { .. } => ConnectionSignalKind::DirectChatAvailable,
            DirectChatsListChanged { .. } => ConnectionSignalKind::DirectChatsListChanged,
            IgnoredUsersListChanged { .. } => ConnectionSignalKind::IgnoredUsersListChanged,
        }
    }
}

/// A factory producing room objects, injectable via
/// [`Connection::set_room_factory`].
pub type RoomFactory =
    Box<dyn Fn(ConnectionHandle, &RoomId, JoinState, &UserId) -> Arc<Room> + Send + Sync>;

/// A factory producing user objects, injectable via
/// [`Connection::set_user_factory`].
pub type UserFactory = Box<dyn Fn(&UserId) -> Arc<User> + Send + Sync>;

fn default_room_factory() -> RoomFactory {
    Box::new(|connection, room_id, join_state, own_user_id| {
        Room::new(connection, room_id.clone(), join_state, own_user_id.clone())
    })
}

fn default_user_factory() -> UserFactory {
    Box::new(|user_id| Arc::new(User::new(user_id.clone())))
}

/// A non-owning handle to a connection, held by rooms.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Weak<ConnectionInner>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle").finish()
    }
}

impl ConnectionHandle {
    pub(crate) fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<ConnectionInner>> {
        self.inner.upgrade()
    }

    pub(crate) fn get_or_create_user(&self, user_id: &UserId) -> Arc<User> {
        match self.upgrade() {
            Some(inner) => inner.get_or_create_user(user_id),
            // Rooms can outlive (or in tests, predate) their connection.
            None => Arc::new(User::new(user_id.clone())),
        }
    }
}

#[derive(Default)]
struct DirectChats {
    by_user: BTreeMap<UserId, BTreeSet<RoomId>>,
    by_room: BTreeMap<RoomId, BTreeSet<UserId>>,
}

impl DirectChats {
    fn insert(&mut self, user_id: &UserId, room_id: &RoomId) -> bool {
        let added = self
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(room_id.clone());
        self.by_room
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.clone());
        added
    }

    fn remove(&mut self, user_id: &UserId, room_id: &RoomId) -> bool {
        let removed = self
            .by_user
            .get_mut(user_id)
            .map_or(false, |rooms| rooms.remove(room_id));
        if let Some(rooms) = self.by_user.get(user_id) {
            if rooms.is_empty() {
                self.by_user.remove(user_id);
            }
        }
        if let Some(users) = self.by_room.get_mut(room_id) {
            users.remove(user_id);
            if users.is_empty() {
                self.by_room.remove(room_id);
            }
        }
        removed
    }
}

pub(crate) struct ConnectionInner {
    weak_self: Weak<ConnectionInner>,
    transport: Arc<dyn HttpSend>,
    homeserver: RwLock<Option<Url>>,
    session: RwLock<Option<Session>>,
    state: RwLock<ConnectionState>,
    sync_token: RwLock<Option<String>>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    // Invite rooms are a separate partition: an Invite object and a
    // Join/Leave object with the same id coexist while both are alive.
    invitations: RwLock<HashMap<RoomId, Arc<Room>>>,
    users: RwLock<HashMap<UserId, Arc<User>>>,
    account_data: RwLock<HashMap<String, Event>>,
    direct_chats: RwLock<DirectChats>,
    ignored_users: RwLock<BTreeSet<UserId>>,
    signals: SignalHub<ConnectionSignal>,
    txn_nonce: u64,
    txn_counter: AtomicU64,
    sync_stop: AtomicBool,
    sync_running: AtomicBool,
    sync_job: Mutex<Option<Arc<JobShared>>>,
    cache_dir: Option<PathBuf>,
    room_factory: RwLock<RoomFactory>,
    user_factory: RwLock<UserFactory>,
}

impl ConnectionInner {
    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            inner: self.weak_self.clone(),
        }
    }

    fn send_context(&self) -> Option<SendContext> {
        let homeserver = self.homeserver.read().unwrap().clone()?;
        let access_token = self
            .session
            .read()
            .unwrap()
            .as_ref()
            .map(|s| s.access_token.clone());
        Some(SendContext {
            homeserver,
            access_token,
            transport: self.transport.clone(),
        })
    }

    fn set_state(&self, new_state: ConnectionState) {
        *self.state.write().unwrap() = new_state;
    }

    /// Start a job with the given policy, relaying its terminal failure
    /// and retry notifications to the connection's signals.
    pub(crate) fn call_api<R: Request>(&self, request: R, priority: RequestPriority) -> Job<R> {
        let job = Job::new(request);

        let weak = self.weak_self.clone();
        job.signals()
            .subscribe(JobSignalKind::Failure, move |signal| {
                if let JobSignal::Failure(error) = signal {
                    if let Some(inner) = weak.upgrade() {
                        inner.signals.emit(&ConnectionSignal::RequestFailed {
                            error: error.clone(),
                        });
                    }
                }
            });
        let weak = self.weak_self.clone();
        job.signals()
            .subscribe(JobSignalKind::NetworkError, move |signal| {
                if let JobSignal::NetworkError {
                    retries_taken,
                    next_retry_in_ms,
                } = signal
                {
                    if let Some(inner) = weak.upgrade() {
                        inner.signals.emit(&ConnectionSignal::NetworkError {
                            retries_taken: *retries_taken,
                            next_retry_in_ms: *next_retry_in_ms,
                        });
                    }
                }
            });

        match self.send_context() {
            Some(ctx) => job.start(ctx, priority),
            None => job.fail_now(JobError::new(
                crate::job::ErrorKind::IncorrectRequest,
                "no homeserver is set",
            )),
        }
        job
    }

    /// Generate a new transaction id, unique within this connection.
    pub(crate) fn generate_txn_id(&self) -> String {
        format!(
            "{:x}{:x}",
            self.txn_nonce,
            self.txn_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    pub(crate) fn get_or_create_user(&self, user_id: &UserId) -> Arc<User> {
        if let Some(user) = self.users.read().unwrap().get(user_id) {
            return user.clone();
        }

        let user = (self.user_factory.read().unwrap())(user_id);
        let stored = {
            let mut users = self.users.write().unwrap();
            match users.get(user_id) {
                Some(existing) => existing.clone(),
                None => {
                    users.insert(user_id.clone(), user.clone());
                    user.clone()
                }
            }
        };

        if Arc::ptr_eq(&stored, &user) {
            self.signals
                .emit(&ConnectionSignal::NewUser { user: user.clone() });
        }
        stored
    }

    fn make_room(&self, room_id: &RoomId, join_state: JoinState, own_user_id: &UserId) -> Arc<Room> {
        (self.room_factory.read().unwrap())(self.handle(), room_id, join_state, own_user_id)
    }

    /// Find or create the room object for `room_id` in the given target
    /// join state, firing the room-lifecycle signals of the transition.
    fn provide_room(
        &self,
        room_id: &RoomId,
        target: JoinState,
        own_user_id: &UserId,
    ) -> Arc<Room> {
        if target == JoinState::Invite {
            if let Some(room) = self.invitations.read().unwrap().get(room_id) {
                return room.clone();
            }

            let prev_leave = self
                .rooms
                .read()
                .unwrap()
                .get(room_id)
                .filter(|r| r.join_state() == JoinState::Leave)
                .cloned();

            let room = self.make_room(room_id, JoinState::Invite, own_user_id);
            self.invitations
                .write()
                .unwrap()
                .insert(room_id.clone(), room.clone());

            self.signals
                .emit(&ConnectionSignal::NewRoom { room: room.clone() });
            self.signals.emit(&ConnectionSignal::InvitedRoom {
                room: room.clone(),
                prev: prev_leave,
            });
            return room;
        }

        let existing = self.rooms.read().unwrap().get(room_id).cloned();
        let invite = self.invitations.write().unwrap().remove(room_id);

        let room = match existing {
            Some(room) => {
                let old_state = room.join_state();
                if old_state != target {
                    room.set_join_state(target);
                }

                match target {
                    JoinState::Join if old_state != JoinState::Join || invite.is_some() => {
                        self.signals.emit(&ConnectionSignal::JoinedRoom {
                            room: room.clone(),
                            prev: invite.clone(),
                        });
                    }
                    JoinState::Leave if old_state != JoinState::Leave || invite.is_some() => {
                        self.signals.emit(&ConnectionSignal::LeftRoom {
                            room: room.clone(),
                            prev: invite.clone(),
                        });
                    }
                    _ => {}
                }
                room
            }
            None => {
                let room = self.make_room(room_id, target, own_user_id);
                self.rooms
                    .write()
                    .unwrap()
                    .insert(room_id.clone(), room.clone());

                self.signals
                    .emit(&ConnectionSignal::NewRoom { room: room.clone() });
                match target {
                    JoinState::Join => self.signals.emit(&ConnectionSignal::JoinedRoom {
                        room: room.clone(),
                        prev: invite.clone(),
                    }),
                    JoinState::Leave => self.signals.emit(&ConnectionSignal::LeftRoom {
                        room: room.clone(),
                        prev: invite.clone(),
                    }),
                    JoinState::Invite => unreachable!("handled above"),
                }
                room
            }
        };

        if let Some(invite) = invite {
            self.signals
                .emit(&ConnectionSignal::AboutToDeleteRoom { room: invite });
        }

        room
    }

    fn apply_room_section(
        &self,
        section: Vec<(RoomId, RoomUpdate)>,
        target: JoinState,
        own_user_id: &UserId,
    ) {
        for (room_id, update) in section {
            let room = self.provide_room(&room_id, target, own_user_id);
            let first = !room.is_synced();
            room.update(update);
            if first {
                self.signals
                    .emit(&ConnectionSignal::LoadedRoomState { room });
            }
        }
    }

    /// Apply one fully parsed sync response; see the dispatch order in the
    /// module docs of [`crate::sync`].
    pub(crate) fn on_sync_success(&self, response: SyncResponse) {
        let own_user_id = match self.session.read().unwrap().as_ref() {
            Some(session) => session.user_id.clone(),
            None => {
                warn!("dropping a sync response received without a session");
                return;
            }
        };

        for event in &response.account_data {
            match &event.content {
                AnyEventContent::Direct(content) => self.merge_direct_chats(content),
                AnyEventContent::IgnoredUserList(content) => {
                    self.merge_ignored_users(content.users())
                }
                _ => {
                    let event_type = event.event_type().to_owned();
                    self.account_data
                        .write()
                        .unwrap()
                        .insert(event_type.clone(), event.clone());
                    self.signals
                        .emit(&ConnectionSignal::AccountDataChanged { event_type });
                }
            }
        }

        let rooms = response.rooms;
        self.apply_room_section(rooms.invite, JoinState::Invite, &own_user_id);
        self.apply_room_section(rooms.join, JoinState::Join, &own_user_id);
        self.apply_room_section(rooms.leave, JoinState::Leave, &own_user_id);

        // The token moves only once every per-room update has been applied,
        // so a crash before this point replays the batch.
        *self.sync_token.write().unwrap() = Some(response.next_batch);
    }

    fn merge_direct_chats(&self, content: &crate::events::DirectEventContent) {
        let mut additions = Vec::new();
        let mut removals = Vec::new();
        {
            let mut chats = self.direct_chats.write().unwrap();

            let mut incoming: BTreeMap<UserId, BTreeSet<RoomId>> = BTreeMap::new();
            for (user_id, rooms) in &content.0 {
                incoming
                    .entry(user_id.clone())
                    .or_default()
                    .extend(rooms.iter().cloned());
            }

            for (user_id, rooms) in &incoming {
                for room_id in rooms {
                    if chats.insert(user_id, room_id) {
                        additions.push((user_id.clone(), room_id.clone()));
                    }
                }
            }

            let current: Vec<(UserId, RoomId)> = chats
                .by_user
                .iter()
                .flat_map(|(u, rs)| rs.iter().map(move |r| (u.clone(), r.clone())))
                .collect();
            for (user_id, room_id) in current {
                let keep = incoming
                    .get(&user_id)
                    .map_or(false, |rooms| rooms.contains(&room_id));
                if !keep && chats.remove(&user_id, &room_id) {
                    removals.push((user_id, room_id));
                }
            }
        }

        // A local mutation that already fired its signal produces an empty
        // diff here and stays silent.
        if !additions.is_empty() || !removals.is_empty() {
            self.signals.emit(&ConnectionSignal::DirectChatsListChanged {
                additions,
                removals,
            });
        }
    }

    fn merge_ignored_users(&self, incoming: BTreeSet<UserId>) {
        let (additions, removals) = {
            let mut ignored = self.ignored_users.write().unwrap();
            let additions: BTreeSet<UserId> = incoming.difference(&ignored).cloned().collect();
            let removals: BTreeSet<UserId> = ignored.difference(&incoming).cloned().collect();
            *ignored = incoming;
            (additions, removals)
        };

        if !additions.is_empty() || !removals.is_empty() {
            self.signals.emit(&ConnectionSignal::IgnoredUsersListChanged {
                additions,
                removals,
            });
        }
    }

    fn direct_chats_content(&self) -> JsonValue {
        let chats = self.direct_chats.read().unwrap();
        let map: BTreeMap<&UserId, Vec<&RoomId>> = chats
            .by_user
            .iter()
            .map(|(user, rooms)| (user, rooms.iter().collect()))
            .collect();
        json!(map)
    }

    fn upload_account_data(&self, event_type: &str, content: JsonValue) {
        let user_id = match self.session.read().unwrap().as_ref() {
            Some(session) => session.user_id.clone(),
            None => return,
        };
        // Best-effort; the server copy catches up on the next merge.
        self.call_api(
            SetAccountData {
                user_id,
                event_type: event_type.to_owned(),
                content,
            },
            RequestPriority::Background,
        );
    }

    pub(crate) fn add_to_direct_chats(&self, room_id: &RoomId, user_id: &UserId) {
        let added = self
            .direct_chats
            .write()
            .unwrap()
            .insert(user_id, room_id);
        if !added {
            return;
        }

        self.signals.emit(&ConnectionSignal::DirectChatsListChanged {
            additions: vec![(user_id.clone(), room_id.clone())],
            removals: Vec::new(),
        });
        self.upload_account_data("m.direct", self.direct_chats_content());
    }

    pub(crate) fn remove_from_direct_chats(&self, room_id: &RoomId, user_id: Option<&UserId>) {
        let removals = {
            let mut chats = self.direct_chats.write().unwrap();
            let users: Vec<UserId> = match user_id {
                Some(user_id) => vec![user_id.clone()],
                None => chats
                    .by_room
                    .get(room_id)
                    .map(|users| users.iter().cloned().collect())
                    .unwrap_or_default(),
            };

            users
                .into_iter()
                .filter(|user| chats.remove(user, room_id))
                .map(|user| (user, room_id.clone()))
                .collect::<Vec<_>>()
        };

        if removals.is_empty() {
            return;
        }

        self.signals.emit(&ConnectionSignal::DirectChatsListChanged {
            additions: Vec::new(),
            removals,
        });
        self.upload_account_data("m.direct", self.direct_chats_content());
    }

    fn ignored_users_content(&self) -> JsonValue {
        let ignored = self.ignored_users.read().unwrap();
        let map: BTreeMap<&UserId, JsonValue> =
            ignored.iter().map(|user| (user, json!({}))).collect();
        json!({ "ignored_users": map })
    }

    fn delete_room_locally(&self, room_id: &RoomId) {
        let invite = self.invitations.write().unwrap().remove(room_id);
        if let Some(room) = invite {
            self.signals
                .emit(&ConnectionSignal::AboutToDeleteRoom { room });
        }
        let room = self.rooms.write().unwrap().remove(room_id);
        if let Some(room) = room {
            self.signals
                .emit(&ConnectionSignal::AboutToDeleteRoom { room });
        }
        self.remove_from_direct_chats(room_id, None);
    }
}

/// A connection to a Matrix homeserver, the root object of this crate.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("homeserver", &self.homeserver())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection with the default reqwest transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(DefaultTransport::with_config(&config)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a connection with a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpSend>) -> Self {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let inner = Arc::new_cyclic(|weak_self| ConnectionInner {
            weak_self: weak_self.clone(),
            transport,
            homeserver: RwLock::new(None),
            session: RwLock::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
            sync_token: RwLock::new(None),
            rooms: RwLock::new(HashMap::new()),
            invitations: RwLock::new(HashMap::new()),
            users: RwLock::new(HashMap::new()),
            account_data: RwLock::new(HashMap::new()),
            direct_chats: RwLock::new(DirectChats::default()),
            ignored_users: RwLock::new(BTreeSet::new()),
            signals: SignalHub::new(),
            txn_nonce: nonce,
            txn_counter: AtomicU64::new(0),
            sync_stop: AtomicBool::new(false),
            sync_running: AtomicBool::new(false),
            sync_job: Mutex::new(None),
            cache_dir: config.cache_dir.clone(),
            room_factory: RwLock::new(default_room_factory()),
            user_factory: RwLock::new(default_user_factory()),
        });

        Self { inner }
    }

    /// The hub for this connection's observable events.
    pub fn signals(&self) -> &SignalHub<ConnectionSignal> {
        &self.inner.signals
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().unwrap()
    }

    /// The homeserver base URL, if set or resolved.
    pub fn homeserver(&self) -> Option<Url> {
        self.inner.homeserver.read().unwrap().clone()
    }

    /// Set the homeserver base URL.
    pub fn set_homeserver(&self, base_url: Url) {
        *self.inner.homeserver.write().unwrap() = Some(base_url.clone());
        self.inner
            .signals
            .emit(&ConnectionSignal::HomeserverChanged { base_url });
    }

    /// The active session, if logged in.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().unwrap().clone()
    }

    /// The MXID of the logged-in user.
    pub fn user_id(&self) -> Option<UserId> {
        self.session().map(|s| s.user_id)
    }

    /// The device id of the logged-in session.
    pub fn device_id(&self) -> Option<String> {
        self.session().map(|s| s.device_id)
    }

    /// The access token of the logged-in session.
    pub fn access_token(&self) -> Option<String> {
        self.session().map(|s| s.access_token)
    }

    /// The sync token the next sync will resume from.
    pub fn sync_token(&self) -> Option<String> {
        self.inner.sync_token.read().unwrap().clone()
    }

    /// The user entry for the logged-in user.
    pub fn user(&self) -> Option<Arc<User>> {
        self.user_id()
            .map(|user_id| self.inner.get_or_create_user(&user_id))
    }

    /// Look up (or create) a user entry by MXID.
    pub fn user_by_id(&self, user_id: &UserId) -> Arc<User> {
        self.inner.get_or_create_user(user_id)
    }

    /// All users known to this connection.
    pub fn users(&self) -> Vec<Arc<User>> {
        self.inner.users.read().unwrap().values().cloned().collect()
    }

    /// A room in Join or Leave state.
    pub fn room(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.inner.rooms.read().unwrap().get(room_id).cloned()
    }

    /// A room in Invite state.
    pub fn invitation(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.inner.invitations.read().unwrap().get(room_id).cloned()
    }

    /// All rooms in Join or Leave state.
    pub fn rooms(&self) -> Vec<Arc<Room>> {
        self.inner.rooms.read().unwrap().values().cloned().collect()
    }

    /// All rooms in Invite state.
    pub fn invitations(&self) -> Vec<Arc<Room>> {
        self.inner
            .invitations
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Replace the factory used to allocate room objects.
    pub fn set_room_factory(&self, factory: RoomFactory) {
        *self.inner.room_factory.write().unwrap() = factory;
    }

    /// Replace the factory used to allocate user objects.
    pub fn set_user_factory(&self, factory: UserFactory) {
        *self.inner.user_factory.write().unwrap() = factory;
    }

    /// Start a job of the given request type with the given policy.
    ///
    /// All higher-level calls go through this; it is public so applications
    /// can reach endpoints the convenience methods do not cover.
    pub fn call_api<R: Request>(&self, request: R, priority: RequestPriority) -> Job<R> {
        self.inner.call_api(request, priority)
    }

    /// Generate a new transaction id, unique within this connection.
    pub fn generate_txn_id(&self) -> String {
        self.inner.generate_txn_id()
    }

    async fn resolve_server(&self, user: &str) -> Result<()> {
        let domain = match user.find(':') {
            Some(index) => &user[index + 1..],
            None => {
                let message = "the user id carries no server name".to_owned();
                self.inner
                    .signals
                    .emit(&ConnectionSignal::ResolveError {
                        message: message.clone(),
                    });
                return Err(Error::HomeserverUnresolved(message));
            }
        };

        let well_known_base = Url::parse(&format!("https://{}", domain))?;
        let ctx = SendContext {
            homeserver: well_known_base.clone(),
            access_token: None,
            transport: self.inner.transport.clone(),
        };

        let job = Job::new(GetWellKnown);
        job.start(ctx, RequestPriority::Foreground);
        let resolved = match job.await_response().await {
            Ok(response) => response.homeserver_base_url,
            Err(e) => {
                self.inner.signals.emit(&ConnectionSignal::ResolveError {
                    message: e.message.clone(),
                });
                return Err(Error::HomeserverUnresolved(e.message));
            }
        };

        let base_url = match Url::parse(&resolved) {
            Ok(url) => url,
            Err(e) => {
                let message = format!("well-known advertises an invalid base url: {}", e);
                self.inner
                    .signals
                    .emit(&ConnectionSignal::ResolveError {
                        message: message.clone(),
                    });
                return Err(Error::HomeserverUnresolved(message));
            }
        };

        // Per the well-known rules the advertised server must speak the
        // client-server API before it may be accepted.
        let ctx = SendContext {
            homeserver: base_url.clone(),
            access_token: None,
            transport: self.inner.transport.clone(),
        };
        let job = Job::new(GetVersions);
        job.start(ctx, RequestPriority::Foreground);
        if let Err(e) = job.await_response().await {
            self.inner.signals.emit(&ConnectionSignal::ResolveError {
                message: e.message.clone(),
            });
            return Err(Error::HomeserverUnresolved(e.message));
        }

        info!("resolved homeserver for {} to {}", user, base_url);
        self.set_homeserver(base_url);
        Ok(())
    }

    fn apply_login(&self, session: Session) {
        *self.inner.session.write().unwrap() = Some(session);
        self.inner.set_state(ConnectionState::Connected);
        self.inner.signals.emit(&ConnectionSignal::StateChanged);
        self.inner.signals.emit(&ConnectionSignal::Connected);
        self.start_sync();
    }

    /// Log in with a password, resolving the homeserver from the MXID if
    /// no base URL is set, and kick off the initial sync.
    pub async fn connect_to_server(
        &self,
        user: &str,
        password: &str,
        device_name: &str,
        device_id: Option<String>,
    ) -> Result<()> {
        self.inner.set_state(ConnectionState::Connecting);

        if self.homeserver().is_none() {
            self.resolve_server(user).await.map_err(|e| {
                self.inner.set_state(ConnectionState::Failed);
                e
            })?;
        }

        let job = self.call_api(
            PasswordLogin {
                user: user.to_owned(),
                password: password.to_owned(),
                device_name: device_name.to_owned(),
                device_id,
            },
            RequestPriority::Foreground,
        );

        match job.await_response().await {
            Ok(response) => {
                info!("logged in as {}", response.user_id);
                self.apply_login(Session {
                    access_token: response.access_token,
                    user_id: response.user_id,
                    device_id: response.device_id,
                });
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Failed);
                self.inner.signals.emit(&ConnectionSignal::LoginError {
                    message: e.message.clone(),
                    details: e.details.clone(),
                });
                Err(e.into())
            }
        }
    }

    /// Resume a session with a known access token, skipping the password
    /// login.
    pub fn connect_with_token(&self, user_id: UserId, access_token: String, device_id: String) {
        self.apply_login(Session {
            access_token,
            user_id,
            device_id,
        });
    }

    /// Abandon the sync loop, invalidate the token server-side and emit
    /// `logged_out`. The connection stays usable; a later `connect_*` call
    /// is permitted.
    pub async fn logout(&self) {
        self.stop_sync();

        let job = self.call_api(Logout, RequestPriority::Foreground);
        if let Err(e) = job.await_response().await {
            // An already-invalid token must not trap the session locally.
            warn!("logout request failed: {}", e);
        }

        *self.inner.session.write().unwrap() = None;
        self.inner.set_state(ConnectionState::Disconnected);
        self.inner.signals.emit(&ConnectionSignal::StateChanged);
        self.inner.signals.emit(&ConnectionSignal::LoggedOut);
    }

    /// Run a single sync request and apply its response.
    pub async fn sync_once(&self, settings: SyncSettings) -> Result<()> {
        let job = self.call_api(SyncRequest { settings }, RequestPriority::Background);
        let response = job.await_response().await?;
        self.inner.on_sync_success(response);
        self.inner.signals.emit(&ConnectionSignal::SyncDone);
        Ok(())
    }

    /// Start the sync loop. Only one loop runs per connection.
    pub fn start_sync(&self) {
        if self.inner.sync_running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sync_stop.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut backoff = RETRY_INITIAL_DELAY;
            let mut last_sync_time: Option<Instant> = None;

            loop {
                if inner.sync_stop.load(Ordering::SeqCst) {
                    break;
                }

                // If the last sync happened less than a second ago, sleep
                // for a while to not hammer out requests if the server
                // doesn't respect the sync timeout.
                let now = Instant::now();
                if let Some(last) = last_sync_time {
                    if now.duration_since(last) <= Duration::from_secs(1) {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                last_sync_time = Some(now);

                let mut settings = SyncSettings::new().timeout(SYNC_TIMEOUT);
                if let Some(token) = inner.sync_token.read().unwrap().clone() {
                    settings = settings.token(token);
                }

                let job = inner.call_api(SyncRequest { settings }, RequestPriority::Background);
                *inner.sync_job.lock().unwrap() = Some(job.shared_handle());

                match job.await_response().await {
                    Ok(response) => {
                        inner.on_sync_success(response);
                        inner.set_state(ConnectionState::Connected);
                        inner.signals.emit(&ConnectionSignal::SyncDone);
                        backoff = RETRY_INITIAL_DELAY;
                    }
                    Err(e) if e.kind == crate::job::ErrorKind::Abandoned => break,
                    Err(e) => {
                        inner.signals.emit(&ConnectionSignal::SyncError {
                            message: e.message.clone(),
                            details: e.details.clone(),
                        });

                        let retryable = matches!(
                            e.kind,
                            crate::job::ErrorKind::Network | crate::job::ErrorKind::Timeout
                        );
                        if !retryable {
                            // Protocol violations and auth failures stop the
                            // loop; explicit actions still work.
                            warn!("sync loop terminating: {}", e);
                            break;
                        }

                        inner.set_state(ConnectionState::Reconnecting);
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, RETRY_MAX_DELAY);
                    }
                }
            }

            *inner.sync_job.lock().unwrap() = None;
            inner.sync_running.store(false, Ordering::SeqCst);
        });
    }

    /// Stop the sync loop, abandoning the in-flight sync request.
    pub fn stop_sync(&self) {
        self.inner.sync_stop.store(true, Ordering::SeqCst);
        if let Some(job) = self.inner.sync_job.lock().unwrap().take() {
            job.abandon();
        }
    }

    /// Join a room by id or alias.
    pub async fn join_room(
        &self,
        room_id_or_alias: &str,
        server_names: Vec<String>,
    ) -> Result<Arc<Room>> {
        let own_user_id = self.user_id().ok_or(Error::AuthenticationRequired)?;
        let job = self.call_api(
            JoinRoom {
                room_id_or_alias: room_id_or_alias.to_owned(),
                server_names,
            },
            RequestPriority::Foreground,
        );
        let response = job.await_response().await?;
        Ok(self
            .inner
            .provide_room(&response.room_id, JoinState::Join, &own_user_id))
    }

    /// Leave a room.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        let own_user_id = self.user_id().ok_or(Error::AuthenticationRequired)?;
        let job = self.call_api(
            LeaveRoom {
                room_id: room_id.clone(),
            },
            RequestPriority::Foreground,
        );
        job.await_response().await?;
        self.inner
            .provide_room(room_id, JoinState::Leave, &own_user_id);
        Ok(())
    }

    /// Forget a room: ensure the server side is left, issue `/forget`, and
    /// on success delete the local room object(s).
    pub async fn forget_room(&self, room_id: &RoomId) -> Result<()> {
        let joined = self
            .room(room_id)
            .map_or(false, |room| room.join_state() == JoinState::Join);
        if joined {
            self.leave_room(room_id).await?;
        }

        let job = self.call_api(
            ForgetRoom {
                room_id: room_id.clone(),
            },
            RequestPriority::Foreground,
        );
        job.await_response().await?;

        self.inner.delete_room_locally(room_id);
        Ok(())
    }

    /// Create a room.
    pub async fn create_room(&self, request: CreateRoom) -> Result<Arc<Room>> {
        let own_user_id = self.user_id().ok_or(Error::AuthenticationRequired)?;
        let is_direct = request.is_direct;
        let invites = request.invites.clone();

        let job = self.call_api(request, RequestPriority::Foreground);
        let response = job.await_response().await?;

        let room = self
            .inner
            .provide_room(&response.room_id, JoinState::Join, &own_user_id);
        self.inner
            .signals
            .emit(&ConnectionSignal::CreatedRoom { room: room.clone() });

        if is_direct {
            for invitee in invites {
                self.inner.add_to_direct_chats(&response.room_id, &invitee);
            }
        }
        Ok(room)
    }

    /// Create a direct chat with the given user; always creates a new
    /// room, unlike [`request_direct_chat`](Self::request_direct_chat).
    pub async fn create_direct_chat(
        &self,
        user_id: UserId,
        topic: Option<String>,
        name: Option<String>,
    ) -> Result<Arc<Room>> {
        let mut request = CreateRoom::direct_chat(user_id);
        request.topic = topic;
        request.name = name;
        self.create_room(request).await
    }

    fn existing_direct_chat(&self, user_id: &UserId) -> Option<Arc<Room>> {
        let chats = self.inner.direct_chats.read().unwrap();
        let rooms = chats.by_user.get(user_id)?;
        rooms
            .iter()
            .filter_map(|room_id| self.room(room_id))
            .find(|room| room.join_state() == JoinState::Join)
    }

    /// Get a direct chat with the user, reusing a joined one when
    /// possible.
    ///
    /// Emits `direct_chat_available` synchronously when a joined direct
    /// chat already exists; otherwise creates one and emits the signal
    /// once the new room's state has loaded.
    pub fn request_direct_chat(&self, user_id: &UserId) {
        if let Some(room) = self.existing_direct_chat(user_id) {
            self.inner
                .signals
                .emit(&ConnectionSignal::DirectChatAvailable { room });
            return;
        }

        let connection = self.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            match connection.create_direct_chat(user_id, None, None).await {
                Ok(room) => {
                    room.await_first_sync().await;
                    connection
                        .inner
                        .signals
                        .emit(&ConnectionSignal::DirectChatAvailable { room });
                }
                Err(e) => warn!("creating a direct chat failed: {}", e),
            }
        });
    }

    /// Run an operation in a direct chat with the user, creating the chat
    /// first if none exists.
    pub fn do_in_direct_chat(
        &self,
        user_id: &UserId,
        operation: impl FnOnce(Arc<Room>) + Send + 'static,
    ) {
        if let Some(room) = self.existing_direct_chat(user_id) {
            operation(room);
            return;
        }

        let connection = self.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            match connection.create_direct_chat(user_id, None, None).await {
                Ok(room) => {
                    room.await_first_sync().await;
                    operation(room);
                }
                Err(e) => warn!("creating a direct chat failed: {}", e),
            }
        });
    }

    /// Mark a room as a direct chat with the user. The change signal fires
    /// synchronously; the server copy follows best-effort.
    pub fn add_to_direct_chats(&self, room_id: &RoomId, user_id: &UserId) {
        self.inner.add_to_direct_chats(room_id, user_id);
    }

    /// Unmark a room as a direct chat, for one user or (with `None`) for
    /// all of them. A room object need not exist, so forgotten ids can be
    /// scrubbed too.
    pub fn remove_from_direct_chats(&self, room_id: &RoomId, user_id: Option<&UserId>) {
        self.inner.remove_from_direct_chats(room_id, user_id);
    }

    /// Whether the room id corresponds to a direct chat.
    pub fn is_direct_chat(&self, room_id: &RoomId) -> bool {
        self.inner
            .direct_chats
            .read()
            .unwrap()
            .by_room
            .contains_key(room_id)
    }

    /// The whole map from users to their direct chat rooms.
    pub fn direct_chats(&self) -> BTreeMap<UserId, BTreeSet<RoomId>> {
        self.inner.direct_chats.read().unwrap().by_user.clone()
    }

    /// The users a room is a direct chat with; empty if it is not one.
    pub fn direct_chat_users(&self, room_id: &RoomId) -> Vec<Arc<User>> {
        self.inner
            .direct_chats
            .read()
            .unwrap()
            .by_room
            .get(room_id)
            .map(|users| {
                users
                    .iter()
                    .map(|user| self.inner.get_or_create_user(user))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a user is in the ignore list.
    pub fn is_ignored(&self, user_id: &UserId) -> bool {
        self.inner.ignored_users.read().unwrap().contains(user_id)
    }

    /// The whole list of ignored users.
    pub fn ignored_users(&self) -> BTreeSet<UserId> {
        self.inner.ignored_users.read().unwrap().clone()
    }

    /// Add a user to the ignore list. The change signal fires
    /// synchronously; the server copy follows best-effort.
    pub fn add_to_ignored_users(&self, user_id: &UserId) {
        let added = self
            .inner
            .ignored_users
            .write()
            .unwrap()
            .insert(user_id.clone());
        if !added {
            return;
        }

        let mut additions = BTreeSet::new();
        additions.insert(user_id.clone());
        self.inner
            .signals
            .emit(&ConnectionSignal::IgnoredUsersListChanged {
                additions,
                removals: BTreeSet::new(),
            });
        self.inner
            .upload_account_data("m.ignored_user_list", self.inner.ignored_users_content());
    }

    /// Remove a user from the ignore list.
    pub fn remove_from_ignored_users(&self, user_id: &UserId) {
        let removed = self.inner.ignored_users.write().unwrap().remove(user_id);
        if !removed {
            return;
        }

        let mut removals = BTreeSet::new();
        removals.insert(user_id.clone());
        self.inner
            .signals
            .emit(&ConnectionSignal::IgnoredUsersListChanged {
                additions: BTreeSet::new(),
                removals,
            });
        self.inner
            .upload_account_data("m.ignored_user_list", self.inner.ignored_users_content());
    }

    /// Whether the account has data of the given type. Direct chats and
    /// ignored users have their own accessors.
    pub fn has_account_data(&self, event_type: &str) -> bool {
        self.inner
            .account_data
            .read()
            .unwrap()
            .contains_key(event_type)
    }

    /// The content of an account data event of the given type, as JSON.
    pub fn account_data_json(&self, event_type: &str) -> Option<JsonValue> {
        self.inner
            .account_data
            .read()
            .unwrap()
            .get(event_type)
            .map(|event| event.content.to_json())
    }

    /// Set a generic account data event. The change signal fires
    /// synchronously; the server copy follows best-effort.
    pub fn set_account_data(&self, event_type: &str, content: JsonValue) {
        let event = Event {
            content: AnyEventContent::parse(event_type, content.clone()),
        };
        self.inner
            .account_data
            .write()
            .unwrap()
            .insert(event_type.to_owned(), event);
        self.inner
            .signals
            .emit(&ConnectionSignal::AccountDataChanged {
                event_type: event_type.to_owned(),
            });
        self.inner.upload_account_data(event_type, content);
    }

    /// All rooms grouped by tag.
    pub fn tags_to_rooms(&self) -> BTreeMap<String, Vec<Arc<Room>>> {
        let mut map: BTreeMap<String, Vec<Arc<Room>>> = BTreeMap::new();
        for room in self.rooms().into_iter().chain(self.invitations()) {
            for tag in room.tags().keys() {
                map.entry(tag.clone()).or_default().push(room.clone());
            }
        }
        map
    }

    /// All tag names in use on this connection.
    pub fn tag_names(&self) -> Vec<String> {
        self.tags_to_rooms().into_keys().collect()
    }

    /// The rooms carrying the given tag.
    pub fn rooms_with_tag(&self, tag: &str) -> Vec<Arc<Room>> {
        self.tags_to_rooms().remove(tag).unwrap_or_default()
    }

    /// Fetch a thumbnail for an `mxc://` URL.
    pub fn get_thumbnail(
        &self,
        mxc_url: &str,
        width: u32,
        height: u32,
    ) -> Result<Job<GetThumbnail>> {
        let (server_name, media_id) = requests::mxc_to_server_and_id(mxc_url)
            .ok_or_else(|| Error::HomeserverUnresolved(format!("not an mxc url: {}", mxc_url)))?;
        Ok(self.call_api(
            GetThumbnail {
                server_name,
                media_id,
                width,
                height,
            },
            RequestPriority::Background,
        ))
    }

    /// Upload bytes to the media repository.
    pub fn upload_content(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: Option<String>,
    ) -> Job<UploadContent> {
        self.call_api(
            UploadContent {
                data,
                content_type: content_type.to_owned(),
                filename,
            },
            RequestPriority::Foreground,
        )
    }

    /// Download the content behind an `mxc://` URL.
    pub fn get_content(&self, mxc_url: &str) -> Result<Job<GetContent>> {
        let (server_name, media_id) = requests::mxc_to_server_and_id(mxc_url)
            .ok_or_else(|| Error::HomeserverUnresolved(format!("not an mxc url: {}", mxc_url)))?;
        Ok(self.call_api(
            GetContent {
                server_name,
                media_id,
            },
            RequestPriority::Background,
        ))
    }

    /// Download the content behind an `mxc://` URL into a local file.
    pub async fn download_file(&self, mxc_url: &str, path: PathBuf) -> Result<PathBuf> {
        let job = self.get_content(mxc_url)?;
        let content = job.await_response().await?;
        tokio::fs::write(&path, content.data).await?;
        Ok(path)
    }

    /// Send to-device events; the map goes from user to device (`*` for
    /// all of a user's devices) to event content.
    pub fn send_to_devices(
        &self,
        event_type: &str,
        messages: BTreeMap<UserId, BTreeMap<String, JsonValue>>,
    ) -> Job<SendToDevice> {
        self.call_api(
            SendToDevice {
                event_type: event_type.to_owned(),
                txn_id: self.generate_txn_id(),
                messages,
            },
            RequestPriority::Foreground,
        )
    }

    /// Upload device keys; the interface point for an encryption layer
    /// outside this crate.
    pub fn upload_device_keys(
        &self,
        device_keys: Option<JsonValue>,
        one_time_keys: Option<JsonValue>,
    ) -> Job<UploadKeys> {
        self.call_api(
            UploadKeys {
                device_keys,
                one_time_keys,
            },
            RequestPriority::Background,
        )
    }

    /// The path the state cache is saved to: the configured cache
    /// directory plus the user id with `:` replaced by `_`.
    pub fn state_cache_path(&self) -> Option<PathBuf> {
        let cache_dir = self.inner.cache_dir.as_ref()?;
        let user_id = self.user_id()?;
        let safe_user_id = user_id.as_str().replace(':', "_");
        Some(cache_dir.join(format!("{}_state.json", safe_user_id)))
    }

    /// Save a snapshot of the rooms' state (not their timelines), the
    /// account-data overlays and the sync token to the cache file.
    pub async fn save_state(&self) -> Result<()> {
        let path = match self.state_cache_path() {
            Some(path) => path,
            None => return Ok(()),
        };

        let mut rooms: Vec<CachedRoom> = Vec::new();
        for room in self.rooms().into_iter().chain(self.invitations()) {
            rooms.push(CachedRoom {
                room_id: room.room_id().clone(),
                join_state: room.join_state(),
                state: room
                    .state_events()
                    .iter()
                    .map(RoomEvent::to_json)
                    .collect(),
                account_data: room
                    .account_data_events()
                    .iter()
                    .map(Event::to_json)
                    .collect(),
            });
        }

        let account_data = self
            .inner
            .account_data
            .read()
            .unwrap()
            .values()
            .map(Event::to_json)
            .collect();

        let snapshot = CachedState {
            cache_version: CACHE_VERSION,
            next_batch: self.sync_token(),
            direct_chats: self.direct_chats(),
            ignored_users: self.ignored_users(),
            account_data,
            rooms,
        };

        state_store::save(&path, &snapshot).await
    }

    /// Restore the snapshot written by [`save_state`](Self::save_state);
    /// a no-op when the file is missing or has an incompatible version.
    /// The next sync resumes from the saved token.
    pub async fn load_state(&self) -> Result<()> {
        let path = match self.state_cache_path() {
            Some(path) => path,
            None => return Ok(()),
        };
        let own_user_id = match self.user_id() {
            Some(user_id) => user_id,
            None => return Ok(()),
        };

        let snapshot = match state_store::load(&path).await? {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        };

        *self.inner.sync_token.write().unwrap() = snapshot.next_batch;

        for event_json in &snapshot.account_data {
            let event = Event::from_json(event_json);
            let event_type = event.event_type().to_owned();
            self.inner
                .account_data
                .write()
                .unwrap()
                .insert(event_type, event);
        }

        {
            let mut chats = self.inner.direct_chats.write().unwrap();
            for (user_id, room_ids) in &snapshot.direct_chats {
                for room_id in room_ids {
                    chats.insert(user_id, room_id);
                }
            }
        }
        *self.inner.ignored_users.write().unwrap() = snapshot.ignored_users;

        for cached in snapshot.rooms {
            let room = self
                .inner
                .provide_room(&cached.room_id, cached.join_state, &own_user_id);
            let update = RoomUpdate {
                state: cached.state.iter().map(RoomEvent::from_json).collect(),
                account_data: cached.account_data.iter().map(Event::from_json).collect(),
                ..Default::default()
            };
            room.update(update);
            self.inner
                .signals
                .emit(&ConnectionSignal::LoadedRoomState { room });
        }

        info!("restored state cache from {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{http_send::TransportError, test_json};

    /// A transport that replays scripted responses and falls back to 404,
    /// so background jobs terminate instead of retrying.
    #[derive(Debug)]
    struct TestTransport {
        script: Mutex<Vec<(u16, JsonValue)>>,
    }

    impl TestTransport {
        fn new(mut script: Vec<(u16, JsonValue)>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }

        fn empty() -> Arc<Self> {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl HttpSend for TestTransport {
        async fn send_request(
            &self,
            _request: http::Request<Vec<u8>>,
            _priority: RequestPriority,
        ) -> std::result::Result<http::Response<Vec<u8>>, TransportError> {
            let (status, body) = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or((404, json!({ "errcode": "M_NOT_FOUND", "error": "not found" })));
            Ok(http::Response::builder()
                .status(status)
                .body(serde_json::to_vec(&body).unwrap())
                .unwrap())
        }
    }

    fn session() -> Session {
        Session {
            access_token: "1234".to_owned(),
            user_id: UserId::try_from("@cheeky_monkey:matrix.org").unwrap(),
            device_id: "DEVICEID".to_owned(),
        }
    }

    /// A connection that is logged in without the sync loop running.
    fn logged_in_connection(transport: Arc<dyn HttpSend>) -> Connection {
        let connection = Connection::with_transport(ClientConfig::new(), transport);
        *connection.inner.homeserver.write().unwrap() =
            Some(Url::parse("http://localhost:8008").unwrap());
        *connection.inner.session.write().unwrap() = Some(session());
        connection.inner.set_state(ConnectionState::Connected);
        connection
    }

    fn room_signal_recorder(connection: &Connection) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        connection.signals().subscribe_all(move |signal| {
            let name = match signal {
                ConnectionSignal::NewRoom { .. } => "new_room",
                ConnectionSignal::InvitedRoom { .. } => "invited_room",
                ConnectionSignal::JoinedRoom { .. } => "joined_room",
                ConnectionSignal::LeftRoom { .. } => "left_room",
                ConnectionSignal::AboutToDeleteRoom { .. } => "about_to_delete_room",
                ConnectionSignal::LoadedRoomState { .. } => "loaded_room_state",
                _ => return,
            };
            seen2.lock().unwrap().push(name.to_owned());
        });
        seen
    }

    #[tokio::test]
    async fn initial_sync_creates_a_joined_room() {
        let connection = logged_in_connection(TestTransport::empty());
        let response = SyncResponse::parse(&test_json::SYNC).unwrap();
        connection.inner.on_sync_success(response);

        let room_id = RoomId::try_from("!SVkFJHzfwvuaIEawgC:localhost").unwrap();
        let room = connection.room(&room_id).unwrap();

        assert_eq!(room.join_state(), JoinState::Join);
        assert_eq!(room.display_name(), "example");
        assert_eq!(room.unread_count(), 11);
        assert_eq!(
            connection.sync_token().as_deref(),
            Some("s526_47314_0_7_1_1_1_11444_1")
        );
        assert!(connection
            .ignored_users()
            .contains(&UserId::try_from("@someone:example.org").unwrap()));
    }

    #[tokio::test]
    async fn invite_to_join_fires_the_transition_signals_in_order() {
        let connection = logged_in_connection(TestTransport::empty());
        let seen = room_signal_recorder(&connection);

        let room_id = RoomId::try_from("!696r7674:localhost").unwrap();
        connection
            .inner
            .on_sync_success(SyncResponse::parse(&test_json::INVITE_SYNC).unwrap());

        let invite = connection.invitation(&room_id).unwrap();
        assert_eq!(invite.join_state(), JoinState::Invite);
        assert_eq!(invite.display_name(), "My Room Name");

        connection.inner.on_sync_success(
            SyncResponse::parse(&json!({
                "next_batch": "s3",
                "rooms": { "join": { "!696r7674:localhost": {} } }
            }))
            .unwrap(),
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "new_room",
                "invited_room",
                "loaded_room_state",
                "new_room",
                "joined_room",
                "about_to_delete_room",
                "loaded_room_state",
            ]
        );

        // The invite partition is empty now, the join partition has the
        // room, and they were distinct objects.
        assert!(connection.invitation(&room_id).is_none());
        let joined = connection.room(&room_id).unwrap();
        assert_eq!(joined.join_state(), JoinState::Join);
        assert!(!Arc::ptr_eq(&joined, &invite));
    }

    #[tokio::test]
    async fn joined_room_prev_points_at_the_invite() {
        let connection = logged_in_connection(TestTransport::empty());

        let prev = Arc::new(Mutex::new(None));
        let prev2 = prev.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::JoinedRoom, move |signal| {
                if let ConnectionSignal::JoinedRoom { prev, .. } = signal {
                    *prev2.lock().unwrap() = prev.clone();
                }
            });

        connection
            .inner
            .on_sync_success(SyncResponse::parse(&test_json::INVITE_SYNC).unwrap());
        let invite = connection
            .invitation(&RoomId::try_from("!696r7674:localhost").unwrap())
            .unwrap();

        connection.inner.on_sync_success(
            SyncResponse::parse(&json!({
                "next_batch": "s3",
                "rooms": { "join": { "!696r7674:localhost": {} } }
            }))
            .unwrap(),
        );

        let prev = prev.lock().unwrap().clone().unwrap();
        assert!(Arc::ptr_eq(&prev, &invite));
    }

    #[tokio::test]
    async fn sync_batches_are_idempotent() {
        let connection = logged_in_connection(TestTransport::empty());

        connection
            .inner
            .on_sync_success(SyncResponse::parse(&test_json::SYNC).unwrap());
        let room_id = RoomId::try_from("!SVkFJHzfwvuaIEawgC:localhost").unwrap();
        let room = connection.room(&room_id).unwrap();
        let unread = room.unread_count();
        let members = room.members().len();
        let timeline_len = room.read_timeline(|t| t.len());

        connection
            .inner
            .on_sync_success(SyncResponse::parse(&test_json::SYNC).unwrap());

        let room_again = connection.room(&room_id).unwrap();
        assert!(Arc::ptr_eq(&room, &room_again));
        assert_eq!(room.unread_count(), unread);
        assert_eq!(room.members().len(), members);
        assert_eq!(room.read_timeline(|t| t.len()), timeline_len);
    }

    #[tokio::test]
    async fn local_direct_chat_changes_fire_once() {
        let connection = logged_in_connection(TestTransport::empty());
        let fired = Arc::new(Mutex::new(0));

        let fired2 = fired.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::DirectChatsListChanged, move |_| {
                *fired2.lock().unwrap() += 1;
            });

        let user = UserId::try_from("@bob:example.com").unwrap();
        let room = RoomId::try_from("!abcdefgh:example.com").unwrap();
        connection.add_to_direct_chats(&room, &user);
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(connection.is_direct_chat(&room));

        // The server echoing the same map back must not re-fire.
        connection.inner.on_sync_success(
            SyncResponse::parse(&json!({
                "next_batch": "s2",
                "account_data": {
                    "events": [{
                        "type": "m.direct",
                        "content": { "@bob:example.com": ["!abcdefgh:example.com"] }
                    }]
                }
            }))
            .unwrap(),
        );
        assert_eq!(*fired.lock().unwrap(), 1);

        // A genuinely different list does.
        connection.inner.on_sync_success(
            SyncResponse::parse(&json!({
                "next_batch": "s3",
                "account_data": {
                    "events": [{
                        "type": "m.direct",
                        "content": { "@bob:example.com": ["!other:example.com"] }
                    }]
                }
            }))
            .unwrap(),
        );
        assert_eq!(*fired.lock().unwrap(), 2);
        assert!(!connection.is_direct_chat(&room));
    }

    #[tokio::test]
    async fn ignored_users_changes_are_diffed() {
        let connection = logged_in_connection(TestTransport::empty());
        let changes = Arc::new(Mutex::new(Vec::new()));

        let changes2 = changes.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::IgnoredUsersListChanged, move |signal| {
                if let ConnectionSignal::IgnoredUsersListChanged {
                    additions,
                    removals,
                } = signal
                {
                    changes2
                        .lock()
                        .unwrap()
                        .push((additions.len(), removals.len()));
                }
            });

        let ignored = UserId::try_from("@spammer:example.org").unwrap();
        connection.add_to_ignored_users(&ignored);
        connection.add_to_ignored_users(&ignored); // no-op
        connection.remove_from_ignored_users(&ignored);

        assert_eq!(*changes.lock().unwrap(), vec![(1, 0), (0, 1)]);
    }

    #[tokio::test]
    async fn transaction_ids_are_unique() {
        let connection = logged_in_connection(TestTransport::empty());
        let a = connection.generate_txn_id();
        let b = connection.generate_txn_id();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn users_are_created_once_and_persist() {
        let connection = logged_in_connection(TestTransport::empty());
        let created = Arc::new(Mutex::new(0));

        let created2 = created.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::NewUser, move |_| {
                *created2.lock().unwrap() += 1;
            });

        let user_id = UserId::try_from("@example:localhost").unwrap();
        let first = connection.user_by_id(&user_id);
        let second = connection.user_by_id(&user_id);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*created.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn login_works_against_a_real_http_stack() {
        let _login = mockito::mock("POST", "/_matrix/client/r0/login")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(test_json::LOGIN.to_string())
            .create();
        let _sync = mockito::mock(
            "GET",
            mockito::Matcher::Regex(r"^/_matrix/client/r0/sync.*$".to_string()),
        )
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({ "next_batch": "s1", "rooms": {} }).to_string())
        .create();

        let connection = Connection::new(ClientConfig::new()).unwrap();
        connection.set_homeserver(Url::parse(&mockito::server_url()).unwrap());

        connection
            .connect_to_server("@cheeky_monkey:matrix.org", "wordpass", "quadrant", None)
            .await
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.access_token().as_deref(), Some("abc123"));
        connection.stop_sync();
    }

    #[tokio::test]
    async fn login_stores_the_session_and_connects() {
        let transport = TestTransport::new(vec![(200, test_json::LOGIN.clone())]);
        let connection = Connection::with_transport(ClientConfig::new(), transport);
        connection.set_homeserver(Url::parse("http://localhost:8008").unwrap());

        connection
            .connect_to_server("@cheeky_monkey:matrix.org", "wordpass", "quadrant", None)
            .await
            .unwrap();

        assert_eq!(connection.state(), ConnectionState::Connected);
        let session = connection.session().unwrap();
        assert_eq!(session.access_token, "abc123");
        assert_eq!(session.user_id.as_str(), "@cheeky_monkey:matrix.org");
        connection.stop_sync();
    }

    #[tokio::test]
    async fn failed_login_emits_login_error() {
        let transport = TestTransport::new(vec![(
            403,
            json!({ "errcode": "M_FORBIDDEN", "error": "Invalid password" }),
        )]);
        let connection = Connection::with_transport(ClientConfig::new(), transport);
        connection.set_homeserver(Url::parse("http://localhost:8008").unwrap());

        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::LoginError, move |signal| {
                if let ConnectionSignal::LoginError { message, .. } = signal {
                    errors2.lock().unwrap().push(message.clone());
                }
            });

        let result = connection
            .connect_to_server("@cheeky_monkey:matrix.org", "wrong", "quadrant", None)
            .await;

        assert!(result.is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(*errors.lock().unwrap(), vec!["Invalid password".to_owned()]);
    }

    #[tokio::test]
    async fn homeserver_is_resolved_from_the_mxid() {
        let transport = TestTransport::new(vec![
            (
                200,
                json!({ "m.homeserver": { "base_url": "https://matrix-client.matrix.org" } }),
            ),
            (200, json!({ "versions": ["r0.6.0"] })),
            (200, test_json::LOGIN.clone()),
        ]);
        let connection = Connection::with_transport(ClientConfig::new(), transport);

        connection
            .connect_to_server("@cheeky_monkey:matrix.org", "wordpass", "quadrant", None)
            .await
            .unwrap();

        assert_eq!(
            connection.homeserver().unwrap().as_str(),
            "https://matrix-client.matrix.org/"
        );
        connection.stop_sync();
    }

    #[tokio::test]
    async fn bad_well_known_emits_resolve_error() {
        let connection =
            Connection::with_transport(ClientConfig::new(), TestTransport::empty());

        let errors = Arc::new(Mutex::new(0));
        let errors2 = errors.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::ResolveError, move |_| {
                *errors2.lock().unwrap() += 1;
            });

        let result = connection
            .connect_to_server("@cheeky_monkey:matrix.org", "wordpass", "quadrant", None)
            .await;

        assert!(result.is_err());
        assert_eq!(connection.state(), ConnectionState::Failed);
        assert_eq!(*errors.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn forget_leaves_first_and_deletes_locally() {
        // Three empty 200s: the m.direct upload, /leave and /forget; all
        // three bodies are interchangeable, so ordering does not matter.
        let transport = TestTransport::new(vec![
            (200, json!({})),
            (200, json!({})),
            (200, json!({})),
        ]);
        let connection = logged_in_connection(transport);

        connection.inner.on_sync_success(
            SyncResponse::parse(&json!({
                "next_batch": "s2",
                "rooms": { "join": { "!doomed:localhost": {} } }
            }))
            .unwrap(),
        );
        let room_id = RoomId::try_from("!doomed:localhost").unwrap();
        let user = UserId::try_from("@bob:example.com").unwrap();
        connection.add_to_direct_chats(&room_id, &user);

        let deleted = Arc::new(Mutex::new(0));
        let deleted2 = deleted.clone();
        connection
            .signals()
            .subscribe(ConnectionSignalKind::AboutToDeleteRoom, move |_| {
                *deleted2.lock().unwrap() += 1;
            });

        connection.forget_room(&room_id).await.unwrap();

        assert!(connection.room(&room_id).is_none());
        assert!(!connection.is_direct_chat(&room_id));
        assert_eq!(*deleted.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn state_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::new().cache_dir(dir.path());
        let connection =
            Connection::with_transport(config, TestTransport::empty());
        *connection.inner.homeserver.write().unwrap() =
            Some(Url::parse("http://localhost:8008").unwrap());
        *connection.inner.session.write().unwrap() = Some(session());

        connection
            .inner
            .on_sync_success(SyncResponse::parse(&test_json::SYNC).unwrap());
        connection.add_to_direct_chats(
            &RoomId::try_from("!abcdefgh:example.com").unwrap(),
            &UserId::try_from("@bob:example.com").unwrap(),
        );
        connection.save_state().await.unwrap();

        let config = ClientConfig::new().cache_dir(dir.path());
        let restored =
            Connection::with_transport(config, TestTransport::empty());
        *restored.inner.session.write().unwrap() = Some(session());
        restored.load_state().await.unwrap();

        assert_eq!(
            restored.sync_token().as_deref(),
            Some("s526_47314_0_7_1_1_1_11444_1")
        );

        let room = restored
            .room(&RoomId::try_from("!SVkFJHzfwvuaIEawgC:localhost").unwrap())
            .unwrap();
        assert_eq!(room.join_state(), JoinState::Join);
        assert_eq!(room.display_name(), "example");
        assert_eq!(room.members().len(), 1);
        // Timelines are not persisted.
        assert_eq!(room.read_timeline(|t| t.len()), 0);

        assert!(restored
            .is_direct_chat(&RoomId::try_from("!abcdefgh:example.com").unwrap()));
        assert!(restored
            .ignored_users()
            .contains(&UserId::try_from("@someone:example.org").unwrap()));
    }
}
