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

//! The typed request catalog.
//!
//! One struct per endpoint the runtime calls; the job machinery in the
//! parent module is shared by all of them.

use std::collections::BTreeMap;

use http::Method;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::{
    expect_empty, json_response, Body, JobError, Request, BASE_PATH, MEDIA_BASE_PATH,
};
use crate::{
    config::SyncSettings,
    events::RoomEvent,
    identifiers::{EventId, RoomId, UserId},
    sync::SyncResponse,
};

/// Percent-encode one path segment; room ids, aliases and event ids all
/// contain characters (`!`, `#`, `:`) that must not reach the URL parser
/// raw.
pub(crate) fn encode(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Split an `mxc://server/mediaId` URL into its server and media id parts.
pub(crate) fn mxc_to_server_and_id(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("mxc://")?;
    let mut parts = rest.splitn(2, '/');
    let server = parts.next()?.to_owned();
    let media_id = parts.next()?.to_owned();
    if server.is_empty() || media_id.is_empty() {
        None
    } else {
        Some((server, media_id))
    }
}

/// `POST /login` with the `m.login.password` flow.
#[derive(Clone, Debug)]
pub struct PasswordLogin {
    /// The MXID or localpart to log in as.
    pub user: String,
    /// The password.
    pub password: String,
    /// The display name for a newly created device.
    pub device_name: String,
    /// Reuse an existing device id instead of creating a device.
    pub device_id: Option<String>,
}

/// The response to a successful login.
#[derive(Clone, Debug, Deserialize)]
pub struct LoginResponse {
    /// The fully qualified MXID that has been registered.
    pub user_id: UserId,
    /// The access token for the new session.
    pub access_token: String,
    /// The device id of this session.
    pub device_id: String,
}

impl Request for PasswordLogin {
    type Response = LoginResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/login", BASE_PATH)
    }

    fn needs_token(&self) -> bool {
        false
    }

    fn body(&self) -> Body {
        let mut body = json!({
            "type": "m.login.password",
            "user": self.user,
            "password": self.password,
            "initial_device_display_name": self.device_name,
        });
        if let Some(device_id) = &self.device_id {
            body["device_id"] = json!(device_id);
        }
        Body::Json(body)
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// `POST /logout`, invalidating the access token.
#[derive(Clone, Debug)]
pub struct Logout;

impl Request for Logout {
    type Response = ();

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/logout", BASE_PATH)
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// `GET /sync`, the long-poll endpoint.
#[derive(Clone, Debug)]
pub struct Sync {
    /// Token, timeout and filter for this call.
    pub settings: SyncSettings,
}

impl Request for Sync {
    type Response = SyncResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!("{}/sync", BASE_PATH)
    }

    fn query(&self) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(filter) = &self.settings.filter {
            query.push(("filter".to_owned(), filter.clone()));
        }
        if let Some(timeout) = self.settings.timeout {
            query.push(("timeout".to_owned(), timeout.as_millis().to_string()));
        }
        if self.settings.full_state {
            query.push(("full_state".to_owned(), "true".to_owned()));
        }
        if let Some(token) = &self.settings.token {
            query.push(("since".to_owned(), token.clone()));
        }
        query
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        let json: JsonValue = json_response(&response)?;
        SyncResponse::parse(&json)
    }
}

/// `POST /join/{roomIdOrAlias}`.
#[derive(Clone, Debug)]
pub struct JoinRoom {
    /// A room id or alias, sigil included.
    pub room_id_or_alias: String,
    /// Servers to try and join through.
    pub server_names: Vec<String>,
}

/// The response to a join request.
#[derive(Clone, Debug, Deserialize)]
pub struct JoinRoomResponse {
    /// The id of the room that was joined.
    pub room_id: RoomId,
}

impl Request for JoinRoom {
    type Response = JoinRoomResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/join/{}", BASE_PATH, encode(&self.room_id_or_alias))
    }

    fn query(&self) -> Vec<(String, String)> {
        self.server_names
            .iter()
            .map(|s| ("server_name".to_owned(), s.clone()))
            .collect()
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// `POST /rooms/{roomId}/leave`.
#[derive(Clone, Debug)]
pub struct LeaveRoom {
    /// The room to leave.
    pub room_id: RoomId,
}

impl Request for LeaveRoom {
    type Response = ();

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/rooms/{}/leave", BASE_PATH, encode(self.room_id.as_str()))
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// `POST /rooms/{roomId}/forget`.
#[derive(Clone, Debug)]
pub struct ForgetRoom {
    /// The room to forget.
    pub room_id: RoomId,
}

impl Request for ForgetRoom {
    type Response = ();

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/forget",
            BASE_PATH,
            encode(self.room_id.as_str())
        )
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// `PUT /rooms/{roomId}/send/{eventType}/{txnId}`.
#[derive(Clone, Debug)]
pub struct SendMessage {
    /// The room to send to.
    pub room_id: RoomId,
    /// The event type, e.g. `m.room.message`.
    pub event_type: String,
    /// The client-generated transaction id making retries idempotent.
    pub txn_id: String,
    /// The event content.
    pub content: JsonValue,
}

/// The response to a send request.
#[derive(Clone, Debug, Deserialize)]
pub struct SendMessageResponse {
    /// The id the server assigned to the sent event.
    pub event_id: EventId,
}

impl Request for SendMessage {
    type Response = SendMessageResponse;

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/send/{}/{}",
            BASE_PATH,
            encode(self.room_id.as_str()),
            encode(&self.event_type),
            encode(&self.txn_id)
        )
    }

    fn body(&self) -> Body {
        Body::Json(self.content.clone())
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// `POST /rooms/{roomId}/receipt/m.read/{eventId}`.
#[derive(Clone, Debug)]
pub struct PostReceipt {
    /// The room the receipt belongs to.
    pub room_id: RoomId,
    /// The event the user has read up to.
    pub event_id: EventId,
}

impl Request for PostReceipt {
    type Response = ();

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/receipt/m.read/{}",
            BASE_PATH,
            encode(self.room_id.as_str()),
            encode(self.event_id.as_str())
        )
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// The direction of a `/messages` pagination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Towards older events.
    Backwards,
    /// Towards newer events.
    Forwards,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Backwards => "b",
            Direction::Forwards => "f",
        }
    }
}

/// `GET /rooms/{roomId}/messages`.
#[derive(Clone, Debug)]
pub struct GetMessages {
    /// The room to paginate.
    pub room_id: RoomId,
    /// The pagination token to start from.
    pub from: String,
    /// An optional token to stop at.
    pub to: Option<String>,
    /// The direction to paginate in.
    pub dir: Direction,
    /// The maximum number of events to return.
    pub limit: Option<u32>,
}

/// One page of room history.
#[derive(Clone, Debug)]
pub struct MessagesResponse {
    /// The token the page starts at.
    pub start: Option<String>,
    /// The token to pass as `from` to get the next page.
    pub end: Option<String>,
    /// The events of the page, in `dir` order.
    pub chunk: Vec<RoomEvent>,
    /// State events relevant to the chunk.
    pub state: Vec<RoomEvent>,
}

fn events_of(json: &JsonValue, field: &str) -> Vec<RoomEvent> {
    json.get(field)
        .and_then(JsonValue::as_array)
        .map(|events| events.iter().map(RoomEvent::from_json).collect())
        .unwrap_or_default()
}

impl Request for GetMessages {
    type Response = MessagesResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/messages",
            BASE_PATH,
            encode(self.room_id.as_str())
        )
    }

    fn query(&self) -> Vec<(String, String)> {
        let mut query = vec![
            ("from".to_owned(), self.from.clone()),
            ("dir".to_owned(), self.dir.as_str().to_owned()),
        ];
        if let Some(to) = &self.to {
            query.push(("to".to_owned(), to.clone()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit".to_owned(), limit.to_string()));
        }
        query
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        let json: JsonValue = json_response(&response)?;
        Ok(MessagesResponse {
            start: json
                .get("start")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
            end: json
                .get("end")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
            chunk: events_of(&json, "chunk"),
            state: events_of(&json, "state"),
        })
    }
}

/// `GET /rooms/{roomId}/members`.
#[derive(Clone, Debug)]
pub struct GetMembers {
    /// The room to fetch the member list of.
    pub room_id: RoomId,
}

/// The full member list of a room.
#[derive(Clone, Debug)]
pub struct MembersResponse {
    /// The `m.room.member` state events.
    pub chunk: Vec<RoomEvent>,
}

impl Request for GetMembers {
    type Response = MembersResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/members",
            BASE_PATH,
            encode(self.room_id.as_str())
        )
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        let json: JsonValue = json_response(&response)?;
        Ok(MembersResponse {
            chunk: events_of(&json, "chunk"),
        })
    }
}

/// `GET /rooms/{roomId}/context/{eventId}`.
#[derive(Clone, Debug)]
pub struct GetEventContext {
    /// The room the event is in.
    pub room_id: RoomId,
    /// The event to fetch the context around.
    pub event_id: EventId,
    /// The maximum number of events to return on either side.
    pub limit: Option<u32>,
}

/// Events around a given event.
#[derive(Clone, Debug)]
pub struct ContextResponse {
    /// Token for paginating backwards from here.
    pub start: Option<String>,
    /// Token for paginating forwards from here.
    pub end: Option<String>,
    /// Events before the requested one, newest first.
    pub events_before: Vec<RoomEvent>,
    /// The requested event itself.
    pub event: Option<RoomEvent>,
    /// Events after the requested one, oldest first.
    pub events_after: Vec<RoomEvent>,
    /// The room state at the last returned event.
    pub state: Vec<RoomEvent>,
}

impl Request for GetEventContext {
    type Response = ContextResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "{}/rooms/{}/context/{}",
            BASE_PATH,
            encode(self.room_id.as_str()),
            encode(self.event_id.as_str())
        )
    }

    fn query(&self) -> Vec<(String, String)> {
        self.limit
            .map(|l| vec![("limit".to_owned(), l.to_string())])
            .unwrap_or_default()
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        let json: JsonValue = json_response(&response)?;
        Ok(ContextResponse {
            start: json
                .get("start")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
            end: json
                .get("end")
                .and_then(JsonValue::as_str)
                .map(ToOwned::to_owned),
            events_before: events_of(&json, "events_before"),
            event: json.get("event").map(RoomEvent::from_json),
            events_after: events_of(&json, "events_after"),
            state: events_of(&json, "state"),
        })
    }
}

/// Whether a created room is published in the room directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomVisibility {
    /// Published in the directory.
    Public,
    /// Not published.
    Private,
}

/// The server-side preset applied to a created room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomPreset {
    /// Joining requires an invite.
    PrivateChat,
    /// Like `PrivateChat`, but invitees get the creator's power level.
    TrustedPrivateChat,
    /// Anyone can join.
    PublicChat,
}

impl RoomPreset {
    fn as_str(self) -> &'static str {
        match self {
            RoomPreset::PrivateChat => "private_chat",
            RoomPreset::TrustedPrivateChat => "trusted_private_chat",
            RoomPreset::PublicChat => "public_chat",
        }
    }
}

/// `POST /createRoom`.
#[derive(Clone, Debug)]
pub struct CreateRoom {
    /// Directory visibility of the new room.
    pub visibility: RoomVisibility,
    /// The localpart of a canonical alias to claim.
    pub alias: Option<String>,
    /// The room name.
    pub name: Option<String>,
    /// The room topic.
    pub topic: Option<String>,
    /// Users to invite.
    pub invites: Vec<UserId>,
    /// The preset to base the room's state on.
    pub preset: Option<RoomPreset>,
    /// Marks the room as a direct chat with the invitees.
    pub is_direct: bool,
    /// Extra state events to apply at creation.
    pub initial_state: Vec<JsonValue>,
    /// Extra keys for the `m.room.create` content.
    pub creation_content: Option<JsonValue>,
}

impl CreateRoom {
    /// A private, trusted direct chat with one user.
    pub fn direct_chat(invite: UserId) -> Self {
        Self {
            visibility: RoomVisibility::Private,
            alias: None,
            name: None,
            topic: None,
            invites: vec![invite],
            preset: Some(RoomPreset::TrustedPrivateChat),
            is_direct: true,
            initial_state: Vec::new(),
            creation_content: None,
        }
    }
}

/// The response to a room creation.
#[derive(Clone, Debug, Deserialize)]
pub struct CreateRoomResponse {
    /// The id of the new room.
    pub room_id: RoomId,
}

impl Request for CreateRoom {
    type Response = CreateRoomResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/createRoom", BASE_PATH)
    }

    fn body(&self) -> Body {
        let mut body = json!({
            "visibility": match self.visibility {
                RoomVisibility::Public => "public",
                RoomVisibility::Private => "private",
            },
            "is_direct": self.is_direct,
            "invite": self.invites,
        });
        if let Some(alias) = &self.alias {
            body["room_alias_name"] = json!(alias);
        }
        if let Some(name) = &self.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &self.topic {
            body["topic"] = json!(topic);
        }
        if let Some(preset) = self.preset {
            body["preset"] = json!(preset.as_str());
        }
        if !self.initial_state.is_empty() {
            body["initial_state"] = json!(self.initial_state);
        }
        if let Some(creation_content) = &self.creation_content {
            body["creation_content"] = creation_content.clone();
        }
        Body::Json(body)
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// `POST /_matrix/media/r0/upload`.
#[derive(Clone, Debug)]
pub struct UploadContent {
    /// The bytes to upload.
    pub data: Vec<u8>,
    /// The content type of the payload.
    pub content_type: String,
    /// An optional file name stored with the media.
    pub filename: Option<String>,
}

/// The response to a media upload.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadContentResponse {
    /// The `mxc://` URI of the uploaded content.
    pub content_uri: String,
}

impl Request for UploadContent {
    type Response = UploadContentResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/upload", MEDIA_BASE_PATH)
    }

    fn query(&self) -> Vec<(String, String)> {
        self.filename
            .as_ref()
            .map(|f| vec![("filename".to_owned(), f.clone())])
            .unwrap_or_default()
    }

    fn body(&self) -> Body {
        Body::Raw {
            content_type: self.content_type.clone(),
            data: self.data.clone(),
        }
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// A downloaded piece of media.
#[derive(Clone, Debug)]
pub struct MediaContent {
    /// The content type the server reported.
    pub content_type: Option<String>,
    /// The raw bytes.
    pub data: Vec<u8>,
}

fn media_response(response: http::Response<Vec<u8>>) -> Result<MediaContent, JobError> {
    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned);
    Ok(MediaContent {
        content_type,
        data: response.into_body(),
    })
}

/// `GET /_matrix/media/r0/download/{serverName}/{mediaId}`.
#[derive(Clone, Debug)]
pub struct GetContent {
    /// The server part of the `mxc://` URI.
    pub server_name: String,
    /// The media id part of the `mxc://` URI.
    pub media_id: String,
}

impl Request for GetContent {
    type Response = MediaContent;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "{}/download/{}/{}",
            MEDIA_BASE_PATH,
            encode(&self.server_name),
            encode(&self.media_id)
        )
    }

    fn needs_token(&self) -> bool {
        false
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        media_response(response)
    }
}

/// `GET /_matrix/media/r0/thumbnail/{serverName}/{mediaId}`.
#[derive(Clone, Debug)]
pub struct GetThumbnail {
    /// The server part of the `mxc://` URI.
    pub server_name: String,
    /// The media id part of the `mxc://` URI.
    pub media_id: String,
    /// The desired width in pixels.
    pub width: u32,
    /// The desired height in pixels.
    pub height: u32,
}

impl Request for GetThumbnail {
    type Response = MediaContent;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        format!(
            "{}/thumbnail/{}/{}",
            MEDIA_BASE_PATH,
            encode(&self.server_name),
            encode(&self.media_id)
        )
    }

    fn query(&self) -> Vec<(String, String)> {
        vec![
            ("width".to_owned(), self.width.to_string()),
            ("height".to_owned(), self.height.to_string()),
            ("method".to_owned(), "scale".to_owned()),
        ]
    }

    fn needs_token(&self) -> bool {
        false
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        media_response(response)
    }
}

/// `POST /keys/upload`, the device-key upload interface point for an
/// encryption layer living outside this crate.
#[derive(Clone, Debug)]
pub struct UploadKeys {
    /// The signed device keys object, if any.
    pub device_keys: Option<JsonValue>,
    /// One-time keys to add to the server-side pool, if any.
    pub one_time_keys: Option<JsonValue>,
}

/// The response to a key upload.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadKeysResponse {
    /// How many one-time keys the server now holds, per algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl Request for UploadKeys {
    type Response = UploadKeysResponse;

    fn method(&self) -> Method {
        Method::POST
    }

    fn path(&self) -> String {
        format!("{}/keys/upload", BASE_PATH)
    }

    fn body(&self) -> Body {
        let mut body = json!({});
        if let Some(device_keys) = &self.device_keys {
            body["device_keys"] = device_keys.clone();
        }
        if let Some(one_time_keys) = &self.one_time_keys {
            body["one_time_keys"] = one_time_keys.clone();
        }
        Body::Json(body)
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}

/// `PUT /sendToDevice/{eventType}/{txnId}`.
#[derive(Clone, Debug)]
pub struct SendToDevice {
    /// The type of the events being sent.
    pub event_type: String,
    /// The client-generated transaction id.
    pub txn_id: String,
    /// Event contents, keyed by user and then by device id (`*` for all
    /// devices of a user).
    pub messages: BTreeMap<UserId, BTreeMap<String, JsonValue>>,
}

impl Request for SendToDevice {
    type Response = ();

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "{}/sendToDevice/{}/{}",
            BASE_PATH,
            encode(&self.event_type),
            encode(&self.txn_id)
        )
    }

    fn body(&self) -> Body {
        Body::Json(json!({ "messages": self.messages }))
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// `PUT /user/{userId}/account_data/{type}`.
#[derive(Clone, Debug)]
pub struct SetAccountData {
    /// The user whose account data to set; must be the logged-in user.
    pub user_id: UserId,
    /// The event type of the account data.
    pub event_type: String,
    /// The new content.
    pub content: JsonValue,
}

impl Request for SetAccountData {
    type Response = ();

    fn method(&self) -> Method {
        Method::PUT
    }

    fn path(&self) -> String {
        format!(
            "{}/user/{}/account_data/{}",
            BASE_PATH,
            encode(self.user_id.as_str()),
            encode(&self.event_type)
        )
    }

    fn body(&self) -> Body {
        Body::Json(self.content.clone())
    }

    fn parse_response(&self, response: http::Response<Vec<u8>>) -> Result<(), JobError> {
        expect_empty(&response)
    }
}

/// `GET /.well-known/matrix/client`, issued against a plain domain when
/// resolving a homeserver from an MXID.
#[derive(Clone, Debug)]
pub struct GetWellKnown;

/// The interesting part of a well-known document.
#[derive(Clone, Debug)]
pub struct WellKnownResponse {
    /// The advertised homeserver base URL.
    pub homeserver_base_url: String,
}

impl Request for GetWellKnown {
    type Response = WellKnownResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/.well-known/matrix/client".to_owned()
    }

    fn needs_token(&self) -> bool {
        false
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        let json: JsonValue = json_response(&response)?;
        json.get("m.homeserver")
            .and_then(|hs| hs.get("base_url"))
            .and_then(JsonValue::as_str)
            .map(|base_url| WellKnownResponse {
                homeserver_base_url: base_url.to_owned(),
            })
            .ok_or_else(|| {
                JobError::incorrect_response("well-known document has no m.homeserver.base_url")
            })
    }
}

/// `GET /_matrix/client/versions`, used to validate a resolved homeserver.
#[derive(Clone, Debug)]
pub struct GetVersions;

/// The versions a server supports.
#[derive(Clone, Debug, Deserialize)]
pub struct VersionsResponse {
    /// The supported client-server API versions.
    pub versions: Vec<String>,
}

impl Request for GetVersions {
    type Response = VersionsResponse;

    fn method(&self) -> Method {
        Method::GET
    }

    fn path(&self) -> String {
        "/_matrix/client/versions".to_owned()
    }

    fn needs_token(&self) -> bool {
        false
    }

    fn parse_response(
        &self,
        response: http::Response<Vec<u8>>,
    ) -> Result<Self::Response, JobError> {
        json_response(&response)
    }
}
