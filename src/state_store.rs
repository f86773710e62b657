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

//! The on-disk state cache.
//!
//! One versioned JSON document per account, holding room state (never
//! timelines), the account-data overlays and the last sync token. A cache
//! file with an unknown major version is refused wholesale rather than
//! partially applied.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

use crate::{
    error::Result,
    identifiers::{RoomId, UserId},
    room::JoinState,
};

/// The schema version this build writes and accepts.
pub const CACHE_VERSION: CacheVersion = CacheVersion { major: 1, minor: 0 };

/// The version stamp of a cache document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheVersion {
    /// Incompatible schema changes bump this; a mismatch refuses the load.
    pub major: u32,
    /// Compatible additions bump this.
    pub minor: u32,
}

/// The cached snapshot of one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedRoom {
    /// The room id.
    pub room_id: RoomId,
    /// The join state the room was in when saved.
    pub join_state: JoinState,
    /// The current state events, in wire form.
    pub state: Vec<JsonValue>,
    /// The room account data events, in wire form.
    pub account_data: Vec<JsonValue>,
}

/// The cached snapshot of a whole connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedState {
    /// The schema version of this document.
    pub cache_version: CacheVersion,
    /// The sync token the next sync resumes from.
    pub next_batch: Option<String>,
    /// The direct-chats overlay.
    pub direct_chats: BTreeMap<UserId, BTreeSet<RoomId>>,
    /// The ignored-users overlay.
    pub ignored_users: BTreeSet<UserId>,
    /// Global account data events, in wire form.
    pub account_data: Vec<JsonValue>,
    /// All rooms, across join states.
    pub rooms: Vec<CachedRoom>,
}

/// Write the snapshot to `path`, going through an adjacent temporary file
/// and an atomic rename so that a crash never leaves a torn cache.
pub(crate) async fn save(path: &Path, state: &CachedState) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    let json = serde_json::to_string(state)?;

    let tmp_path = path.with_extension("tmp");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .await?;
    file.write_all(json.as_bytes()).await?;
    file.flush().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Load a snapshot from `path`.
///
/// Returns `None`, without failing the caller, when the file is missing,
/// unparsable, or stamped with an unknown major version.
pub(crate) async fn load(path: &Path) -> Result<Option<CachedState>> {
    let json = match fs::read_to_string(path).await {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let state: CachedState = match serde_json::from_str(&json) {
        Ok(state) => state,
        Err(e) => {
            warn!("state cache in {:?} is broken, discarding: {}", path, e);
            return Ok(None);
        }
    };

    if state.cache_version.major != CACHE_VERSION.major {
        warn!(
            "state cache major version is {} but {} is required, discarding",
            state.cache_version.major, CACHE_VERSION.major
        );
        return Ok(None);
    }

    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn snapshot() -> CachedState {
        let user = UserId::try_from("@example:localhost").unwrap();
        let room = RoomId::try_from("!test:localhost").unwrap();

        let mut direct_chats = BTreeMap::new();
        let mut rooms_of_user = BTreeSet::new();
        rooms_of_user.insert(room.clone());
        direct_chats.insert(user.clone(), rooms_of_user);

        CachedState {
            cache_version: CACHE_VERSION,
            next_batch: Some("s526_47314".to_owned()),
            direct_chats,
            ignored_users: BTreeSet::new(),
            account_data: vec![],
            rooms: vec![CachedRoom {
                room_id: room,
                join_state: JoinState::Join,
                state: vec![json!({
                    "type": "m.room.name",
                    "state_key": "",
                    "event_id": "$1:localhost",
                    "sender": "@example:localhost",
                    "content": { "name": "room name" }
                })],
                account_data: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("@example_localhost_state.json");

        save(&path, &snapshot()).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();

        assert_eq!(loaded.next_batch.as_deref(), Some("s526_47314"));
        assert_eq!(loaded.rooms.len(), 1);
        assert_eq!(loaded.rooms[0].join_state, JoinState::Join);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let loaded = load(&dir.path().join("nope.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn unknown_major_version_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = snapshot();
        state.cache_version = CacheVersion { major: 99, minor: 0 };
        save(&path, &state).await.unwrap();

        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_json_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{ not json").await.unwrap();

        assert!(load(&path).await.unwrap().is_none());
    }
}
