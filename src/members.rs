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

//! Users and room members.

use std::{
    cmp::Ordering,
    sync::{Arc, RwLock},
};

use crate::{
    events::{MemberEventContent, MembershipState},
    identifiers::UserId,
};

/// A user known to the connection.
///
/// Users are created on first sighting and owned by the connection for its
/// whole lifetime; rooms only borrow them.
#[derive(Debug)]
pub struct User {
    user_id: UserId,
    display_name: RwLock<Option<String>>,
}

impl User {
    /// Create a user entry for the given id.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            display_name: RwLock::new(None),
        }
    }

    /// The MXID of the user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The last display name seen for this user, across rooms.
    pub fn display_name(&self) -> Option<String> {
        self.display_name.read().unwrap().clone()
    }

    pub(crate) fn set_display_name(&self, name: Option<String>) {
        *self.display_name.write().unwrap() = name;
    }
}

/// A member of a specific room.
///
/// Holds the per-room profile from the member's `m.room.member` state
/// event; the [`User`] pointer is borrowed from the connection's registry.
#[derive(Clone, Debug)]
pub struct RoomMember {
    /// The user entry from the connection's registry.
    pub user: Arc<User>,
    /// The display name the member uses in this room.
    pub display_name: Option<String>,
    /// The `mxc://` avatar URL of the member.
    pub avatar_url: Option<String>,
    /// The membership state of this member.
    pub membership: MembershipState,
}

impl RoomMember {
    /// Build a member from the user registry entry and a member event
    /// content.
    pub fn new(user: Arc<User>, content: &MemberEventContent) -> Self {
        Self {
            user,
            display_name: content.displayname.clone(),
            avatar_url: content.avatar_url.clone(),
            membership: content.membership,
        }
    }

    /// The MXID of the member.
    pub fn user_id(&self) -> &UserId {
        self.user.user_id()
    }

    /// The name to show for this member: the display name if one is set,
    /// the localpart of the MXID otherwise.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.user_id().localpart().to_owned())
    }

    /// The name joined with the MXID, used when the plain name is
    /// ambiguous within a room.
    pub fn unique_name(&self) -> String {
        format!("{} ({})", self.name(), self.user_id())
    }
}

/// Order two members for display: by lowercased display name, ties broken
/// by MXID. Returns whether `a` precedes `b`.
pub fn member_sorter(a: &RoomMember, b: &RoomMember) -> bool {
    member_ordering(a, b) == Ordering::Less
}

pub(crate) fn member_ordering(a: &RoomMember, b: &RoomMember) -> Ordering {
    let name_a = a.name().to_lowercase();
    let name_b = b.name().to_lowercase();

    name_a
        .cmp(&name_b)
        .then_with(|| a.user_id().cmp(b.user_id()))
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    fn member(id: &str, name: Option<&str>) -> RoomMember {
        let user = Arc::new(User::new(UserId::try_from(id).unwrap()));
        RoomMember {
            user,
            display_name: name.map(ToOwned::to_owned),
            avatar_url: None,
            membership: MembershipState::Join,
        }
    }

    #[test]
    fn name_falls_back_to_localpart() {
        let m = member("@example:localhost", None);
        assert_eq!(m.name(), "example");
        assert_eq!(m.unique_name(), "example (@example:localhost)");
    }

    #[test]
    fn sorter_is_case_insensitive_with_mxid_tiebreak() {
        let a = member("@a:server", Some("carol"));
        let b = member("@b:server", Some("Dave"));
        assert!(member_sorter(&a, &b));

        // Same name, ordered by MXID.
        let sam1 = member("@sam1:server", Some("Sam"));
        let sam2 = member("@sam2:server", Some("Sam"));
        assert!(member_sorter(&sam1, &sam2));
        assert!(!member_sorter(&sam2, &sam1));
    }
}
