//! The login session of a connection.

use serde::{Deserialize, Serialize};

use crate::identifiers::UserId;

/// What a successful login yields: who we are, which device this is, and
/// the bearer token that authenticates every request.
///
/// Applications may persist a session and feed it back into
/// [`Connection::connect_with_token`](crate::Connection::connect_with_token)
/// to skip the password login on the next run.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The MXID the homeserver knows this account as.
    pub user_id: UserId,
    /// The id of the device the session was created for.
    pub device_id: String,
    /// The opaque bearer token attached to authenticated requests.
    pub access_token: String,
}
