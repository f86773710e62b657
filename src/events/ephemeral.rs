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

//! Ephemeral event contents: typing notifications and read receipts.
//! These are applied to room state but never stored in a timeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identifiers::{EventId, UserId};

/// The content of an `m.typing` event; the full set of users currently
/// typing in a room.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypingEventContent {
    /// The users that are currently typing.
    pub user_ids: Vec<UserId>,
}

/// One `m.read` marker: who read up to an event, and when.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// The (server-side) timestamp of the receipt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// The per-event receipt map: receipt type to user to receipt data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Receipts {
    /// Read-up-to-here markers, keyed by the user that read.
    #[serde(rename = "m.read", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read: BTreeMap<UserId, Receipt>,
}

/// The content of an `m.receipt` event: for each event id, the set of
/// `(user, timestamp)` pairs that have read up to it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptEventContent(
    /// The receipts of the batch, per event.
    pub BTreeMap<EventId, Receipts>,
);

impl ReceiptEventContent {
    /// Iterate over `(event id, user id, receipt)` triples of the `m.read`
    /// receipts in this event.
    pub fn read_receipts(&self) -> impl Iterator<Item = (&EventId, &UserId, &Receipt)> {
        self.0.iter().flat_map(|(event_id, receipts)| {
            receipts
                .read
                .iter()
                .map(move |(user_id, receipt)| (event_id, user_id, receipt))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn parse_receipt_content() {
        let json = serde_json::json!({
            "$152037280074GZeOm:localhost": {
                "m.read": {
                    "@example:localhost": { "ts": 1520372804619u64 }
                }
            }
        });

        let content: ReceiptEventContent = serde_json::from_value(json).unwrap();
        let (event_id, user_id, receipt) = content.read_receipts().next().unwrap();

        assert_eq!(
            *event_id,
            EventId::try_from("$152037280074GZeOm:localhost").unwrap()
        );
        assert_eq!(*user_id, UserId::try_from("@example:localhost").unwrap());
        assert_eq!(receipt.ts, Some(1_520_372_804_619));
    }

    #[test]
    fn parse_typing_content() {
        let json = serde_json::json!({ "user_ids": ["@alice:matrix.org"] });
        let content: TypingEventContent = serde_json::from_value(json).unwrap();
        assert_eq!(content.user_ids.len(), 1);
    }
}
