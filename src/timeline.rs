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

//! The ordered, gap-aware timeline buffer of a room.
//!
//! Every event gets a stable integer index when it is inserted. Indices do
//! not restart: prepending history decrements from the current minimum,
//! appending decrements from the current maximum, and an index stays valid
//! for the lifetime of the room. The index sequence is contiguous.

use std::collections::{HashMap, VecDeque};

use crate::{events::RoomEvent, identifiers::EventId};

/// A timeline event paired with its stable index.
#[derive(Clone, Debug, PartialEq)]
pub struct TimelineItem {
    /// The stable timeline index; the authoritative cursor for this room.
    pub index: i64,
    /// The event itself.
    pub event: RoomEvent,
}

/// The ordered buffer of a room's timeline events.
///
/// Stored as a deque plus a base offset: the stable index of the item at
/// deque position `p` is `base_index + p`. The buffer never evicts.
#[derive(Debug, Default)]
pub struct Timeline {
    items: VecDeque<RoomEvent>,
    base_index: i64,
    // Event id to stable index.
    index_of: HashMap<EventId, i64>,
}

impl Timeline {
    /// Create an empty timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of events in the buffer.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the buffer holds no events.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The lowest stable index, if the timeline is non-empty.
    pub fn min_index(&self) -> Option<i64> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.base_index)
        }
    }

    /// The highest stable index, if the timeline is non-empty.
    pub fn max_index(&self) -> Option<i64> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.base_index + self.items.len() as i64 - 1)
        }
    }

    /// The sentinel index one past the oldest event; the natural end value
    /// for reverse iteration.
    pub fn timeline_edge(&self) -> i64 {
        self.min_index().unwrap_or(0) - 1
    }

    /// Append a batch of new events, assigning indices `max+1..=max+n`.
    ///
    /// An event whose id is already present is not appended again: if its
    /// fields differ from the stored copy the stored copy is updated in
    /// place, and either way it keeps the index assigned on first insertion.
    /// Returns the events that were actually appended.
    pub fn append_new(&mut self, events: Vec<RoomEvent>) -> Vec<RoomEvent> {
        let mut added = Vec::new();

        for event in events {
            if let Some(index) = self.index_of_event(&event) {
                self.update_in_place(index, event);
                continue;
            }

            let index = self.max_index().map_or(0, |max| max + 1);
            if self.items.is_empty() {
                self.base_index = index;
            }
            if let Some(id) = &event.event_id {
                self.index_of.insert(id.clone(), index);
            }
            self.items.push_back(event.clone());
            added.push(event);
        }

        added
    }

    /// Prepend a batch of historical events, assigning indices
    /// `min-n..=min-1` so that the oldest event of the batch ends up with
    /// the lowest index.
    ///
    /// The batch is expected in reverse-chronological order, as returned by
    /// the `/messages` endpoint with `dir=b`. Duplicates are dropped, not
    /// renumbered. Returns the events that were actually prepended, oldest
    /// first.
    pub fn prepend_historical(&mut self, events: Vec<RoomEvent>) -> Vec<RoomEvent> {
        let mut added = VecDeque::new();

        for event in events {
            if let Some(index) = self.index_of_event(&event) {
                self.update_in_place(index, event);
                continue;
            }

            let index = self.min_index().map_or(0, |min| min - 1);
            self.base_index = index;
            if let Some(id) = &event.event_id {
                self.index_of.insert(id.clone(), index);
            }
            self.items.push_front(event.clone());
            added.push_front(event);
        }

        added.into()
    }

    fn index_of_event(&self, event: &RoomEvent) -> Option<i64> {
        event
            .event_id
            .as_ref()
            .and_then(|id| self.index_of.get(id))
            .copied()
    }

    fn update_in_place(&mut self, index: i64, event: RoomEvent) {
        let pos = (index - self.base_index) as usize;
        if self.items[pos] != event {
            self.items[pos] = event;
        }
    }

    /// The item at the given stable index, as an owned `(index, event)`
    /// pair.
    pub fn item(&self, index: i64) -> Option<TimelineItem> {
        self.find_by_index(index).map(|event| TimelineItem {
            index,
            event: event.clone(),
        })
    }

    /// Find an event by its stable index.
    pub fn find_by_index(&self, index: i64) -> Option<&RoomEvent> {
        if index < self.base_index {
            return None;
        }
        self.items.get((index - self.base_index) as usize)
    }

    /// A mutable reference to the event at the given stable index.
    pub(crate) fn find_by_index_mut(&mut self, index: i64) -> Option<&mut RoomEvent> {
        if index < self.base_index {
            return None;
        }
        self.items.get_mut((index - self.base_index) as usize)
    }

    /// Find an event's stable index by its id.
    pub fn index_of_id(&self, event_id: &EventId) -> Option<i64> {
        self.index_of.get(event_id).copied()
    }

    /// Find an event by its id.
    pub fn find_by_id(&self, event_id: &EventId) -> Option<&RoomEvent> {
        self.index_of_id(event_id)
            .and_then(|index| self.find_by_index(index))
    }

    /// Iterate over `(index, event)` pairs in chronological order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (i64, &RoomEvent)> {
        let base = self.base_index;
        self.items
            .iter()
            .enumerate()
            .map(move |(pos, event)| (base + pos as i64, event))
    }

    /// Iterate from the newest event backwards; the canonical cursor for
    /// read-marker computations.
    pub fn iter_reverse(&self) -> impl Iterator<Item = (i64, &RoomEvent)> {
        self.iter().rev()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use serde_json::json;

    use super::*;
    use crate::identifiers::EventId;

    fn event(id: &str, body: &str) -> RoomEvent {
        RoomEvent::from_json(&json!({
            "type": "m.room.message",
            "event_id": id,
            "sender": "@example:localhost",
            "origin_server_ts": 1,
            "content": { "msgtype": "m.text", "body": body }
        }))
    }

    #[test]
    fn append_assigns_contiguous_indices() {
        let mut timeline = Timeline::new();
        let added = timeline.append_new(vec![event("$a", "1"), event("$b", "2")]);

        assert_eq!(added.len(), 2);
        assert_eq!(timeline.min_index(), Some(0));
        assert_eq!(timeline.max_index(), Some(1));

        timeline.append_new(vec![event("$c", "3")]);
        assert_eq!(timeline.max_index(), Some(2));

        let indices: Vec<i64> = timeline.iter().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn prepend_counts_down_with_oldest_lowest() {
        let mut timeline = Timeline::new();
        timeline.append_new(vec![event("$c", "3")]);

        // /messages returns newest-first when paginating backwards.
        timeline.prepend_historical(vec![event("$b", "2"), event("$a", "1")]);

        assert_eq!(timeline.min_index(), Some(-2));
        assert_eq!(timeline.max_index(), Some(0));
        assert_eq!(timeline.timeline_edge(), -3);

        let bodies: Vec<&str> = timeline
            .iter()
            .map(|(_, e)| match &e.content {
                crate::events::AnyEventContent::RoomMessage(m) => m.body.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(bodies, vec!["1", "2", "3"]);
    }

    #[test]
    fn duplicates_are_dropped_and_keep_their_index() {
        let mut timeline = Timeline::new();
        timeline.append_new(vec![event("$a", "1"), event("$b", "2")]);

        let added = timeline.append_new(vec![event("$a", "1"), event("$c", "3")]);
        assert_eq!(added.len(), 1);
        assert_eq!(timeline.len(), 3);

        let id = EventId::try_from("$a").unwrap();
        assert_eq!(timeline.index_of_id(&id), Some(0));
    }

    #[test]
    fn duplicate_with_differing_fields_updates_in_place() {
        let mut timeline = Timeline::new();
        timeline.append_new(vec![event("$a", "before")]);
        timeline.append_new(vec![event("$a", "after")]);

        assert_eq!(timeline.len(), 1);
        let id = EventId::try_from("$a").unwrap();
        let stored = timeline.find_by_id(&id).unwrap();
        match &stored.content {
            crate::events::AnyEventContent::RoomMessage(m) => assert_eq!(m.body, "after"),
            _ => unreachable!(),
        }
        assert_eq!(timeline.index_of_id(&id), Some(0));
    }

    #[test]
    fn id_and_index_maps_are_consistent() {
        let mut timeline = Timeline::new();
        timeline.append_new(vec![event("$a", "1"), event("$b", "2")]);
        timeline.prepend_historical(vec![event("$z", "0")]);

        for (index, e) in timeline.iter() {
            let id = e.event_id.as_ref().unwrap();
            assert_eq!(timeline.index_of_id(id), Some(index));
            assert_eq!(timeline.find_by_index(index).unwrap(), e);
        }
    }

    #[test]
    fn reverse_iteration_starts_at_newest() {
        let mut timeline = Timeline::new();
        timeline.append_new(vec![event("$a", "1"), event("$b", "2")]);

        let first = timeline.iter_reverse().next().unwrap();
        assert_eq!(first.0, 1);
    }
}
