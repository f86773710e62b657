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

//! Synchronous signal subscriptions.
//!
//! Every emitter (connection, room, job) owns a [`SignalHub`] and delivers
//! its signals synchronously, in the order their causes were applied.
//! Handlers run on the emitting task and must not call back into the
//! emitter.

use std::sync::Mutex;

/// The handle returned by a subscription, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Implemented by signal enums so subscriptions can filter on a kind.
pub trait Signal {
    /// The payload-free discriminant of the signal enum.
    type Kind: Copy + PartialEq + Send;

    /// The kind of this signal instance.
    fn kind(&self) -> Self::Kind;
}

type Handler<T> = Box<dyn FnMut(&T) + Send>;

struct Slot<T: Signal> {
    id: SubscriptionId,
    kind: Option<T::Kind>,
    once: bool,
    handler: Handler<T>,
}

struct Inner<T: Signal> {
    next_id: u64,
    slots: Vec<Slot<T>>,
    // Ids unsubscribed while their slot was checked out by emit().
    dead: Vec<SubscriptionId>,
}

/// A set of subscriptions to one emitter's signals.
pub struct SignalHub<T: Signal> {
    inner: Mutex<Inner<T>>,
}

impl<T: Signal> Default for SignalHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Signal> std::fmt::Debug for SignalHub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalHub").finish()
    }
}

impl<T: Signal> SignalHub<T> {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                slots: Vec::new(),
                dead: Vec::new(),
            }),
        }
    }

    fn add(&self, kind: Option<T::Kind>, once: bool, handler: Handler<T>) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.slots.push(Slot {
            id,
            kind,
            once,
            handler,
        });
        id
    }

    /// Subscribe to signals of the given kind.
    pub fn subscribe(
        &self,
        kind: T::Kind,
        handler: impl FnMut(&T) + Send + 'static,
    ) -> SubscriptionId {
        self.add(Some(kind), false, Box::new(handler))
    }

    /// Subscribe to every signal this hub emits.
    pub fn subscribe_all(&self, handler: impl FnMut(&T) + Send + 'static) -> SubscriptionId {
        self.add(None, false, Box::new(handler))
    }

    /// Subscribe to the next signal of the given kind; the subscription
    /// removes itself after the first invocation.
    pub fn subscribe_once(
        &self,
        kind: T::Kind,
        handler: impl FnMut(&T) + Send + 'static,
    ) -> SubscriptionId {
        self.add(Some(kind), true, Box::new(handler))
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots.retain(|s| s.id != id);
        inner.dead.push(id);
    }

    /// Deliver `signal` to every matching subscription, in subscription
    /// order. Handlers may subscribe and unsubscribe other handlers; a
    /// subscription made during delivery first fires on the next signal.
    pub(crate) fn emit(&self, signal: &T) {
        // Slots are taken out of the lock while handlers run so that
        // handlers can touch the hub without deadlocking.
        let mut slots = std::mem::take(&mut self.inner.lock().unwrap().slots);
        let kind = signal.kind();

        for slot in &mut slots {
            if slot.kind.map_or(true, |k| k == kind) {
                (slot.handler)(signal);
                if slot.once {
                    slot.kind = None;
                    slot.once = false;
                    // Marked dead; dropped below.
                    slot.id = SubscriptionId(u64::MAX);
                }
            }
        }

        slots.retain(|s| s.id != SubscriptionId(u64::MAX));

        let mut inner = self.inner.lock().unwrap();
        // Keep handlers registered during the emission, minus the ones
        // unsubscribed during it.
        let dead = std::mem::take(&mut inner.dead);
        slots.retain(|s| !dead.contains(&s.id));
        let added = std::mem::replace(&mut inner.slots, slots);
        inner.slots.extend(added);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Ping {
        One(u32),
        Two,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum PingKind {
        One,
        Two,
    }

    impl Signal for Ping {
        type Kind = PingKind;

        fn kind(&self) -> PingKind {
            match self {
                Ping::One(_) => PingKind::One,
                Ping::Two => PingKind::Two,
            }
        }
    }

    #[test]
    fn kinds_are_filtered() {
        let hub = SignalHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        hub.subscribe(PingKind::One, move |s| {
            if let Ping::One(n) = s {
                seen2.lock().unwrap().push(*n);
            }
        });

        hub.emit(&Ping::One(1));
        hub.emit(&Ping::Two);
        hub.emit(&Ping::One(2));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn once_fires_once() {
        let hub = SignalHub::new();
        let count = Arc::new(Mutex::new(0));

        let count2 = count.clone();
        hub.subscribe_once(PingKind::Two, move |_| *count2.lock().unwrap() += 1);

        hub.emit(&Ping::One(0));
        hub.emit(&Ping::Two);
        hub.emit(&Ping::Two);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = SignalHub::new();
        let count = Arc::new(Mutex::new(0));

        let count2 = count.clone();
        let token = hub.subscribe_all(move |_| *count2.lock().unwrap() += 1);

        hub.emit(&Ping::Two);
        hub.unsubscribe(token);
        hub.emit(&Ping::Two);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn subscription_during_emit_sees_next_signal() {
        let hub = Arc::new(SignalHub::new());
        let count = Arc::new(Mutex::new(0));

        let hub2 = hub.clone();
        let count2 = count.clone();
        hub.subscribe_once(PingKind::Two, move |_| {
            let count3 = count2.clone();
            hub2.subscribe_all(move |_| *count3.lock().unwrap() += 1);
        });

        hub.emit(&Ping::Two); // registers the inner handler, delivers nothing to it
        assert_eq!(*count.lock().unwrap(), 0);
        hub.emit(&Ping::Two);
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
