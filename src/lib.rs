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

//! This crate implements the client runtime of the
//! [Matrix](https://matrix.org/) protocol: a connection to one homeserver
//! that maintains a coherent local view of the user's rooms and timelines,
//! synchronized through the long-polling `/sync` endpoint.
//!
//! The entry point is [`Connection`]: log in with
//! [`connect_to_server`](Connection::connect_to_server) or
//! [`connect_with_token`](Connection::connect_with_token), subscribe to its
//! [signals](Connection::signals), and read rooms as sync batches arrive.
//! Everything that touches the network is a [`job::Job`]; the convenience
//! methods on [`Connection`] and [`Room`] are thin wrappers around starting
//! and observing jobs.
//!
//! # Enabling logging
//!
//! This crate logs through `tracing`. Applications can enable log output by
//! depending on the `tracing-subscriber` crate and including the following
//! line in their application (e.g. at the start of `main`):
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//! ```
//!
//! The log output is controlled via the `RUST_LOG` environment variable by
//! setting it to one of the `error`, `warn`, `info`, `debug` or `trace`
//! levels.

#![deny(
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod http_send;
pub mod identifiers;
pub mod job;
pub mod members;
pub mod room;
pub mod session;
pub mod signals;
pub mod state_store;
pub mod sync;
pub mod timeline;

#[cfg(test)]
pub(crate) mod test_json;

pub use config::{ClientConfig, SyncSettings};
pub use connection::{
    Connection, ConnectionHandle, ConnectionSignal, ConnectionSignalKind, ConnectionState,
    RoomFactory, UserFactory,
};
pub use error::{Error, Result};
pub use http_send::{DefaultTransport, HttpSend, RequestPriority, TransportError};
pub use identifiers::{EventId, RoomAliasId, RoomId, UserId};
pub use job::{ErrorKind, Job, JobError, JobSignal, JobSignalKind, JobStatus};
pub use members::{member_sorter, RoomMember, User};
pub use room::{JoinState, Room, RoomSignal, RoomSignalKind};
pub use session::Session;
pub use signals::{Signal, SignalHub, SubscriptionId};
pub use sync::{RoomUpdate, SyncResponse};
pub use timeline::{Timeline, TimelineItem};

/// The version of this crate, as given in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
