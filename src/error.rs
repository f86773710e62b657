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

//! Error conditions.

use reqwest::Error as ReqwestError;
use serde_json::Error as JsonError;
use thiserror::Error;
use url::ParseError as UrlError;

use crate::{identifiers::IdParseError, job::JobError};

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Internal representation of errors.
#[derive(Error, Debug)]
pub enum Error {
    /// Queried endpoint requires authentication but was called on an
    /// anonymous connection.
    #[error("the queried endpoint requires authentication but was called before logging in")]
    AuthenticationRequired,

    /// The homeserver URL is missing and could not be resolved.
    #[error("no homeserver is configured: {0}")]
    HomeserverUnresolved(String),

    /// An error at the HTTP layer.
    #[error(transparent)]
    Reqwest(#[from] ReqwestError),

    /// An error de/serializing JSON.
    #[error(transparent)]
    SerdeJson(#[from] JsonError),

    /// An error parsing a string as a URL.
    #[error(transparent)]
    Url(#[from] UrlError),

    /// An error parsing a Matrix identifier.
    #[error(transparent)]
    Identifier(#[from] IdParseError),

    /// An I/O error, e.g. while reading or writing the state cache.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A job reached a terminal failure.
    #[error("request failed: {0}")]
    Job(#[from] JobError),
}
