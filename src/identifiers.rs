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

//! Matrix identifiers.
//!
//! Identifiers are opaque strings with a leading sigil: `@` for users, `!`
//! for rooms, `#` for room aliases and `$` for events. Equality and ordering
//! are bytewise.

use std::{convert::TryFrom, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error encountered when trying to parse an invalid identifier string.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IdParseError {
    /// The identifier does not start with the expected sigil character.
    #[error("identifier is missing the leading '{0}' sigil")]
    MissingSigil(char),
    /// The identifier is missing the `:server` part after the localpart.
    #[error("identifier is missing the ':server' part")]
    MissingServerName,
    /// The identifier is empty apart from its sigil.
    #[error("identifier is empty")]
    Empty,
}

macro_rules! identifier {
    ($(#[doc = $docs:literal])* $name:ident, $sigil:literal, $needs_server:expr) => {
        $(#[doc = $docs])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Box<str>);

        impl $name {
            /// Validate and wrap the given string.
            pub fn parse(s: &str) -> Result<Self, IdParseError> {
                if !s.starts_with($sigil) {
                    return Err(IdParseError::MissingSigil($sigil));
                }
                if s.len() == 1 {
                    return Err(IdParseError::Empty);
                }
                if $needs_server && !s[1..].contains(':') {
                    return Err(IdParseError::MissingServerName);
                }
                Ok(Self(s.into()))
            }

            /// The identifier as a string slice, sigil included.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = IdParseError;

            fn try_from(s: &str) -> Result<Self, IdParseError> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdParseError;

            fn try_from(s: String) -> Result<Self, IdParseError> {
                Self::parse(&s)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, IdParseError> {
                Self::parse(s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0.into()
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                &*self.0 == *other
            }
        }
    };
}

identifier!(
    /// A user identifier of the form `@localpart:server`.
    UserId,
    '@',
    true
);

identifier!(
    /// A room identifier of the form `!opaque:server`.
    RoomId,
    '!',
    true
);

identifier!(
    /// A room alias of the form `#alias:server`.
    RoomAliasId,
    '#',
    true
);

identifier!(
    /// An event identifier; an opaque string starting with `$`.
    EventId,
    '$',
    false
);

impl UserId {
    /// The part between the `@` sigil and the `:` separator.
    pub fn localpart(&self) -> &str {
        let end = self.0.find(':').unwrap_or(self.0.len());
        &self.0[1..end]
    }

    /// The server name part after the first `:`.
    pub fn server_name(&self) -> &str {
        let start = self.0.find(':').map(|i| i + 1).unwrap_or(self.0.len());
        &self.0[start..]
    }
}
