// Copyright 2024 The Reposync Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(missing_docs)]

/// Common operations on a hash- or uuid-backed identifier.
pub trait ObjectId: Sized {
    fn from_bytes(bytes: &[u8]) -> Self;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    /// Parses a hex-encoded id. Fails on malformed input rather than
    /// panicking, so a corrupted on-disk pointer surfaces as a recoverable
    /// error instead of aborting the process.
    fn from_hex(hex: &str) -> Result<Self, hex::FromHexError>;
    fn hex(&self) -> String;
}

/// Declares a newtype wrapping a 40-char-hex SHA-1 object id, with
/// `ContentHash`, `Debug`, ordering and the `ObjectId` trait implemented.
macro_rules! id_type {
    ($(#[$meta:meta])* $vis:vis $name:ident) => {
        $(#[$meta])*
        #[derive(
            PartialEq, Eq, PartialOrd, Ord, Clone, Hash, crate::content_hash::ContentHash,
        )]
        $vis struct $name(Vec<u8>);

        $crate::object_id::impl_id_type!($name);
    };
}

macro_rules! impl_id_type {
    ($name:ident) => {
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl $name {
            pub fn from_sha1(bytes: [u8; 20]) -> Self {
                Self(bytes.to_vec())
            }
        }

        impl crate::object_id::ObjectId for $name {
            fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
                Ok(Self(hex::decode(hex)?))
            }

            fn hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.hex())
            }
        }
    };
}

pub(crate) use {id_type, impl_id_type};
