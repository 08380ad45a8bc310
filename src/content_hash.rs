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

//! Portable, stable hashing for identifying commits, trees and blobs.
//!
//! The canonical form hashed here is *not* simply the in-memory layout:
//! variable-length sequences hash a little-endian length prefix before their
//! elements, unordered containers hash in sorted order, and enums hash a
//! 32-bit ordinal before their payload. Two values that are `==` always hash
//! identically; the converse only holds as strongly as SHA-1 does.

pub use digest::Update as DigestUpdate;
pub use reposync_proc_macros::ContentHash;
use sha1::{Digest, Sha1};

/// Portable, stable hashing suitable for identifying values by content.
///
/// Structs and enums should use `#[derive(ContentHash)]` rather than
/// implementing this by hand.
pub trait ContentHash {
    fn hash(&self, state: &mut impl DigestUpdate);
}

/// The 160-bit SHA-1 content hash used for object ids throughout the store.
pub fn sha1_hash(x: &(impl ContentHash + ?Sized)) -> [u8; 20] {
    let mut hasher = Sha1::new();
    x.hash(&mut hasher);
    hasher.finalize().into()
}

impl ContentHash for () {
    fn hash(&self, _: &mut impl DigestUpdate) {}
}

impl ContentHash for bool {
    fn hash(&self, state: &mut impl DigestUpdate) {
        u8::from(*self).hash(state);
    }
}

impl ContentHash for u8 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&[*self]);
    }
}

impl ContentHash for u32 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&self.to_le_bytes());
    }
}

impl ContentHash for i32 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&self.to_le_bytes());
    }
}

impl ContentHash for u64 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&self.to_le_bytes());
    }
}

impl ContentHash for i64 {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&self.to_le_bytes());
    }
}

impl<T: ContentHash> ContentHash for [T] {
    fn hash(&self, state: &mut impl DigestUpdate) {
        state.update(&(self.len() as u64).to_le_bytes());
        for x in self {
            x.hash(state);
        }
    }
}

impl<T: ContentHash> ContentHash for Vec<T> {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.as_slice().hash(state)
    }
}

impl ContentHash for String {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.as_bytes().hash(state);
    }
}

impl ContentHash for str {
    fn hash(&self, state: &mut impl DigestUpdate) {
        self.as_bytes().hash(state);
    }
}

impl<T: ContentHash> ContentHash for Option<T> {
    fn hash(&self, state: &mut impl DigestUpdate) {
        match self {
            None => state.update(&0u32.to_le_bytes()),
            Some(x) => {
                state.update(&1u32.to_le_bytes());
                x.hash(state)
            }
        }
    }
}

impl<T: ContentHash + ?Sized> ContentHash for &T {
    fn hash(&self, state: &mut impl DigestUpdate) {
        (**self).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_sanity() {
        let a = "a".to_string();
        let b = "b".to_string();
        assert_eq!(sha1_hash(&a), sha1_hash(&a.clone()));
        assert_ne!(sha1_hash(&a), sha1_hash(&b));
        assert_ne!(sha1_hash(&"a".to_string()), sha1_hash(&"a\0".to_string()));
    }

    #[test]
    fn test_struct_sanity() {
        #[derive(ContentHash)]
        struct Foo {
            x: i32,
        }
        assert_ne!(sha1_hash(&Foo { x: 42 }), sha1_hash(&Foo { x: 12 }));
    }

    #[test]
    fn test_vec_prefix_distinguishes_boundaries() {
        // Without a length prefix, [1,2] then [3] would hash the same as
        // [1] then [2,3] once concatenated.
        #[derive(ContentHash)]
        struct Pair(Vec<i32>, Vec<i32>);
        assert_ne!(
            sha1_hash(&Pair(vec![1, 2], vec![3])),
            sha1_hash(&Pair(vec![1], vec![2, 3]))
        );
    }

    #[test]
    fn test_option_sanity() {
        assert_ne!(sha1_hash(&Some(42)), sha1_hash(&42));
        assert_ne!(sha1_hash(&None::<i32>), sha1_hash(&42i32));
    }

    #[test]
    fn derive_for_enum_distinguishes_variants() {
        #[derive(ContentHash)]
        enum MyEnum {
            A,
            B(i32),
            C { x: i32 },
        }
        assert_ne!(sha1_hash(&MyEnum::A), sha1_hash(&MyEnum::B(0)));
        assert_ne!(sha1_hash(&MyEnum::B(1)), sha1_hash(&MyEnum::B(2)));
        assert_ne!(sha1_hash(&MyEnum::B(1)), sha1_hash(&MyEnum::C { x: 1 }));
    }
}
