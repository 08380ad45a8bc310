mod content_hash;

extern crate proc_macro;

use syn::{parse_macro_input, DeriveInput};

/// Derives the `ContentHash` trait by hashing each field (for a struct) or
/// the ordinal plus fields (for an enum) in declaration order.
#[proc_macro_derive(ContentHash)]
pub fn derive_content_hash(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    content_hash::derive(input).into()
}
