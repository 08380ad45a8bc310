use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::spanned::Spanned;
use syn::{parse_quote, Data, DeriveInput, Fields, Index};

pub fn derive(mut input: DeriveInput) -> TokenStream {
    let name = &input.ident;

    let hash_impl = match &input.data {
        Data::Struct(data) => hash_fields(&quote!(self), &data.fields),
        Data::Enum(data) => {
            let arms = data.variants.iter().enumerate().map(|(ordinal, variant)| {
                let ordinal = ordinal as u32;
                let variant_name = &variant.ident;
                let (pattern, hash_body) = match &variant.fields {
                    Fields::Named(fields) => {
                        let names = fields.named.iter().map(|f| f.ident.clone().unwrap());
                        let names2 = names.clone();
                        let hash_statements = fields.named.iter().map(|f| {
                            let field_name = f.ident.clone().unwrap();
                            let ty = &f.ty;
                            quote_spanned! {ty.span()=>
                                <#ty as ::reposync::content_hash::ContentHash>::hash(#field_name, state);
                            }
                        });
                        (
                            quote!(Self::#variant_name { #(#names),* }),
                            quote!(#(let #names2 = #names2;)* #(#hash_statements)*),
                        )
                    }
                    Fields::Unnamed(fields) => {
                        let bindings: Vec<_> = (0..fields.unnamed.len())
                            .map(|i| syn::Ident::new(&format!("field_{i}"), proc_macro2::Span::call_site()))
                            .collect();
                        let hash_statements = fields.unnamed.iter().zip(&bindings).map(|(f, binding)| {
                            let ty = &f.ty;
                            quote_spanned! {ty.span()=>
                                <#ty as ::reposync::content_hash::ContentHash>::hash(#binding, state);
                            }
                        });
                        (
                            quote!(Self::#variant_name(#(#bindings),*)),
                            quote!(#(#hash_statements)*),
                        )
                    }
                    Fields::Unit => (quote!(Self::#variant_name), quote!()),
                };
                quote! {
                    #pattern => {
                        ::reposync::content_hash::ContentHash::hash(&#ordinal, state);
                        #hash_body
                    }
                }
            });
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Union(_) => unimplemented!("ContentHash cannot be derived for unions"),
    };

    add_trait_bounds(&mut input.generics);
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    quote! {
        #[automatically_derived]
        impl #impl_generics ::reposync::content_hash::ContentHash for #name #ty_generics
        #where_clause {
            fn hash(&self, state: &mut impl ::reposync::content_hash::DigestUpdate) {
                #hash_impl
            }
        }
    }
}

fn hash_fields(receiver: &TokenStream, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(fields) => {
            let hash_statements = fields.named.iter().map(|f| {
                let field_name = &f.ident;
                let ty = &f.ty;
                quote_spanned! {ty.span()=>
                    <#ty as ::reposync::content_hash::ContentHash>::hash(&#receiver.#field_name, state);
                }
            });
            quote! { #(#hash_statements)* }
        }
        Fields::Unnamed(fields) => {
            let hash_statements = fields.unnamed.iter().enumerate().map(|(i, f)| {
                let index = Index::from(i);
                let ty = &f.ty;
                quote_spanned! {ty.span() =>
                    <#ty as ::reposync::content_hash::ContentHash>::hash(&#receiver.#index, state);
                }
            });
            quote! { #(#hash_statements)* }
        }
        Fields::Unit => quote! {},
    }
}

fn add_trait_bounds(generics: &mut syn::Generics) {
    for param in &mut generics.params {
        if let syn::GenericParam::Type(type_param) = param {
            type_param
                .bounds
                .push(parse_quote!(::reposync::content_hash::ContentHash));
        }
    }
}
