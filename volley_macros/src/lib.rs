//! Procedural macros for `volley`.
//!
//! `#[aggregate]` attaches the derive bundle that every [`Aggregate`] implementation
//! must carry (serde round-tripping, comparison, `Debug`, `Clone`), so implementors
//! only have to write the `consume`/`merge` logic.
//!
//! [`Aggregate`]: https://docs.rs/volley/latest/volley/aggregate/trait.Aggregate.html
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Item};

extern crate proc_macro;

#[proc_macro_attribute]
pub fn aggregate(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as Item);
    match &ast {
        Item::Struct(_) | Item::Enum(_) => {}
        other => {
            return syn::Error::new_spanned(other, "#[aggregate] applies to structs and enums")
                .to_compile_error()
                .into();
        }
    }

    let expanded = quote! {
        #[derive(
            ::serde::Serialize,
            ::serde::Deserialize,
            ::std::cmp::PartialOrd,
            ::std::cmp::PartialEq,
            ::std::fmt::Debug,
            ::std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
