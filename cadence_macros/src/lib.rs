//! Attribute macros for `cadence` metric and aggregate types.
//!
//! Both macros attach the derive set that the `Metric` and `Aggregate` traits
//! require (serde, comparison, `Debug`, `Clone`), so implementors only write the
//! parts that carry meaning.
use proc_macro::TokenStream;
use quote::quote;
use syn::{Fields, Ident, ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Derives the `Metric` supertraits and implements `cadence::metric::Metric`.
#[proc_macro_attribute]
pub fn metric(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let input_struct = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialOrd,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics ::cadence::metric::Metric for #input_struct #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}

/// Derives the `Aggregate` supertraits.
///
/// `#[aggregate(additive)]` additionally implements `AddAssign` by adding every
/// named field of `other` into `self`, which is the whole `merge` for plain
/// counter structs.
#[proc_macro_attribute]
pub fn aggregate(attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let additive = if attr.is_empty() {
        false
    } else {
        let flag = parse_macro_input!(attr as Ident);
        if flag != "additive" {
            return syn::Error::new(flag.span(), "expected `additive` or no argument")
                .to_compile_error()
                .into();
        }
        true
    };

    let add_assign = if additive {
        let Fields::Named(named) = &ast.fields else {
            return syn::Error::new_spanned(&ast.ident, "`additive` needs named fields")
                .to_compile_error()
                .into();
        };
        let idents = named.named.iter().filter_map(|f| f.ident.as_ref());
        let input_struct = &ast.ident;
        let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
        quote! {
            impl #impl_generics std::ops::AddAssign for #input_struct #ty_generics #where_clause {
                fn add_assign(&mut self, other: Self) {
                    #( self.#idents += other.#idents; )*
                }
            }
        }
    } else {
        quote! {}
    };

    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialOrd,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        #add_assign
    };

    TokenStream::from(expanded)
}
