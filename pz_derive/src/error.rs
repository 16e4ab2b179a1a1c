//! Derive macro for error enums.
//!
//! Generates `std::fmt::Display` and `std::error::Error` implementations
//! from `#[error("...")]` attributes, so the runtime does not need to pull
//! in `thiserror`.
//!
//! # Usage
//!
//! ```ignore
//! use pz_derive::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum LoadError {
//!     #[error("{filename}: {source}")]
//!     Io { filename: String, source: std::io::Error },
//!
//!     #[error("bad magic value 0x{0:08x}, is this a PZ file?")]
//!     BadMagic(u32),
//!
//!     #[error("junk at end of file")]
//!     JunkAtEof,
//! }
//! ```
//!
//! Tuple fields interpolate positionally (`{0}`, `{1}`); struct fields by
//! name. A struct field named `source` is additionally returned from
//! `Error::source` for error chaining.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields, Lit, Meta, Variant};

pub fn derive_error(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => TokenStream::from(tokens),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let data = match &input.data {
        Data::Enum(data) => data,
        _ => {
            return Err(syn::Error::new_spanned(
                input,
                "Error derive supports enums only",
            ));
        }
    };

    let mut display_arms = Vec::new();
    let mut source_arms = Vec::new();

    for variant in &data.variants {
        let ident = &variant.ident;
        let message = error_message(variant)?;

        match &variant.fields {
            Fields::Unit => {
                display_arms.push(quote! {
                    Self::#ident => write!(f, #message),
                });
            }
            Fields::Unnamed(fields) => {
                let bindings: Vec<_> = (0..fields.unnamed.len())
                    .map(|i| format_ident!("f{}", i))
                    .collect();
                let message = positional_to_named(&message, fields.unnamed.len());
                display_arms.push(quote! {
                    Self::#ident(#(#bindings),*) =>
                        write!(f, #message, #(#bindings = #bindings),*),
                });
            }
            Fields::Named(fields) => {
                let names: Vec<_> = fields.named.iter().map(|f| &f.ident).collect();
                display_arms.push(quote! {
                    Self::#ident { #(#names),* } =>
                        write!(f, #message, #(#names = #names),*),
                });

                if fields
                    .named
                    .iter()
                    .any(|f| f.ident.as_ref().is_some_and(|i| i == "source"))
                {
                    source_arms.push(quote! {
                        Self::#ident { source, .. } => Some(source),
                    });
                }
            }
        }
    }

    let source_impl = if source_arms.is_empty() {
        quote! {}
    } else {
        quote! {
            #[allow(unreachable_patterns)]
            fn source(&self) -> Option<&(dyn ::std::error::Error + 'static)> {
                match self {
                    #(#source_arms)*
                    _ => None,
                }
            }
        }
    };

    Ok(quote! {
        impl ::std::fmt::Display for #name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                match self {
                    #(#display_arms)*
                }
            }
        }

        impl ::std::error::Error for #name {
            #source_impl
        }
    })
}

/// Extracts the message from a variant's `#[error("...")]` attribute.
fn error_message(variant: &Variant) -> syn::Result<String> {
    for attr in &variant.attrs {
        if !attr.path().is_ident("error") {
            continue;
        }
        if let Meta::List(list) = &attr.meta {
            if let Ok(Lit::Str(lit)) = syn::parse2::<Lit>(list.tokens.clone()) {
                return Ok(lit.value());
            }
        }
        return Err(syn::Error::new_spanned(
            &attr.meta,
            "expected #[error(\"message\")] with a string literal",
        ));
    }

    Err(syn::Error::new_spanned(
        variant,
        format!(
            "variant `{}` is missing its #[error(\"...\")] attribute",
            variant.ident
        ),
    ))
}

/// Rewrites `{0}`/`{1}` placeholders to the `{f0}`/`{f1}` bindings used in
/// the generated match arms. Format specs like `{0:08x}` are preserved.
fn positional_to_named(message: &str, field_count: usize) -> String {
    let mut out = message.to_string();
    for i in (0..field_count).rev() {
        out = out.replace(&format!("{{{}}}", i), &format!("{{f{}}}", i));
        out = out.replace(&format!("{{{}:", i), &format!("{{f{}:", i));
    }
    out
}
