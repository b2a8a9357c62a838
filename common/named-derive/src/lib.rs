use darling::{FromDeriveInput, FromVariant, ast::Data, util::Ignored};
use proc_macro::{self, TokenStream};
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

#[derive(Debug)]
#[derive(FromVariant)]
#[darling(attributes(named), and_then = "Self::validate")]
struct Variant {
    ident: syn::Ident,
    discriminant: Option<syn::Expr>,
    #[darling(default)]
    name: Option<String>,
    #[darling(default)]
    required: bool,
}

impl Variant {
    fn validate(self) -> darling::Result<Self> {
        if self.discriminant.is_some() {
            return Err(darling::Error::custom("discriminants are not supported, enum must be continuous"));
        }
        if let Some(name) = &self.name {
            if name.is_empty() {
                return Err(darling::Error::custom("name must not be empty"));
            }
        }
        Ok(self)
    }
}

#[derive(Debug)]
#[derive(FromDeriveInput)]
#[darling(attributes(named), supports(enum_unit))]
struct NamedEnum {
    data: Data<Variant, Ignored>,
}

/// Derives `common::MakeNamed` for a unit enum, so it can key an `EnumMap`.
///
/// Each variant may carry `#[named(name = "...")]` to override its display name (the default is
/// the lowercased identifier) and `#[named(required)]` to mark it as mandatory wiring.
#[proc_macro_derive(Named, attributes(named))]
pub fn derive_named(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input);
    let named_enum = match NamedEnum::from_derive_input(&input) {
        Ok(named_enum) => named_enum,
        Err(e) => return e.write_errors().into(),
    };
    let DeriveInput { ident, .. } = input;

    let mut from_patterns = Vec::new();
    let mut name_patterns = Vec::new();
    let mut required_patterns = Vec::new();

    let variants = match named_enum.data.take_enum() {
        Some(variants) => variants,
        None => return darling::Error::unsupported_shape("struct").write_errors().into(),
    };

    for (id, variant) in variants.into_iter().enumerate() {
        let name: proc_macro2::Ident = variant.ident;
        let display = variant.name.unwrap_or_else(|| name.to_string().to_lowercase());
        let required = variant.required;

        from_patterns.push(quote! { #id => #ident::#name, });
        name_patterns.push(quote! { #ident::#name => #display, });
        required_patterns.push(quote! { #ident::#name => #required, });
    }

    let count = from_patterns.len();

    let output = quote! {
        impl common::MakeNamed for #ident {
            const COUNT: usize = #count;

            fn name(self) -> &'static str {
                match self {
                    #(#name_patterns)*
                }
            }

            fn required(self) -> bool {
                match self {
                    #(#required_patterns)*
                }
            }
        }

        impl From<#ident> for usize {
            #[inline(always)]
            fn from(id: #ident) -> usize {
                id as usize
            }
        }

        impl From<usize> for #ident {
            #[inline(always)]
            fn from(id: usize) -> #ident {
                match id {
                    #(#from_patterns)*
                    _ => { panic!("invalid id"); }
                }
            }
        }
    };

    output.into()
}
