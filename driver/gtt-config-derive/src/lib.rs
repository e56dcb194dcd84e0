//! # Configuration Setters Derive
//!
//! Generates builder-style setters for configuration and device-description
//! structs, so presets can be written as `const` expressions:
//!
//! ```ignore
//! const CFG: GttConfig = GttConfig::new().with_vtd_active(true);
//! ```

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{
    Attribute, Data, DeriveInput, Fields, GenericArgument, LitBool, PathArguments, Type,
    parse_macro_input, spanned::Spanned,
};

/// Derive `.set_<field>(&mut self, value) -> &mut Self` and
/// `const .with_<field>(self, value) -> Self` for each **named** field.
///
/// Field attributes:
/// - `#[setters(skip)]` / `#[setters(skip = true)]`: no setters.
/// - `#[setters(strip_option)]`: on an `Option<T>` field, the setters take
///   `T` and store `Some(value)`.
///
/// Doc comments on a field are copied onto both generated methods.
///
/// # Example
///
/// ```
/// use gtt_config_derive::Setters;
///
/// #[derive(Setters)]
/// struct Knobs {
///     /// Batch size.
///     batch: usize,
///     #[setters(strip_option)]
///     override_gen: Option<u8>,
///     #[setters(skip)]
///     _private: (),
/// }
///
/// let k = Knobs { batch: 1, override_gen: None, _private: () }
///     .with_batch(15)
///     .with_override_gen(8);
/// assert_eq!(k.batch, 15);
/// assert_eq!(k.override_gen, Some(8));
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let options = match FieldOptions::parse(&field.attrs) {
            Ok(o) => o,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let docs = field
            .attrs
            .iter()
            .filter(|a| a.path().is_ident("doc"))
            .collect::<Vec<_>>();
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        let (arg_ty, store) = if options.strip_option {
            let Some(inner) = option_inner(&field.ty) else {
                return syn::Error::new(field.ty.span(), "strip_option requires an Option<T> field")
                    .to_compile_error()
                    .into();
            };
            (inner.clone(), quote!(::core::option::Option::Some(value)))
        } else {
            (field.ty.clone(), quote!(value))
        };

        methods.push(quote! {
            #(#docs)*
            #[inline]
            pub fn #set_name(&mut self, value: #arg_ty) -> &mut Self {
                self.#fname = #store;
                self
            }

            #(#docs)*
            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #arg_ty) -> Self {
                self.#fname = #store;
                self
            }
        });
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    strip_option: bool,
}

impl FieldOptions {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = flag_value(&meta)?;
                    Ok(())
                } else if meta.path.is_ident("strip_option") {
                    options.strip_option = flag_value(&meta)?;
                    Ok(())
                } else {
                    Err(meta.error("unknown setters option"))
                }
            })?;
        }
        Ok(options)
    }
}

/// Accepts `name` and `name = <bool>`.
fn flag_value(meta: &syn::meta::ParseNestedMeta<'_>) -> syn::Result<bool> {
    if meta.input.is_empty() || meta.input.peek(syn::Token![,]) {
        return Ok(true);
    }
    Ok(meta.value()?.parse::<LitBool>()?.value)
}

fn option_inner(ty: &Type) -> Option<&Type> {
    let Type::Path(path) = ty else { return None };
    let last = path.path.segments.last()?;
    if last.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &last.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner),
        _ => None,
    }
}
