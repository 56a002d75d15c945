//! Proc macros that remove the boilerplate of converting between a typed katcp message enum
//! and the wire `Message` representation.
//!
//! Two derives are provided:
//!  - `KatcpMessage` for the `Request`/`Reply`/`Inform` sum types that model a single katcp
//!    request/reply/inform triplet (e.g. `?help`, `!help`, `#help`).
//!  - `KatcpDiscrete` for plain C-like enums that should round-trip through a single katcp
//!    argument token (sensor statuses, log levels, return codes, ...).

use convert_case::{Case, Casing};
use proc_macro::TokenStream;
use proc_macro2::Ident;
use quote::{format_ident, quote};
use syn::{
    parse_macro_input, Data, DataEnum, DeriveInput, Fields, FieldsNamed, Lit, Meta, NestedMeta,
    Variant,
};

/// Converts a `PascalCase` or `SCREAMING_SNAKE_CASE` identifier into the lowercase,
/// hyphen-separated form katcp uses on the wire (`TwoFace` / `TWO_FACE` -> `two-face`).
fn kebab(ident: &Ident) -> String {
    ident.to_string().to_case(Case::Kebab)
}

/// Looks for a `#[katcp(rename = "...")]` attribute on a variant, returning the literal
/// override if present.
fn rename_override(variant: &Variant) -> Option<String> {
    for attr in &variant.attrs {
        if !attr.path.is_ident("katcp") {
            continue;
        }
        if let Ok(Meta::List(list)) = attr.parse_meta() {
            for nested in list.nested {
                if let NestedMeta::Meta(Meta::NameValue(nv)) = nested {
                    if nv.path.is_ident("rename") {
                        if let Lit::Str(s) = nv.lit {
                            return Some(s.value());
                        }
                    }
                }
            }
        }
    }
    None
}

enum VariantShape {
    Unit,
    Named(Vec<Ident>),
    /// A single unnamed field delegating to its own `ToKatcpArguments`/`FromKatcpArguments`.
    Tuple,
}

fn variant_shape(variant: &Variant) -> VariantShape {
    match &variant.fields {
        Fields::Unit => VariantShape::Unit,
        Fields::Named(FieldsNamed { named, .. }) => VariantShape::Named(
            named
                .iter()
                .map(|f| {
                    f.ident
                        .clone()
                        .expect("fields in message variants must be named")
                })
                .collect(),
        ),
        Fields::Unnamed(unnamed) => {
            let mut fields = unnamed.unnamed.iter();
            fields
                .next()
                .expect("tuple message variants must carry exactly one field");
            if fields.next().is_some() {
                panic!("tuple message variants must carry exactly one field");
            }
            VariantShape::Tuple
        }
    }
}

fn find_variant<'a>(variants: &'a [Variant], name: &str) -> Option<&'a Variant> {
    variants.iter().find(|v| v.ident == name)
}

/// Builds the `Self::Variant { .. } => (MessageKind::Kind, args)` arm used in `to_message`.
fn to_message_arm(kind_ident: &Ident, variant: &Variant) -> proc_macro2::TokenStream {
    let variant_ident = &variant.ident;
    match variant_shape(variant) {
        VariantShape::Unit => quote! {
            Self::#variant_ident => (MessageKind::#kind_ident, ::std::vec::Vec::<::std::vec::Vec<u8>>::new())
        },
        VariantShape::Named(fields) => quote! {
            Self::#variant_ident { #(#fields),* } => (
                MessageKind::#kind_ident,
                ::std::vec![#(ToKatcpArgument::to_argument(#fields)),*]
            )
        },
        VariantShape::Tuple => quote! {
            Self::#variant_ident(inner) => (MessageKind::#kind_ident, ToKatcpArguments::to_arguments(inner))
        },
    }
}

/// Builds the `MessageKind::Kind => { .. }` arm used in `try_from`.
fn from_message_arm(kind_ident: &Ident, variant: &Variant) -> proc_macro2::TokenStream {
    let variant_ident = &variant.ident;
    match variant_shape(variant) {
        VariantShape::Unit => quote! {
            MessageKind::#kind_ident => Ok(Self::#variant_ident)
        },
        VariantShape::Named(fields) => {
            let binds = fields.iter().map(|f| {
                quote! {
                    let #f = FromKatcpArgument::from_argument(
                        &__katcp_args.next().ok_or(KatcpError::MissingArgument)?
                    )?;
                }
            });
            quote! {
                MessageKind::#kind_ident => {
                    #(#binds)*
                    Ok(Self::#variant_ident { #(#fields),* })
                }
            }
        }
        VariantShape::Tuple => quote! {
            MessageKind::#kind_ident => {
                let inner = FromKatcpArguments::from_arguments(&mut __katcp_args)?;
                Ok(Self::#variant_ident(inner))
            }
        },
    }
}

#[proc_macro_derive(KatcpMessage, attributes(katcp))]
pub fn derive_katcp_message(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let enum_name = input.ident;
    let variants: Vec<Variant> = match input.data {
        Data::Enum(DataEnum { variants, .. }) => variants.into_iter().collect(),
        _ => panic!("KatcpMessage can only be derived on enums"),
    };

    for variant in &variants {
        let ident_str = variant.ident.to_string();
        if !matches!(ident_str.as_str(), "Request" | "Reply" | "Inform") {
            panic!(
                "KatcpMessage variants must be named Request, Reply, or Inform; found `{}`",
                ident_str
            );
        }
    }

    let message_str = kebab(&enum_name);

    let request = find_variant(&variants, "Request");
    let reply = find_variant(&variants, "Reply");
    let inform = find_variant(&variants, "Inform");

    let to_message_arms = [
        request.map(|v| to_message_arm(&format_ident!("Request"), v)),
        reply.map(|v| to_message_arm(&format_ident!("Reply"), v)),
        inform.map(|v| to_message_arm(&format_ident!("Inform"), v)),
    ]
    .into_iter()
    .flatten();

    let from_message_arms = [
        request.map(|v| from_message_arm(&format_ident!("Request"), v)),
        reply.map(|v| from_message_arm(&format_ident!("Reply"), v)),
        inform.map(|v| from_message_arm(&format_ident!("Inform"), v)),
    ]
    .into_iter()
    .flatten();

    let missing_kind_arms = [
        request
            .is_none()
            .then(|| quote! { MessageKind::Request => Err(KatcpError::UnexpectedMessageKind) }),
        reply
            .is_none()
            .then(|| quote! { MessageKind::Reply => Err(KatcpError::UnexpectedMessageKind) }),
        inform
            .is_none()
            .then(|| quote! { MessageKind::Inform => Err(KatcpError::UnexpectedMessageKind) }),
    ]
    .into_iter()
    .flatten();

    let generated = quote! {
        impl TryFrom<Message> for #enum_name {
            type Error = KatcpError;

            fn try_from(message: Message) -> ::std::result::Result<Self, Self::Error> {
                let kind = message.kind();
                if message.name() != #message_str {
                    return Err(KatcpError::UnknownMessage(message.name().to_owned()));
                }
                let mut __katcp_args = message.into_arguments().into_iter();
                match kind {
                    #(#from_message_arms,)*
                    #(#missing_kind_arms,)*
                }
            }
        }

        impl KatcpMessage for #enum_name {
            fn to_message(&self, id: ::std::option::Option<u64>) -> MessageResult {
                let (kind, args) = match self {
                    #(#to_message_arms,)*
                };
                Message::new(kind, #message_str, id, args)
            }
        }

        impl ::std::str::FromStr for #enum_name {
            type Err = KatcpError;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                Message::parse(s.as_bytes())?.try_into()
            }
        }

        impl ::std::convert::TryFrom<&str> for #enum_name {
            type Error = KatcpError;

            fn try_from(s: &str) -> ::std::result::Result<Self, Self::Error> {
                ::std::str::FromStr::from_str(s)
            }
        }
    };
    generated.into()
}

#[proc_macro_derive(KatcpDiscrete, attributes(katcp))]
pub fn derive_katcp_discrete(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let enum_name = input.ident;
    let variants: Vec<Variant> = match input.data {
        Data::Enum(DataEnum { variants, .. }) => variants.into_iter().collect(),
        _ => panic!("KatcpDiscrete can only be derived on enums"),
    };
    for variant in &variants {
        if !matches!(variant.fields, Fields::Unit) {
            panic!("KatcpDiscrete can only be derived on enums with unit variants");
        }
    }
    if variants.is_empty() {
        panic!("KatcpDiscrete requires at least one variant");
    }

    let idents: Vec<_> = variants.iter().map(|v| v.ident.clone()).collect();
    let wire_values: Vec<String> = variants
        .iter()
        .map(|v| rename_override(v).unwrap_or_else(|| kebab(&v.ident)))
        .collect();
    let wire_bytes: Vec<_> = wire_values
        .iter()
        .map(|s| proc_macro2::Literal::byte_string(s.as_bytes()))
        .collect();
    let first_ident = &idents[0];

    let generated = quote! {
        impl ToKatcpArgument for #enum_name {
            fn to_argument(&self) -> ::std::vec::Vec<u8> {
                match self {
                    #(Self::#idents => (#wire_bytes).to_vec(),)*
                }
            }
        }

        impl FromKatcpArgument for #enum_name {
            type Err = KatcpError;

            fn from_argument(s: &[u8]) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    #(#wire_bytes => Ok(Self::#idents),)*
                    other => Err(KatcpError::ValueDecodeError(format!(
                        "{:?} is not a valid {} variant",
                        String::from_utf8_lossy(other),
                        stringify!(#enum_name)
                    ))),
                }
            }
        }

        impl ::std::default::Default for #enum_name {
            fn default() -> Self {
                Self::#first_ident
            }
        }
    };
    generated.into()
}
