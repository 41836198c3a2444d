use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{
    Attribute, Data, DeriveInput, Fields, GenericArgument, PathArguments, Type, parse_macro_input,
};

mod rules;

fn extract_error_type(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate_error")) {
        let mut ty = None;
        attr.parse_nested_meta(|meta| {
            ty = Some(meta.path.to_token_stream());
            Ok(())
        })?;
        if let Some(t) = ty {
            return Ok(t);
        }
    }
    Ok(quote! { String })
}

fn extract_rules(attrs: &[Attribute]) -> syn::Result<Vec<String>> {
    let mut out = vec![];
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| {
            if let Some(id) = meta.path.get_ident() {
                out.push(id.to_string());
            }
            Ok(())
        })?;
    }
    Ok(out)
}

fn last_segment_is(ty: &Type, name: &str) -> bool {
    match ty {
        Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident == name)
            .unwrap_or(false),
        _ => false,
    }
}

/// Shape of a field that validation rules may be attached to.
enum FieldShape {
    Text,
    OptionalText,
}

fn field_shape(ty: &Type) -> Option<FieldShape> {
    if last_segment_is(ty, "String") {
        return Some(FieldShape::Text);
    }
    let Type::Path(p) = ty else {
        return None;
    };
    let segment = p.path.segments.last()?;
    if segment.ident != "Option" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first() {
        Some(GenericArgument::Type(inner)) if last_segment_is(inner, "String") => {
            Some(FieldShape::OptionalText)
        }
        _ => None,
    }
}

/// Derives a validating `new` constructor.
///
/// Rules are listed with `#[validate(...)]` on the struct (applied to every
/// text field) or on a field (replacing the struct rules for that field).
/// `#[validate(skip)]` opts a field out. Rules apply to `String` and
/// `Option<String>` fields; `None` values are not checked. Failures are
/// reported as `String` messages converted into the `#[validate_error(..)]`
/// type with `From<String>`.
#[proc_macro_derive(Validate, attributes(validate, validate_error))]
pub fn derive_validate(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    match expand(ast) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand(ast: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = ast.ident;
    let error_type = extract_error_type(&ast.attrs)?;
    let struct_rules = extract_rules(&ast.attrs)?;

    let mut ctor_params = vec![];
    let mut ctor_assigns = vec![];
    let mut validations = vec![];

    let fields = match ast.data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    struct_name,
                    "Validate supports named structs only",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                struct_name,
                "Validate can only be used on structs",
            ));
        }
    };

    for field in fields {
        let Some(ident) = field.ident else {
            continue;
        };
        let ty = field.ty;

        ctor_params.push(quote! { #ident: #ty });
        ctor_assigns.push(quote! { #ident });

        let mut field_rules = extract_rules(&field.attrs)?;
        if field_rules.iter().any(|r| r == "skip") {
            continue;
        }
        if field_rules.is_empty() {
            field_rules = struct_rules.clone();
        }
        if field_rules.is_empty() {
            continue;
        }

        let Some(shape) = field_shape(&ty) else {
            return Err(syn::Error::new_spanned(
                &ident,
                format!(
                    "Validation rules can only be applied to String or Option<String> fields: {}",
                    ident
                ),
            ));
        };

        let field_name = ident.to_string();
        let mut checks = vec![];
        for rule in field_rules {
            let ts = rules::dispatch(&rule, &field_name).ok_or_else(|| {
                syn::Error::new_spanned(&ident, format!("Unknown rule `{}`", rule))
            })?;
            checks.push(ts);
        }

        validations.push(match shape {
            FieldShape::Text => quote! {
                {
                    let value: &str = #ident.as_str();
                    #(#checks)*
                }
            },
            FieldShape::OptionalText => quote! {
                if let Some(value) = #ident.as_deref() {
                    #(#checks)*
                }
            },
        });
    }

    Ok(quote! {
        impl #struct_name {
            #[allow(clippy::too_many_arguments)]
            pub fn new(
                #(#ctor_params),*
            ) -> Result<Self, #error_type> {
                #[allow(dead_code)]
                type E = #error_type;

                #(
                    #validations
                )*

                Ok(Self {
                    #(#ctor_assigns),*
                })
            }
        }
    })
}
