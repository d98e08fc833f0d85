use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    Attribute, DeriveInput, Fields, LitStr, Path, Token, WherePredicate, punctuated::Punctuated,
    spanned::Spanned,
};

const ATTRIBUTE: &str = "tensor_op";

/// Options given by `#[tensor_op(...)]` on the struct itself.
#[derive(Default)]
struct Options {
    /// Path of the crate exporting `loom::ops`; `::tessel` if absent.
    krate: Option<Path>,
    /// Extra predicates of the generated impl.
    bounds: Punctuated<WherePredicate, Token![,]>,
    /// Name reported to logs and task graphs; the struct name if absent.
    name: Option<LitStr>,
}

impl Options {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs.iter().filter(|attr| attr.path().is_ident(ATTRIBUTE)) {
            attr.parse_nested_meta(|meta| {
                let value: LitStr = meta.value()?.parse()?;
                if meta.path.is_ident("crate") {
                    options.krate = Some(value.parse()?);
                } else if meta.path.is_ident("bound") {
                    let predicates = value
                        .parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?;
                    options.bounds.extend(predicates);
                } else if meta.path.is_ident("name") {
                    options.name = Some(value);
                } else {
                    return Err(meta.error("supported are `crate`, `bound` and `name`"));
                }
                Ok(())
            })?;
        }
        Ok(options)
    }
}

/// The expression reaching the `InnerOp` of the payload.
fn inner_op(input: &DeriveInput) -> syn::Result<TokenStream> {
    let syn::Data::Struct(data) = &input.data else {
        return Err(syn::Error::new(
            input.span(),
            "`TensorOp` can only be derived for structs",
        ));
    };
    match &data.fields {
        Fields::Unnamed(fields) if fields.unnamed.len() == 1 => Ok(quote! { self.0 }),
        Fields::Unnamed(fields) => Err(syn::Error::new(
            fields.span(),
            "tuple structs must have exactly one field",
        )),
        Fields::Named(fields) => {
            let marked = fields
                .named
                .iter()
                .filter(|field| field.attrs.iter().any(|a| a.path().is_ident(ATTRIBUTE)))
                .collect::<Vec<_>>();
            match marked.as_slice() {
                [field] => {
                    let ident = &field.ident;
                    Ok(quote! { self.#ident })
                }
                [] => Err(syn::Error::new(
                    fields.span(),
                    "no field marked with #[tensor_op] attribute",
                )),
                _ => Err(syn::Error::new(
                    fields.span(),
                    "multiple fields marked with #[tensor_op] attribute",
                )),
            }
        }
        Fields::Unit => Err(syn::Error::new(
            input.span(),
            "unit structs are not supported by `TensorOp` derive",
        )),
    }
}

pub fn derive_tensor_op(input: DeriveInput) -> TokenStream {
    match expand(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error(),
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream> {
    let inner = inner_op(&input)?;
    let options = Options::parse(&input.attrs)?;

    let ident = &input.ident;
    let base_path = match &options.krate {
        Some(path) => quote!(#path::loom::ops),
        None => quote!(::tessel::loom::ops),
    };
    let name = options
        .name
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));

    let (impl_generics, ty_generics, _) = input.generics.split_for_impl();
    let mut generics = input.generics.clone();
    let where_clause = generics.make_where_clause();
    where_clause.predicates.extend(options.bounds);

    Ok(quote! {
        impl #impl_generics #base_path::TensorOp for #ident #ty_generics #where_clause {
            fn name(&self) -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed(#name)
            }

            fn id(&self) -> #base_path::TaskId {
                #inner.id()
            }

            fn io(&self) -> Vec<#base_path::TensorIr> {
                #inner.io()
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    })
}
