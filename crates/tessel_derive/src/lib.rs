use proc_macro::TokenStream;
use syn::{DeriveInput, LitInt, parse_macro_input};

mod api;
mod ops;

/// Implements `TensorOp` for an op payload by forwarding to the field marked `#[tensor_op]`
/// (or the only field of a tuple struct), which is usually an `InnerOp`.
///
/// `#[tensor_op(crate = "...", bound = "...", name = "...")]` on the struct sets the path of
/// the exporting crate, extra impl bounds and the reported op name.
#[proc_macro_derive(TensorOp, attributes(tensor_op))]
pub fn derive_tensor_op(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = ops::derive_tensor_op(input);
    expanded.into()
}

/// Generates `submit_api_N`, which wraps `N` input tensors and one output tensor into an op
/// and submits it to the runtime of the output.
#[proc_macro]
pub fn build_api(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as LitInt);
    let expanded = api::build_api(input);
    expanded.into()
}
