use proc_macro2::TokenStream;
use quote::quote;
use syn::LitInt;

pub fn build_api(input: LitInt) -> TokenStream {
    let n = match input.base10_parse::<usize>() {
        Ok(n) => n,
        Err(err) => return err.to_compile_error(),
    };

    let tensor_params = (0..n)
        .map(|i| syn::Ident::new(&format!("t{i}"), proc_macro2::Span::call_site()))
        .collect::<Vec<_>>();

    let ir_calls = tensor_params
        .iter()
        .map(|ti| quote! { #ti.ir(Access::ReadOnly) })
        .collect::<Vec<_>>();

    let generics = quote! {
        R: Runtime,
        Op: TensorOp + 'static,
        F: FnOnce(InnerOp<#n, 1>) -> Op,
    };

    let fn_name = syn::Ident::new(&format!("submit_api_{n}"), proc_macro2::Span::call_site());

    quote! {
        #[allow(unused)]
        pub fn #fn_name<R, Op, F>(
            f: F,
            output: &TensorUntyped<R>,
            access: Access,
            #(#tensor_params: &TensorUntyped<R>),*
        ) where
            #generics
        {
            let inputs = [#(#ir_calls),*];
            let outputs = [output.ir(access)];
            let op = f(InnerOp::new(inputs, outputs));
            output.runtime().submit(RuntimeEvent::Submit(Box::new(op)));
        }
    }
}
