//! Test attributes that capture `tracing` output for the duration of a test.
//!
//! `#[hsds_macros::test]` wraps a synchronous test, `#[hsds_macros::tokio_test]` an async
//! one. Both accept an optional comma separated argument list:
//!
//! - `multi_thread`: run the async test on the multi-threaded tokio runtime
//! - `filter = "hsds=debug"`: log filter used when `RUST_LOG` is not set (default `warn`)
use proc_macro::TokenStream;
use quote::quote;
use syn::{
    ItemFn, LitStr, Token, parse::Parser, parse_macro_input, punctuated::Punctuated,
};

struct TestArgs {
    multi_thread: bool,
    filter: String,
}

fn parse_args(attr: TokenStream) -> syn::Result<TestArgs> {
    let mut args = TestArgs { multi_thread: false, filter: "warn".to_string() };
    let metas = Punctuated::<syn::Meta, Token![,]>::parse_terminated.parse(attr)?;
    for meta in metas {
        match meta {
            syn::Meta::Path(path) if path.is_ident("multi_thread") => {
                args.multi_thread = true;
            }
            syn::Meta::NameValue(nv) if nv.path.is_ident("filter") => {
                let lit: &LitStr = match &nv.value {
                    syn::Expr::Lit(syn::ExprLit { lit: syn::Lit::Str(s), .. }) => s,
                    other => {
                        return Err(syn::Error::new_spanned(other, "expected a string"));
                    }
                };
                args.filter = lit.value();
            }
            other => {
                return Err(syn::Error::new_spanned(other, "unknown test argument"));
            }
        }
    }
    Ok(args)
}

fn expand(attr: TokenStream, item: TokenStream, asynchronous: bool) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let input_fn = parse_macro_input!(item as ItemFn);
    let attrs = &input_fn.attrs;
    let vis = &input_fn.vis;
    let sig = &input_fn.sig;
    let block = &input_fn.block;
    let filter = args.filter;

    let runner = if !asynchronous {
        quote! { #[test_log::test] }
    } else if args.multi_thread {
        quote! { #[test_log::test(tokio::test(flavor = "multi_thread"))] }
    } else {
        quote! { #[test_log::test(tokio::test)] }
    };

    let expanded = quote! {
        #runner
        #[test_log(default_log_filter = #filter)]
        #(#attrs)*
        #vis #sig #block
    };

    TokenStream::from(expanded)
}

#[proc_macro_attribute]
pub fn tokio_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, true)
}

#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, false)
}
