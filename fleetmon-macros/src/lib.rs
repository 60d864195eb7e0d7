use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// Test attribute that installs the fleetmon tracing subscriber before the
/// body runs. Arguments are forwarded to `#[tokio::test]` for async tests,
/// so `#[fleetmon::test(start_paused = true)]` gives a paused clock.
///
/// ```ignore
/// #[fleetmon::test]
/// fn counts_are_idempotent() { ... }
///
/// #[fleetmon::test(start_paused = true)]
/// async fn lease_renews() { ... }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args_ts = proc_macro2::TokenStream::from(attr);
    let input = parse_macro_input!(item as ItemFn);
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &input.sig.ident;

    let paren_args = if args_ts.is_empty() {
        quote! {}
    } else {
        quote! { ( #args_ts ) }
    };

    let output = if sig.asyncness.is_some() {
        quote! {
            #(#attrs)*
            #[tokio::test #paren_args]
            #vis #sig {
                ::fleetmon::trace::with_test_tracing(stringify!(#name), || async move #block).await
            }
        }
    } else {
        quote! {
            #(#attrs)*
            #[test]
            #vis #sig {
                ::fleetmon::trace::with_test_tracing_sync(stringify!(#name), || #block)
            }
        }
    };
    output.into()
}
