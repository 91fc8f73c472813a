extern crate proc_macro;

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::{format_ident, quote};
use syn::{
    ext::IdentExt, parse_macro_input, parse_quote, spanned::Spanned, Attribute, FnArg, Ident,
    ItemTrait, Pat, PatType, Path, ReturnType, TraitItem, Type, Visibility,
};

// names the generated client already uses
const RESERVED: &[&str] = &["new", "dest"];

struct ServiceTrait {
    attrs: Vec<Attribute>,
    vis: Visibility,
    ident: Ident,
    methods: Vec<ServiceMethod>,
}

struct ServiceMethod {
    attrs: Vec<Attribute>,
    name: Ident,
    variant: Ident,
    args: Vec<PatType>,
    ret: Type,
}

impl ServiceMethod {
    fn arg_names(&self) -> Vec<&Pat> {
        self.args.iter().map(|a| &*a.pat).collect()
    }
}

fn push_err(errors: &mut Option<syn::Error>, e: syn::Error) {
    match errors {
        Some(all) => all.combine(e),
        None => *errors = Some(e),
    }
}

// check one trait method, the signature must be `fn name(&self, arg: Type, ..) -> Ret;`
fn lower_method(item: TraitItem, errors: &mut Option<syn::Error>) -> Option<ServiceMethod> {
    use heck::ToUpperCamelCase;

    let f = match item {
        TraitItem::Fn(f) => f,
        other => {
            push_err(errors, syn::Error::new(other.span(), "only methods are allowed in a service trait"));
            return None;
        }
    };
    let sig = f.sig;
    if let Some(body) = &f.default {
        push_err(errors, syn::Error::new(body.span(), "service methods can't have a default body"));
    }
    if !sig.generics.params.is_empty() {
        push_err(errors, syn::Error::new(sig.generics.span(), "service methods can't be generic"));
    }
    if RESERVED.iter().any(|r| sig.ident == r) {
        push_err(
            errors,
            syn::Error::new(sig.ident.span(), format!("`{}` clashes with a generated client method", sig.ident)),
        );
    }

    let mut args = Vec::new();
    let mut receiver = false;
    for input in sig.inputs.iter() {
        match input {
            FnArg::Receiver(me) => {
                receiver = true;
                if me.reference.is_none() || me.mutability.is_some() {
                    push_err(errors, syn::Error::new(me.span(), "the receiver must be `&self`"));
                }
            }
            FnArg::Typed(arg) if matches!(&*arg.pat, Pat::Ident(_)) => args.push(arg.clone()),
            FnArg::Typed(arg) => {
                push_err(errors, syn::Error::new(arg.pat.span(), "service arguments must be plain names"));
            }
        }
    }
    if !receiver {
        push_err(errors, syn::Error::new(sig.span(), "service methods take `&self`"));
    }

    let ret = match sig.output {
        ReturnType::Type(_, ty) => *ty,
        ReturnType::Default => parse_quote!(()),
    };
    let variant = Ident::new(
        &sig.ident.unraw().to_string().to_upper_camel_case(),
        sig.ident.span(),
    );
    Some(ServiceMethod {
        attrs: f.attrs,
        name: sig.ident,
        variant,
        args,
        ret,
    })
}

fn lower_trait(item: ItemTrait) -> syn::Result<ServiceTrait> {
    let mut errors = None;
    if !item.generics.params.is_empty() {
        push_err(&mut errors, syn::Error::new(item.generics.span(), "service traits can't be generic"));
    }
    let methods: Vec<_> = item
        .items
        .into_iter()
        .filter_map(|i| lower_method(i, &mut errors))
        .collect();
    match errors {
        Some(e) => Err(e),
        None => Ok(ServiceTrait {
            attrs: item.attrs,
            vis: item.vis,
            ident: item.ident,
            methods,
        }),
    }
}

fn serde_derive() -> TokenStream2 {
    quote! {
        #[derive(may_service::serde::Serialize, may_service::serde::Deserialize)]
        #[serde(crate = "may_service::serde")]
    }
}

fn expand_service(def: &ServiceTrait) -> TokenStream2 {
    let ServiceTrait {
        attrs,
        vis,
        ident,
        methods,
    } = def;
    let client = format_ident!("{}Client", ident);
    let request = format_ident!("{}Request", ident);
    let dispatch = format_ident!("{}ServiceDispatch", ident);
    let serde = serde_derive();

    let mut trait_fns = Vec::new();
    let mut variants = Vec::new();
    let mut client_fns = Vec::new();
    let mut arms = Vec::new();
    for m in methods {
        let ServiceMethod {
            attrs,
            name,
            variant,
            args,
            ret,
        } = m;
        let names = m.arg_names();
        trait_fns.push(quote! {
            #( #attrs )*
            fn #name(&self, #( #args ),*) -> #ret;
        });
        variants.push(quote! { #variant { #( #args ),* } });
        client_fns.push(quote! {
            #( #attrs )*
            #[allow(unused)]
            #vis fn #name(&self, #( #args ),*) -> Result<#ret, may_service::Error> {
                let request = #request::#variant { #( #names ),* };
                self.service.call_serde(self.dest, &request)
            }
        });
        arms.push(quote! {
            #request::#variant { #( #names ),* } => {
                let ret = std::panic::catch_unwind(|| self.#name(#( #names ),*))
                    .map_err(|_| may_service::Error::Status("service panicked in handler!".to_owned()))?;
                may_service::bincode::serialize(&ret)
                    .map_err(|e| may_service::Error::Serialize(e.to_string()))
            }
        });
    }

    quote! {
        #( #attrs )*
        #vis trait #ident: Sized {
            #( #trait_fns )*
        }

        /// The request carried from the client service to the server service.
        #[allow(missing_docs)]
        #[derive(Debug)]
        #serde
        #vis enum #request {
            #( #variants ),*
        }

        /// The client stub, calls travel as sessions of the owning service.
        #[derive(Debug, Clone)]
        #vis struct #client {
            service: may_service::Service,
            dest: may_service::Addr,
        }

        impl #client {
            /// Returns a stub calling `dest` on behalf of `service`.
            #vis fn new(service: may_service::Service, dest: may_service::Addr) -> Self {
                Self { service, dest }
            }

            /// The address the calls go to.
            #vis fn dest(&self) -> may_service::Addr {
                self.dest
            }

            #( #client_fns )*
        }

        #vis trait #dispatch: #ident + std::panic::RefUnwindSafe {
            fn dispatch_req(&self, req: #request) -> Result<Vec<u8>, may_service::Error> {
                match req {
                    #( #arms )*
                }
            }
        }

        impl<T: #ident + std::panic::RefUnwindSafe> #dispatch for T {}
    }
}

/// A helper attribute to avoid a direct dependency on Serde.
///
/// Adds the following annotations to the annotated item:
///
/// ```rust
/// #[derive(may_service::serde::Serialize, may_service::serde::Deserialize)]
/// #[serde(crate = "may_service::serde")]
/// # struct Foo;
/// ```
#[proc_macro_attribute]
pub fn derive_serde(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut out = serde_derive();
    out.extend(TokenStream2::from(item));
    out.into()
}

/// Turns a trait into a typed service.
///
/// Generates, next to the trait itself:
/// - `<Trait>Request`, one variant per method
/// - `<Trait>Client`, calling another service through the `lua` protocol
/// - `<Trait>ServiceDispatch`, used by `#[derive(Server)]`
#[proc_macro_attribute]
pub fn service(attr: TokenStream, input: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(Span::call_site(), "may_service::service takes no arguments")
            .to_compile_error()
            .into();
    }
    let item = parse_macro_input!(input as ItemTrait);
    match lower_trait(item) {
        Ok(def) => expand_service(&def).into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> Path {
    let mut path = path.clone();
    if let Some(seg) = path.segments.last_mut() {
        seg.ident = format_ident!("{}{}", seg.ident, suffix, span = seg.ident.span());
    }
    path
}

/// Implements `may_service::Server` for a type implementing the trait named
/// by `#[service(Trait)]`.
#[proc_macro_derive(Server, attributes(service))]
pub fn derive_server(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as syn::DeriveInput);
    let ident = &ast.ident;

    let attr = ast.attrs.iter().find(|a| a.path().is_ident("service"));
    let service: Path = match attr.map(|a| a.parse_args()) {
        Some(Ok(p)) => p,
        Some(Err(e)) => return e.to_compile_error().into(),
        None => {
            return syn::Error::new(ident.span(), "expected `#[service(Trait)]`")
                .to_compile_error()
                .into()
        }
    };
    let dispatch = with_suffix(&service, "ServiceDispatch");
    let request = with_suffix(&service, "Request");

    quote!(
        impl may_service::Server for #ident {
            fn service(&self, req: &[u8]) -> Result<Vec<u8>, may_service::Error> {
                use #dispatch;
                let request: #request = may_service::bincode::deserialize(req)
                    .map_err(|e| may_service::Error::Deserialize(e.to_string()))?;
                self.dispatch_req(request)
            }
        }
    )
    .into()
}
