use proc_macro::{self, TokenStream};
use proc_macro2::TokenTree;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

///
/// A derive macro which implements the Persistable save/load functions
/// for a serde-serializable record.
///
/// Records are written as pretty JSON into a directory chosen by the
/// caller. The optional attribute persist_with_name names a method which
/// returns the file name of the record inside that directory, for example
/// `{id}.json` for a firmware record. It should have the signature:
///
/// ```ignore
/// pub fn method_name(&self) -> String
/// ```
///
/// Without the attribute the lower-cased type name plus `.json` is used.
///
/// usage:
/// ```ignore
/// #[derive(Persistable)]
/// #[persist_with_name(record_file_name)]
/// ```
///
#[proc_macro_derive(Persistable, attributes(persist_with_name))]
pub fn persistable(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, attrs, .. } = parse_macro_input!(input);
    let mut with_name_method = None;
    // If the struct has an attribute persist_with_name, read it and get the Ident
    // of the method it names
    for attr in attrs {
        if attr.path.is_ident("persist_with_name") {
            for tokentree in attr.tokens.into_iter() {
                if let TokenTree::Group(group) = tokentree {
                    for subtokentree in group.stream().into_iter() {
                        if let TokenTree::Ident(method) = subtokentree {
                            with_name_method = Some(method);
                        }
                    }
                }
            }
        }
    }
    let default_name = format!("{}.json", ident.to_string().to_lowercase());
    let persisted_name_token_stream = match with_name_method {
        Some(method) => quote! { self.#method() },
        None => quote! { String::from(#default_name) },
    };
    let output = quote! {
        impl crate::storage::Persistable for #ident {
            fn persisted_name(&self) -> String {
                #persisted_name_token_stream
            }
            fn save(&self, dir: &std::path::Path) -> std::io::Result<std::path::PathBuf> {
                let serialized = serde_json::to_vec_pretty(&self)?;
                let filename = dir.join(self.persisted_name());
                crate::storage::Storage::write(&serialized, &filename)?;
                Ok(filename)
            }
            fn load(path: &std::path::Path) -> std::io::Result<Self> {
                let serialized = crate::storage::Storage::read(path)?;
                let out = serde_json::from_slice(&serialized[..])?;
                Ok(out)
            }
        }
    };
    output.into()
}
