// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::DeriveInput;
use syn::Field;
use syn::FieldsNamed;
use syn::FieldsUnnamed;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`trireme::stat::StatProvider`] implementation given a
/// struct of named fields of type [`trireme::stat::StatU64`].
///
/// ```Rust
/// #[derive(StatProvider)]
/// struct TrackerStats {
///     expired_in_handshake: StatU64,
///     expired_established: StatU64,
/// }
/// ```
///
/// This macro generates the following code based on the struct above.
///
/// ```Rust
/// #[derive(Clone, Debug, Default, Eq, PartialEq)]
/// pub struct TrackerStatsSnap {
///     pub expired_in_handshake: u64,
///     pub expired_established: u64,
/// }
///
/// impl StatProvider for TrackerStats {
///     const NUM_FIELDS: u32 = 2;
///     type Snap = TrackerStatsSnap;
///
///     fn new() -> Self {
///         Self {
///             expired_in_handshake: StatU64::new(),
///             expired_established: StatU64::new(),
///         }
///     }
///
///     fn snapshot(&self) -> Self::Snap { ... }
///
///     fn for_each(&self, f: &mut dyn FnMut(&'static str, u64)) { ... }
/// }
/// ````
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let DeriveInput { ident, data, .. } = parse_macro_input!(input);
    let fields: Vec<Field> = match data {
        syn::Data::Struct(s) => match s.fields {
            syn::Fields::Named(FieldsNamed { named, .. }) => {
                named.into_iter().collect()
            }

            syn::Fields::Unnamed(FieldsUnnamed { unnamed: _, .. }) => {
                panic!("A StatProvider cannot have unnamed fields");
            }

            syn::Fields::Unit => {
                panic!("A unit struct cannot be a StatProvider");
            }
        },

        _ => panic!("Only a struct may be a StatProvider"),
    };

    let num_fields = fields.len() as u32;
    let fields_ident: Vec<Ident> =
        fields.iter().filter_map(|f| f.ident.clone()).collect();
    let ident_snap = format_ident!("{}Snap", ident);

    let output = quote! {
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct #ident_snap {
            #( pub #fields_ident: u64, )*
        }

        impl ::trireme::stat::StatProvider for #ident {
            const NUM_FIELDS: u32 = #num_fields;
            type Snap = #ident_snap;

            fn new() -> Self {
                use ::trireme::stat::StatU64;

                Self {
                    #( #fields_ident: StatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #ident_snap {
                    #( #fields_ident: self.#fields_ident.val(), )*
                }
            }

            fn for_each(&self, f: &mut dyn FnMut(&'static str, u64)) {
                #( f(stringify!(#fields_ident), self.#fields_ident.val()); )*
            }
        }
    };

    output.into()
}
