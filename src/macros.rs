//! # Internal Macros
//!
//! ## table_row!
//!
//! Declares a table row struct and derives its [`TableRow`] access layer:
//! the schema string recorded in the table metadata and the by-name field
//! accessor the index maintenance and query filtering paths use.
//!
//! ```ignore
//! table_row! {
//!     pub struct Phone {
//!         pub Id: u64,
//!         pub Name: String,
//!         pub Phone: String,
//!     }
//! }
//! ```
//!
//! Field names are significant: the overlay expects the primary key in a
//! field named `Id`, and index definitions refer to fields by name. Every
//! field type must convert into [`IndexValue`].
//!
//! [`TableRow`]: crate::TableRow
//! [`IndexValue`]: crate::IndexValue

/// Declares a row struct and implements `TableRow` for it.
#[macro_export]
macro_rules! table_row {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($fvis:vis $field:ident : $ty:ty),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Default,
            PartialEq,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[allow(non_snake_case)]
        $vis struct $name {
            $($fvis $field : $ty),+
        }

        impl $crate::TableRow for $name {
            fn table_schema() -> ::std::string::String {
                [$(::std::concat!(
                    ::std::stringify!($field),
                    " ",
                    ::std::stringify!($ty)
                )),+]
                .join(",")
            }

            fn field(&self, name: &str) -> ::std::option::Option<$crate::IndexValue> {
                match name {
                    $(
                        ::std::stringify!($field) => ::std::option::Option::Some(
                            $crate::IndexValue::from(self.$field.clone()),
                        ),
                    )+
                    _ => ::std::option::Option::None,
                }
            }
        }
    };
}
