//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. Use these for every sensitive
//! value: API keys, signing secrets, credential material. `SecretString`
//! and `SecretBox<T>` implement `Debug` with redaction, so structs that
//! derive `Debug` cannot leak secrets through `{:?}` or tracing fields,
//! and the wrapped value is zeroized on drop.
//!
//! Access to the inner value always goes through an explicit
//! [`ExposeSecret::expose_secret`] call at the use site.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
