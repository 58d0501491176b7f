//! presence-store: durable storage for the presence engine.
//!
//! [`SqliteRepository`] implements [`presence_core::Repository`] on SQLite;
//! face templates can be sealed at rest with a [`TemplateKey`].

pub mod codec;
pub mod sqlite;

pub use codec::{CodecError, TemplateCodec, TemplateKey};
pub use sqlite::{SqliteRepository, StoreError};
