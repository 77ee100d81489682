//! # Strongbox Core Library
//!
//! This crate provides the storage/crypto engine behind the `strongbox`
//! command-line tool: an encrypted, append-only virtual archive ("safe")
//! that stores a hierarchy of named byte blobs under password-derived
//! encryption, with copy-on-write updates and a built-in tamper-evidence
//! hash.
//!
//! ## Key Modules
//!
//! - [`safe`]: The archive orchestrator: container format, open/create,
//!   the add/delete/save/discard lifecycle and the integrity hash.
//! - [`index`]: The in-memory path index (directories, wildcards,
//!   sanitization).
//! - [`crypto`]: Key derivation and the streaming AES-CBC cipher.
//! - [`codec`]: Chunked copy/encrypt/decrypt between files and streams.
//! - [`progress`]: Cooperative cancellation and progress probes.
//!
//! ## Example
//!
//! ```no_run
//! use strongbox::{Probe, PropertyMap, Safe};
//! use serde_json::Value;
//!
//! # fn main() -> Result<(), strongbox::SafeError> {
//! let safe = Safe::create("vault.sbx", "password", PropertyMap::new(), PropertyMap::new())?;
//! let mut meta = PropertyMap::new();
//! meta.insert("id".into(), Value::String("/docs/notes.txt".into()));
//! meta.insert("name".into(), Value::String("notes.txt".into()));
//! safe.add(meta, &mut "hello".as_bytes(), &Probe::new())?;
//! let safe = safe.save(&Probe::new())?;
//! # drop(safe);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod index;
pub mod progress;
pub mod record;
pub mod safe;

pub use error::SafeError;
pub use progress::Probe;
pub use record::{PropertyMap, Record, PROP_ID, PROP_NAME};
pub use safe::Safe;
