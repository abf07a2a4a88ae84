//! `bendo` is a versioned, content-addressed object store that fronts a
//! slow archival backend with a fast cache. Clients stage files in
//! fragments, commit them atomically against a logical *item*, and later
//! read any historical version. An item is a versioned directory: a
//! sequence of immutable snapshots mapping slot names to blob contents,
//! serialized on disk as numbered, append-only archive containers
//! (*bundles*) over a flat key/value store. Content is deduplicated by
//! hash within an item, and a background fixity scheduler re-verifies
//! everything on tape over time.
//!
//! ## Getting started
//!
//! ```rust
//! use std::io::{Read, Write};
//! use std::sync::Arc;
//!
//! use bendo::config::Config;
//! use bendo::content::Content;
//! use bendo::error::Error;
//! use bendo::server::Server;
//! use bendo::store::memory::Memory;
//! use bendo::tx::Command;
//!
//! fn main() -> Result<(), Error> {
//!     let server = Server::new(Config::default(), Arc::new(Memory::new()))?;
//!     server.start()?;
//!
//!     // Stage a file.
//!     let upload = server.new_upload("alice")?;
//!     let mut w = upload.append()?;
//!     w.write_all(b"hello world")?;
//!     w.close()?;
//!
//!     // Commit it to an item and bind a slot name to it.
//!     let tx = server.create_transaction(
//!         "demo",
//!         "alice",
//!         vec![
//!             Command::Add(upload.id().to_string()),
//!             Command::Slot("greeting".into(), upload.id().to_string()),
//!         ],
//!     )?;
//!     loop {
//!         match server.transaction(&tx)? {
//!             Some(rec) if rec.status.terminal() => break,
//!             Some(_) => std::thread::sleep(std::time::Duration::from_millis(10)),
//!             None => break,
//!         }
//!     }
//!
//!     // Read it back through the cache.
//!     let (bid, content) = server.slot_content("demo", "greeting")?;
//!     assert_eq!(bid, 1);
//!     if let Content::Cached { mut reader, size } = content {
//!         let mut text = String::new();
//!         reader.read_to_string(&mut text)?;
//!         assert_eq!(size, 11);
//!         assert_eq!(text, "hello world");
//!     }
//!
//!     server.stop();
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod cache;
pub mod config;
pub mod content;
pub mod error;
pub mod fixity;
pub mod hash;
pub mod item;
pub mod server;
pub mod store;
pub mod task;
pub mod tx;
pub mod upload;
