//! # shadestore
//!
//! Embedded key-value store in a single memory-mapped file.
//!
//! - Copy-on-write B+Tree over fixed-size pages; keys ordered bytewise
//! - Shadow paging: a commit is one meta page write, so a crash leaves
//!   either the old or the new generation, never a mix
//! - One writer, any number of readers; readers never wait
//! - Bidirectional cursors over a fixed snapshot
//!
//! ```no_run
//! use shadestore::ShadeStore;
//!
//! let db = ShadeStore::open("data.shade")?;
//! db.put(b"apple", b"red")?;
//!
//! db.update(|tx| {
//!     tx.put(b"banana", b"yellow")?;
//!     tx.delete(b"apple")?;
//!     Ok(())
//! })?;
//!
//! let mut cursor = db.first_cursor()?;
//! while let Some((key, value)) = cursor.key_value()? {
//!     println!("{key:?} = {value:?}");
//!     cursor.next()?;
//! }
//! # Ok::<(), shadestore::Error>(())
//! ```

#![warn(missing_docs)]

mod btree;
mod chain;
mod db;
mod error;
mod freelist;
mod mempool;
mod meta;
mod options;
mod page;
mod stats;
mod storage;
mod tx;

pub use btree::TreeReport;
pub use db::ShadeStore;
pub use error::{Error, ErrorCode, Result};
pub use meta::{FORMAT_VERSION, META_MAGIC};
pub use options::{Options, DEFAULT_MEMPOOL_CAPACITY};
pub use page::{os_page_size, PageId, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
pub use stats::Stats;
pub use tx::{CursorTx, Tx, TxMut};

/// Longest accepted key in bytes
pub const MAX_KEY_LEN: usize = 255;

/// Longest accepted value in bytes (10 MB)
pub const MAX_VALUE_LEN: usize = 10 * 1024 * 1024;
