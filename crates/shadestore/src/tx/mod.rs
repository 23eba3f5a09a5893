//! Transactions and cursors
//!
//! - [`Tx`]: read-only view of one committed generation
//! - [`TxMut`]: the single write transaction; changes are staged on shadow
//!   pages and published by [`TxMut::commit`]
//! - [`CursorTx`]: positioned traversal over its own snapshot
//!
//! None of them can be sent to another thread.

mod snapshot;
mod staging;

pub(crate) use snapshot::{PageView, SnapshotState};
pub(crate) use staging::WriterState;

use std::fmt;
use std::marker::PhantomData;

use tracing::warn;

use crate::btree::{BTree, Cursor, TreeReport};
use crate::db::ShadeStore;
use crate::error::{Error, Result};
use crate::{MAX_KEY_LEN, MAX_VALUE_LEN};

use snapshot::Snapshot;
use staging::Staging;

/// Keeps a handle on the thread that created it.
type NotSend = PhantomData<*const ()>;

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLarge(key.len()));
    }
    Ok(())
}

fn check_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::ValueTooLarge(value.len()));
    }
    Ok(())
}

/// Read-only transaction
///
/// Sees the generation that was current when it started, no matter what
/// commits later. Holding it keeps the pages of that generation from being
/// reused, so long-lived transactions make the file grow.
pub struct Tx<'db> {
    snapshot: Snapshot<'db>,
    _not_send: NotSend,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(db: &'db ShadeStore) -> Self {
        Tx {
            snapshot: Snapshot::new(db),
            _not_send: PhantomData,
        }
    }

    /// Generation this transaction reads.
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    /// Whether `key` exists.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        BTree::new(&self.snapshot).contains(key)
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        BTree::new(&self.snapshot).get(key)
    }

    /// Cursor at the smallest key of this generation.
    pub fn first_cursor(&self) -> Result<CursorTx<'db>> {
        CursorTx::first(self.snapshot.fork())
    }

    /// Cursor at the largest key of this generation.
    pub fn last_cursor(&self) -> Result<CursorTx<'db>> {
        CursorTx::last(self.snapshot.fork())
    }

    /// Cursor at the smallest key `>= key`.
    pub fn cursor_from_key(&self, key: &[u8]) -> Result<CursorTx<'db>> {
        CursorTx::from_key(self.snapshot.fork(), key)
    }

    /// Walk the whole tree and check its structure.
    pub fn verify(&self) -> Result<TreeReport> {
        BTree::new(&self.snapshot).verify()
    }
}

impl fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("generation", &self.generation())
            .finish()
    }
}

/// Read-write transaction
///
/// Only one exists per database at a time. Dropping it without
/// [`TxMut::commit`] discards every change.
///
/// A `put` or `delete` that fails past the key and value checks may leave
/// the staged tree half updated. The transaction is then aborted: every
/// later `put`, `delete` and `commit` fails, and dropping it rolls back.
pub struct TxMut<'db> {
    staging: Staging<'db>,
    aborted: bool,
    _not_send: NotSend,
}

impl<'db> TxMut<'db> {
    pub(crate) fn new(db: &'db ShadeStore) -> Self {
        TxMut {
            staging: Staging::new(db),
            aborted: false,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn try_new(db: &'db ShadeStore) -> Option<Self> {
        Staging::try_new(db).map(|staging| TxMut {
            staging,
            aborted: false,
            _not_send: PhantomData,
        })
    }

    /// Whether `key` exists, including uncommitted changes.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        BTree::new(&self.staging).contains(key)
    }

    /// Value stored under `key`, including uncommitted changes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        BTree::new(&self.staging).get(key)
    }

    /// Insert or overwrite `key`.
    ///
    /// Fails without changing anything when the key or value is too large.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_live()?;
        check_key(key)?;
        check_value(value)?;
        let result = BTree::new(&mut self.staging).put(key, value);
        self.abort_on_error(result)
    }

    /// Remove `key`; `false` when it was not there.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.check_live()?;
        check_key(key)?;
        let result = BTree::new(&mut self.staging).delete(key);
        self.abort_on_error(result)
    }

    /// Publish the changes as a new generation.
    ///
    /// Fails, rolling back, when an earlier `put` or `delete` aborted the
    /// transaction.
    pub fn commit(self) -> Result<()> {
        self.check_live()?;
        self.staging.commit()
    }

    /// Discard the changes. Same as dropping the transaction.
    pub fn rollback(self) {
        drop(self);
    }
}

impl TxMut<'_> {
    fn check_live(&self) -> Result<()> {
        if self.aborted {
            return Err(Error::Internal(
                "write transaction aborted by an earlier error".into(),
            ));
        }
        Ok(())
    }

    fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            warn!(error = %err, "write transaction aborted");
            self.aborted = true;
        }
        result
    }
}

impl fmt::Debug for TxMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxMut")
            .field("aborted", &self.aborted)
            .finish_non_exhaustive()
    }
}

/// Cursor over one committed generation
///
/// A cursor is its own read-only transaction. Once it moves past either
/// end it stays exhausted: `next` and `prev` return `false` and the
/// accessors return `None`. Use [`CursorTx::seek`] to reposition.
pub struct CursorTx<'db> {
    snapshot: Snapshot<'db>,
    cursor: Cursor,
    _not_send: NotSend,
}

impl<'db> CursorTx<'db> {
    fn first(snapshot: Snapshot<'db>) -> Result<Self> {
        let cursor = Cursor::first(&BTree::new(&snapshot))?;
        Ok(Self::wrap(snapshot, cursor))
    }

    fn last(snapshot: Snapshot<'db>) -> Result<Self> {
        let cursor = Cursor::last(&BTree::new(&snapshot))?;
        Ok(Self::wrap(snapshot, cursor))
    }

    fn from_key(snapshot: Snapshot<'db>, key: &[u8]) -> Result<Self> {
        let cursor = Cursor::seek(&BTree::new(&snapshot), key)?;
        Ok(Self::wrap(snapshot, cursor))
    }

    fn wrap(snapshot: Snapshot<'db>, cursor: Cursor) -> Self {
        CursorTx {
            snapshot,
            cursor,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn first_in(db: &'db ShadeStore) -> Result<Self> {
        Self::first(Snapshot::new(db))
    }

    pub(crate) fn last_in(db: &'db ShadeStore) -> Result<Self> {
        Self::last(Snapshot::new(db))
    }

    pub(crate) fn from_key_in(db: &'db ShadeStore, key: &[u8]) -> Result<Self> {
        Self::from_key(Snapshot::new(db), key)
    }

    /// Generation the cursor reads.
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    /// Whether the cursor moved past either end.
    pub fn is_exhausted(&self) -> bool {
        self.cursor.is_exhausted()
    }

    /// Key at the current position.
    pub fn key(&self) -> Option<&[u8]> {
        self.cursor.entry().map(|entry| entry.key.as_slice())
    }

    /// Value at the current position.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        match self.cursor.entry() {
            Some(entry) => BTree::new(&self.snapshot).load_value(&entry.value).map(Some),
            None => Ok(None),
        }
    }

    /// Key and value at the current position.
    pub fn key_value(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self.cursor.entry() {
            Some(entry) => {
                let value = BTree::new(&self.snapshot).load_value(&entry.value)?;
                Ok(Some((entry.key.clone(), value)))
            }
            None => Ok(None),
        }
    }

    /// Move to the next key; `false` once past the largest.
    pub fn next(&mut self) -> Result<bool> {
        self.cursor.next(&BTree::new(&self.snapshot))
    }

    /// Move to the previous key; `false` once before the smallest.
    pub fn prev(&mut self) -> Result<bool> {
        self.cursor.prev(&BTree::new(&self.snapshot))
    }

    /// Reposition at the smallest key `>= key`; `false` when there is none.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        self.cursor = Cursor::seek(&BTree::new(&self.snapshot), key)?;
        Ok(!self.cursor.is_exhausted())
    }

    /// Whether `key` exists in the cursor's generation.
    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        BTree::new(&self.snapshot).contains(key)
    }

    /// Value stored under `key` in the cursor's generation.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        BTree::new(&self.snapshot).get(key)
    }
}

impl fmt::Debug for CursorTx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorTx")
            .field("generation", &self.generation())
            .field("key", &self.key())
            .finish()
    }
}
