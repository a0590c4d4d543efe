//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `database` module provides high-level functions for storing and
//! retrieving blocks and plain key/value pairs in a SQLite database. All of
//! the SQL in the crate lives here, including the pack selection statement
//! that advances blocks through the pack pipeline.

use super::core::{Block, ConflictError, Key, NotFoundError, PackStatus, Query, QueryEntry};
use chrono::prelude::*;
use failure::Error;
use log::debug;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

///
/// An instance of the database for reading and writing records to disk. The
/// instance can be shared across threads by cloning; all clones use the same
/// underlying connection.
///
pub struct Database {
    /// SQLite connection, shared with the packer thread.
    conn: Arc<Mutex<Connection>>,
    /// Path to the database file.
    path: PathBuf,
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            path: self.path.clone(),
        }
    }
}

impl Database {
    ///
    /// Create an instance of Database using the given path for storage,
    /// creating the schema if it does not yet exist.
    ///
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, Error> {
        let conn = Connection::open(db_path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                 cid         TEXT PRIMARY KEY,
                 size        INTEGER NOT NULL,
                 data        BLOB,
                 deleted     INTEGER NOT NULL DEFAULT 0,
                 pack_status INTEGER NOT NULL DEFAULT 0,
                 pack_object TEXT NOT NULL DEFAULT '',
                 pack_offset INTEGER NOT NULL DEFAULT 0,
                 created     TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS datastore (
                 key  TEXT PRIMARY KEY,
                 data BLOB NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.as_ref().to_path_buf(),
        })
    }

    ///
    /// Return the path to the database file.
    ///
    pub fn get_path(&self) -> &Path {
        self.path.as_ref()
    }

    ///
    /// Insert a block in the unpacked state. If a block with the same CID
    /// already exists, only its tombstone flag is cleared; the pack state of
    /// the resident row is left untouched so a previously packed block can
    /// be resurrected without re-uploading anything.
    ///
    pub fn put_block(&self, cid: &str, data: &[u8]) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "INSERT INTO blocks (cid, size, data, created)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (cid) DO UPDATE SET deleted = 0",
            params![cid, data.len() as i64, data, Utc::now()],
        )?;
        if affected != 1 {
            return Err(ConflictError {
                expected: 1,
                actual: affected,
            }
            .into());
        }
        Ok(())
    }

    ///
    /// Retrieve the block with the given CID. Both a missing row and a
    /// tombstoned row surface as `NotFoundError`.
    ///
    pub fn get_block(&self, cid: &str) -> Result<Block, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT size, data, deleted, pack_status, pack_object, pack_offset, created
             FROM blocks
             WHERE cid = ?1",
            params![cid],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, DateTime<Utc>>(6)?,
                ))
            },
        );
        match result {
            Ok((size, data, deleted, status, pack_object, pack_offset, created)) => {
                if deleted {
                    return Err(NotFoundError.into());
                }
                Ok(Block {
                    cid: cid.to_owned(),
                    size: size as u64,
                    data,
                    deleted,
                    pack_status: PackStatus::from_i64(status)?,
                    pack_object,
                    pack_offset: pack_offset as u64,
                    created,
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(NotFoundError.into()),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Return `true` if a non-deleted block with the given CID exists.
    ///
    pub fn has_block(&self, cid: &str) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT deleted FROM blocks WHERE cid = ?1",
            params![cid],
            |row| row.get::<_, bool>(0),
        );
        match result {
            Ok(deleted) => Ok(!deleted),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Return the size of the block with the given CID, without reading any
    /// block bytes. Tombstone semantics match `get_block()`.
    ///
    pub fn get_block_size(&self, cid: &str) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT size, deleted FROM blocks WHERE cid = ?1",
            params![cid],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?)),
        );
        match result {
            Ok((size, deleted)) => {
                if deleted {
                    Err(NotFoundError.into())
                } else {
                    Ok(size as u64)
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(NotFoundError.into()),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Delete the block with the given CID. An unpacked block is removed
    /// outright; a block that has entered the pack pipeline is tombstoned,
    /// as its pack object is immutable and will be garbage collected later.
    /// Deleting a missing block is not an error.
    ///
    pub fn delete_block(&self, cid: &str) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM blocks
             WHERE cid = ?1 AND pack_status = 0",
            params![cid],
        )?;
        let marked = tx.execute(
            "UPDATE blocks SET deleted = 1
             WHERE cid = ?1 AND pack_status > 0",
            params![cid],
        )?;
        // at most one statement can touch the row; zero is a repeat delete
        if removed + marked > 1 {
            return Err(ConflictError {
                expected: 1,
                actual: removed + marked,
            }
            .into());
        }
        tx.commit()?;
        Ok(())
    }

    ///
    /// Select the blocks that form the next pack, flipping them from
    /// unpacked to packing in a single statement. The selection is the
    /// largest prefix of the unpacked queue, ordered by insertion time with
    /// ties broken on the CID, whose cumulative size fits `max_size` and
    /// whose length fits `max_blocks`. Nothing is selected unless that
    /// prefix reaches `min_size` in total. Returns the number of selected
    /// blocks.
    ///
    pub fn select_next_pack(
        &self,
        min_size: u64,
        max_size: u64,
        max_blocks: u64,
    ) -> Result<usize, Error> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "WITH queue AS (
                 SELECT cid,
                        SUM(size) OVER (ORDER BY created, cid) AS running,
                        ROW_NUMBER() OVER (ORDER BY created, cid) AS pos
                 FROM blocks
                 WHERE pack_status = 0
             ),
             next_pack AS (
                 SELECT cid, running
                 FROM queue
                 WHERE running <= ?2 AND pos <= ?3
             )
             UPDATE blocks
             SET pack_status = 1
             WHERE ?1 <= (SELECT max(running) FROM next_pack)
               AND cid IN (SELECT cid FROM next_pack)",
            params![min_size as i64, max_size as i64, max_blocks as i64],
        )?;
        debug!("select_next_pack: affected {} rows", affected);
        Ok(affected)
    }

    ///
    /// Fetch the CID and inline data of every block in the packing state,
    /// in the same order used by the selection. A non-empty result with a
    /// fresh selection count of zero means a previous cycle failed after
    /// selection and its batch is being retried.
    ///
    pub fn fetch_packing_blocks(&self) -> Result<Vec<(String, Option<Vec<u8>>)>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cid, data
             FROM blocks
             WHERE pack_status = 1
             ORDER BY created, cid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<Vec<u8>>>(1)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    ///
    /// Record the result of a pack upload: every listed block moves from
    /// packing to packed, its offset within the pack object is recorded,
    /// and its inline data is cleared. Runs in a single transaction; a
    /// block that is no longer in the packing state aborts the whole
    /// commit, leaving the batch for the next cycle.
    ///
    pub fn update_packed_blocks(
        &self,
        pack_object: &str,
        offsets: &[(String, u64)],
    ) -> Result<(), Error> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for (cid, offset) in offsets {
            let affected = tx.execute(
                "UPDATE blocks
                 SET pack_status = 2,
                     pack_object = ?1,
                     pack_offset = ?2,
                     data = NULL
                 WHERE cid = ?3 AND pack_status = 1",
                params![pack_object, *offset as i64, cid],
            )?;
            if affected != 1 {
                return Err(ConflictError {
                    expected: 1,
                    actual: affected,
                }
                .into());
            }
            debug!(
                "update_packed_blocks: {} packed in {} at offset {}",
                cid, pack_object, offset
            );
        }
        tx.commit()?;
        Ok(())
    }

    ///
    /// Enumerate non-deleted blocks whose CID starts with the given prefix,
    /// in CID order. The inline data column is returned as-is; packed
    /// blocks yield `None` and the caller fetches ranges if it needs the
    /// bytes.
    ///
    pub fn query_blocks(
        &self,
        cid_prefix: &str,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Block>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cid, size, data, pack_status, pack_object, pack_offset, created
             FROM blocks
             WHERE deleted = 0 AND cid LIKE ?1 || '%'
             ORDER BY cid
             LIMIT ?2 OFFSET ?3",
        )?;
        let lim: i64 = if limit == 0 { -1 } else { limit as i64 };
        let rows = stmt.query_map(params![cid_prefix, lim, offset as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, DateTime<Utc>>(6)?,
            ))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (cid, size, data, status, pack_object, pack_offset, created) = row?;
            results.push(Block {
                cid,
                size: size as u64,
                data,
                deleted: false,
                pack_status: PackStatus::from_i64(status)?,
                pack_object,
                pack_offset: pack_offset as u64,
                created,
            });
        }
        Ok(results)
    }

    //
    // The remaining functions operate on the plain key/value table, which
    // holds everything the host stores outside of the block namespace.
    //

    ///
    /// Put the key/value pair into the datastore table, replacing any
    /// existing value.
    ///
    pub fn put(&self, key: &Key, value: &[u8]) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO datastore (key, data) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET data = excluded.data",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    ///
    /// Retrieve the value with the given key.
    ///
    pub fn get(&self, key: &Key) -> Result<Vec<u8>, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT data FROM datastore WHERE key = ?1",
            params![key.as_str()],
            |row| row.get::<_, Vec<u8>>(0),
        );
        match result {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(NotFoundError.into()),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Return `true` if a value exists for the given key.
    ///
    pub fn has(&self, key: &Key) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT 1 FROM datastore WHERE key = ?1",
            params![key.as_str()],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Return the size of the value with the given key.
    ///
    pub fn get_size(&self, key: &Key) -> Result<u64, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT length(data) FROM datastore WHERE key = ?1",
            params![key.as_str()],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(size) => Ok(size as u64),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(NotFoundError.into()),
            Err(err) => Err(err.into()),
        }
    }

    ///
    /// Delete the value with the given key. Deleting a missing key is not
    /// an error.
    ///
    pub fn delete(&self, key: &Key) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM datastore WHERE key = ?1",
            params![key.as_str()],
        )?;
        Ok(())
    }

    ///
    /// Enumerate entries of the datastore table matching the query prefix,
    /// in key order.
    ///
    pub fn query(&self, query: &Query) -> Result<Vec<QueryEntry>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, data
             FROM datastore
             WHERE key LIKE ?1 || '/%' OR key = ?1
             ORDER BY key
             LIMIT ?2 OFFSET ?3",
        )?;
        let lim: i64 = if query.limit == 0 { -1 } else { query.limit as i64 };
        let prefix = if query.prefix.as_str() == "/" {
            // every key is under the root
            String::new()
        } else {
            query.prefix.as_str().to_owned()
        };
        let rows = stmt.query_map(params![prefix, lim, query.offset as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut results = Vec::new();
        for row in rows {
            let (key, data) = row?;
            results.push(QueryEntry {
                key: Key::new(key),
                size: data.len() as u64,
                value: if query.keys_only { None } else { Some(data) },
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::is_not_found;
    use tempfile::tempdir;

    fn open_database() -> (tempfile::TempDir, Database) {
        let outdir = tempdir().unwrap();
        let dbase = Database::new(outdir.path().join("database.db")).unwrap();
        (outdir, dbase)
    }

    // Insert a block with an explicit created value, for tests that need
    // full control over the queue order.
    fn insert_block_at(dbase: &Database, cid: &str, size: usize, created: &str) {
        let data = vec![0x5au8; size];
        let conn = dbase.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO blocks (cid, size, data, created) VALUES (?1, ?2, ?3, ?4)",
            params![cid, size as i64, data, created],
        )
        .unwrap();
    }

    fn count_rows(dbase: &Database) -> i64 {
        let conn = dbase.conn.lock().unwrap();
        conn.query_row("SELECT count(*) FROM blocks", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_put_get_block() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("deadbeef", b"cafebabe")?;
        let block = dbase.get_block("deadbeef")?;
        assert_eq!(block.cid, "deadbeef");
        assert_eq!(block.size, 8);
        assert_eq!(block.data.as_deref(), Some(&b"cafebabe"[..]));
        assert!(!block.deleted);
        assert_eq!(block.pack_status, PackStatus::UNPACKED);
        assert_eq!(block.pack_object, "");
        assert_eq!(block.pack_offset, 0);
        assert!(dbase.has_block("deadbeef")?);
        assert_eq!(dbase.get_block_size("deadbeef")?, 8);
        Ok(())
    }

    #[test]
    fn test_get_block_missing() {
        let (_outdir, dbase) = open_database();
        let err = dbase.get_block("nonesuch").unwrap_err();
        assert!(is_not_found(&err));
        assert!(!dbase.has_block("nonesuch").unwrap());
        let err = dbase.get_block_size("nonesuch").unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_delete_block_unpacked() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("deadbeef", b"cafebabe")?;
        assert_eq!(count_rows(&dbase), 1);
        dbase.delete_block("deadbeef")?;
        // unpacked blocks are physically removed
        assert_eq!(count_rows(&dbase), 0);
        assert!(!dbase.has_block("deadbeef")?);
        // repeated delete is fine
        dbase.delete_block("deadbeef")?;
        Ok(())
    }

    #[test]
    fn test_delete_block_packed() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("deadbeef", b"cafebabe")?;
        dbase.select_next_pack(1, 100, 10)?;
        dbase.update_packed_blocks("pack-1", &[(String::from("deadbeef"), 0)])?;
        dbase.delete_block("deadbeef")?;
        // the row is retained as a tombstone until the pack is collected
        assert_eq!(count_rows(&dbase), 1);
        assert!(!dbase.has_block("deadbeef")?);
        let err = dbase.get_block("deadbeef").unwrap_err();
        assert!(is_not_found(&err));
        let err = dbase.get_block_size("deadbeef").unwrap_err();
        assert!(is_not_found(&err));
        dbase.delete_block("deadbeef")?;
        Ok(())
    }

    #[test]
    fn test_put_block_resurrection() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("deadbeef", b"cafebabe")?;
        dbase.select_next_pack(1, 100, 10)?;
        dbase.update_packed_blocks("pack-1", &[(String::from("deadbeef"), 0)])?;
        dbase.delete_block("deadbeef")?;
        assert!(!dbase.has_block("deadbeef")?);
        // re-insert clears the tombstone without touching pack state
        dbase.put_block("deadbeef", b"cafebabe")?;
        let block = dbase.get_block("deadbeef")?;
        assert_eq!(block.pack_status, PackStatus::PACKED);
        assert_eq!(block.pack_object, "pack-1");
        assert!(block.data.is_none());
        assert_eq!(count_rows(&dbase), 1);
        Ok(())
    }

    #[test]
    fn test_select_below_minimum() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("block-1", &[0x11; 40])?;
        dbase.put_block("block-2", &[0x22; 40])?;
        // 80 bytes in the queue is not worth a 100 byte pack
        let affected = dbase.select_next_pack(100, 200, 10)?;
        assert_eq!(affected, 0);
        let block = dbase.get_block("block-1")?;
        assert_eq!(block.pack_status, PackStatus::UNPACKED);
        Ok(())
    }

    #[test]
    fn test_select_reaches_minimum() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("block-1", &[0x11; 40])?;
        dbase.put_block("block-2", &[0x22; 40])?;
        dbase.put_block("block-3", &[0x33; 40])?;
        let affected = dbase.select_next_pack(100, 200, 10)?;
        assert_eq!(affected, 3);
        for cid in &["block-1", "block-2", "block-3"] {
            assert_eq!(dbase.get_block(cid)?.pack_status, PackStatus::PACKING);
        }
        Ok(())
    }

    #[test]
    fn test_select_respects_max_size() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        insert_block_at(&dbase, "block-1", 80, "2020-05-01T00:00:01+00:00");
        insert_block_at(&dbase, "block-2", 80, "2020-05-01T00:00:02+00:00");
        insert_block_at(&dbase, "block-3", 80, "2020-05-01T00:00:03+00:00");
        let affected = dbase.select_next_pack(100, 200, 10)?;
        // only the first two fit under the 200 byte cap
        assert_eq!(affected, 2);
        assert_eq!(dbase.get_block("block-1")?.pack_status, PackStatus::PACKING);
        assert_eq!(dbase.get_block("block-2")?.pack_status, PackStatus::PACKING);
        assert_eq!(
            dbase.get_block("block-3")?.pack_status,
            PackStatus::UNPACKED
        );
        Ok(())
    }

    #[test]
    fn test_select_respects_max_blocks() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        for idx in 1..=5 {
            insert_block_at(
                &dbase,
                &format!("block-{}", idx),
                10,
                &format!("2020-05-01T00:00:0{}+00:00", idx),
            );
        }
        let affected = dbase.select_next_pack(10, 1000, 3)?;
        assert_eq!(affected, 3);
        assert_eq!(dbase.get_block("block-3")?.pack_status, PackStatus::PACKING);
        assert_eq!(
            dbase.get_block("block-4")?.pack_status,
            PackStatus::UNPACKED
        );
        Ok(())
    }

    #[test]
    fn test_select_ordering_deterministic() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        // identical timestamps, so the tie breaks on the CID
        insert_block_at(&dbase, "block-c", 10, "2020-05-01T00:00:01+00:00");
        insert_block_at(&dbase, "block-a", 10, "2020-05-01T00:00:01+00:00");
        insert_block_at(&dbase, "block-b", 10, "2020-05-01T00:00:02+00:00");
        let affected = dbase.select_next_pack(20, 20, 10)?;
        assert_eq!(affected, 2);
        assert_eq!(dbase.get_block("block-a")?.pack_status, PackStatus::PACKING);
        assert_eq!(dbase.get_block("block-c")?.pack_status, PackStatus::PACKING);
        assert_eq!(
            dbase.get_block("block-b")?.pack_status,
            PackStatus::UNPACKED
        );
        let ordered = dbase.fetch_packing_blocks()?;
        let cids: Vec<&str> = ordered.iter().map(|(cid, _)| cid.as_str()).collect();
        assert_eq!(cids, vec!["block-a", "block-c"]);
        Ok(())
    }

    #[test]
    fn test_update_packed_blocks() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("block-1", &[0x11; 40])?;
        dbase.put_block("block-2", &[0x22; 40])?;
        dbase.select_next_pack(80, 200, 10)?;
        let packing = dbase.fetch_packing_blocks()?;
        assert_eq!(packing.len(), 2);
        dbase.update_packed_blocks(
            "pack-1",
            &[
                (String::from("block-1"), 0),
                (String::from("block-2"), 40),
            ],
        )?;
        let block = dbase.get_block("block-2")?;
        assert_eq!(block.pack_status, PackStatus::PACKED);
        assert_eq!(block.pack_object, "pack-1");
        assert_eq!(block.pack_offset, 40);
        assert!(block.data.is_none());
        assert!(dbase.fetch_packing_blocks()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_update_packed_blocks_conflict() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("block-1", &[0x11; 40])?;
        // block-1 was never selected, so the commit must fail and roll back
        let result =
            dbase.update_packed_blocks("pack-1", &[(String::from("block-1"), 0)]);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ConflictError>().is_some());
        let block = dbase.get_block("block-1")?;
        assert_eq!(block.pack_status, PackStatus::UNPACKED);
        assert!(block.data.is_some());
        Ok(())
    }

    #[test]
    fn test_query_blocks() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put_block("abc-1", b"one")?;
        dbase.put_block("abc-2", b"two")?;
        dbase.put_block("xyz-1", b"three")?;
        dbase.delete_block("abc-2")?;
        let results = dbase.query_blocks("abc", 0, 0)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cid, "abc-1");
        let results = dbase.query_blocks("", 0, 0)?;
        assert_eq!(results.len(), 2);
        let results = dbase.query_blocks("", 1, 1)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cid, "xyz-1");
        Ok(())
    }

    #[test]
    fn test_datastore_roundtrip() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        let key = Key::new("/pins/mydata");
        dbase.put(&key, b"first")?;
        dbase.put(&key, b"second")?;
        assert_eq!(dbase.get(&key)?, b"second");
        assert!(dbase.has(&key)?);
        assert_eq!(dbase.get_size(&key)?, 6);
        dbase.delete(&key)?;
        assert!(!dbase.has(&key)?);
        let err = dbase.get(&key).unwrap_err();
        assert!(is_not_found(&err));
        // repeated delete is fine
        dbase.delete(&key)?;
        Ok(())
    }

    #[test]
    fn test_datastore_query() -> Result<(), Error> {
        let (_outdir, dbase) = open_database();
        dbase.put(&Key::new("/pins/one"), b"1")?;
        dbase.put(&Key::new("/pins/two"), b"22")?;
        dbase.put(&Key::new("/local/three"), b"333")?;
        let query = Query {
            prefix: Key::new("/pins"),
            ..Default::default()
        };
        let results = dbase.query(&query)?;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].key.as_str(), "/pins/one");
        assert_eq!(results[0].value.as_deref(), Some(&b"1"[..]));
        let query = Query {
            prefix: Key::new("/"),
            keys_only: true,
            ..Default::default()
        };
        let results = dbase.query(&query)?;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|e| e.value.is_none()));
        Ok(())
    }
}
