//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `datastore` module presents the uniform key/value interface consumed
//! by the host. Keys under the block namespace flow through the block store
//! and the pack pipeline; every other key is a plain database record.

use super::block::BlockStore;
use super::core::{Config, Key, Query, QueryEntry};
use super::database::Database;
use super::engine::Packer;
use super::store::{self, PackStore};
use failure::Error;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;

/// Key namespace agreed with the host for content-addressed blocks.
pub static BLOCK_PREFIX: &str = "/blocks";

///
/// The datastore owns the database, the block store, and the packer, and
/// routes each host key to the right place. Construct one with `open()`
/// and release it with `close()`.
///
pub struct Datastore {
    config: Config,
    db: Database,
    prefix: Key,
    blocks: BlockStore,
    packer: Packer,
}

impl Datastore {
    ///
    /// Open the database, connect the object store described by the
    /// configuration, and start the packer.
    ///
    pub fn open(config: Config) -> Result<Datastore, Error> {
        info!("open datastore with database {:?}", config.db_path);
        let db = Database::new(&config.db_path)?;
        let object_store = store::load_store(&config.store_access)?;
        let packs = Arc::new(PackStore::new(object_store, &config.bucket));
        let prefix = Key::new(BLOCK_PREFIX);
        let blocks = BlockStore::new(prefix.clone(), db.clone(), Arc::clone(&packs));
        let packer = Packer::new(db.clone(), packs)
            .with_interval(config.pack_interval)
            .with_pack_size(
                config.min_pack_size,
                config.max_pack_size,
                config.max_pack_blocks,
            );
        packer.start()?;
        Ok(Datastore {
            config,
            db,
            prefix,
            blocks,
            packer,
        })
    }

    ///
    /// Stop the packer, letting any cycle in flight finish, and wait for
    /// the worker to exit. The datastore must not be used afterwards.
    ///
    pub fn close(&self) -> Result<(), Error> {
        debug!("close datastore");
        self.packer.stop()
    }

    /// Return a reference to the block store.
    pub fn blockstore(&self) -> &BlockStore {
        &self.blocks
    }

    /// Return a reference to the database.
    pub fn database(&self) -> &Database {
        &self.db
    }

    ///
    /// Ask the packer to run a cycle now and wait for it to finish. Mostly
    /// useful for tests and hosts that want deterministic packing.
    ///
    pub fn trigger_wait_packer(&self) -> Result<(), Error> {
        self.packer.trigger_wait()
    }

    ///
    /// Pack whatever is in the queue, no matter how small, and wait for
    /// the cycle to finish.
    ///
    pub fn flush_packer(&self) -> Result<(), Error> {
        self.packer.flush_wait()
    }

    ///
    /// Store the value under the given key.
    ///
    pub fn put(&self, key: &Key, value: &[u8]) -> Result<(), Error> {
        debug!("put {} ({} bytes)", key, value.len());
        if self.is_block_key(key) {
            self.blocks.put(&block_cid(key), value)
        } else {
            self.db.put(key, value)
        }
    }

    ///
    /// Retrieve the value with the given key.
    ///
    pub fn get(&self, key: &Key) -> Result<Vec<u8>, Error> {
        debug!("get {}", key);
        if self.is_block_key(key) {
            self.blocks.get(&block_cid(key))
        } else {
            self.db.get(key)
        }
    }

    ///
    /// Return `true` if a value exists for the given key.
    ///
    pub fn has(&self, key: &Key) -> Result<bool, Error> {
        debug!("has {}", key);
        if self.is_block_key(key) {
            self.blocks.has(&block_cid(key))
        } else {
            self.db.has(key)
        }
    }

    ///
    /// Return the size of the value with the given key.
    ///
    pub fn get_size(&self, key: &Key) -> Result<u64, Error> {
        // Hosts that keep their bloom filter updated call this for every
        // block they know of, which makes the logging far too noisy.
        if self.config.update_bloom_filter {
            debug!("get_size {}", key);
        }
        if self.is_block_key(key) {
            self.blocks.get_size(&block_cid(key))
        } else {
            self.db.get_size(key)
        }
    }

    ///
    /// Delete the value with the given key.
    ///
    pub fn delete(&self, key: &Key) -> Result<(), Error> {
        debug!("delete {}", key);
        if self.is_block_key(key) {
            self.blocks.delete(&block_cid(key))
        } else {
            self.db.delete(key)
        }
    }

    ///
    /// Enumerate entries matching the query, in key order.
    ///
    pub fn query(&self, query: &Query) -> Result<Vec<QueryEntry>, Error> {
        debug!("query {:?}", query);
        if self.prefix == query.prefix || self.prefix.is_ancestor_of(&query.prefix) {
            self.blocks.query(query)
        } else {
            self.db.query(query)
        }
    }

    ///
    /// Flush any writes under the given prefix to durable storage. This is
    /// a no-op: the database provides durability before `put` returns.
    ///
    pub fn sync(&self, _prefix: &Key) -> Result<(), Error> {
        Ok(())
    }

    ///
    /// Start a batch of operations to be applied together on commit.
    ///
    pub fn batch(&self) -> Batch {
        debug!("batch");
        Batch {
            datastore: self,
            ops: HashMap::new(),
        }
    }

    fn is_block_key(&self, key: &Key) -> bool {
        self.prefix == *key || self.prefix.is_ancestor_of(key)
    }
}

// Map a key under the block namespace to its CID.
fn block_cid(key: &Key) -> String {
    key.strip_first_namespace()
        .as_str()
        .trim_start_matches('/')
        .to_owned()
}

struct BatchOp {
    value: Vec<u8>,
    delete: bool,
}

///
/// Accumulates put and delete operations by key, the last write per key
/// winning, and replays them through the datastore on commit. Commit is
/// best effort: a failed operation aborts the batch, and operations already
/// applied are not rolled back.
///
pub struct Batch<'a> {
    datastore: &'a Datastore,
    ops: HashMap<Key, BatchOp>,
}

impl<'a> Batch<'a> {
    /// Record a put of the given key and value.
    pub fn put(&mut self, key: Key, value: &[u8]) {
        debug!("batch put {} ({} bytes)", key, value.len());
        self.ops.insert(
            key,
            BatchOp {
                value: value.to_owned(),
                delete: false,
            },
        );
    }

    /// Record a delete of the given key.
    pub fn delete(&mut self, key: Key) {
        debug!("batch delete {}", key);
        self.ops.insert(
            key,
            BatchOp {
                value: Vec::new(),
                delete: true,
            },
        );
    }

    /// Apply the accumulated operations, one at a time.
    pub fn commit(self) -> Result<(), Error> {
        debug!("batch commit");
        for (key, op) in &self.ops {
            if op.delete {
                self.datastore.delete(key)?;
            } else {
                self.datastore.put(key, &op.value)?;
            }
        }
        Ok(())
    }
}
