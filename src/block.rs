//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `block` module maps the host's block namespace onto the block table
//! and the pack store. Blocks that have not yet been packed are served from
//! their inline copy in the database; packed blocks are served by ranged
//! reads against their pack object.

use super::core::{Block, Key, PackStatus, Query, QueryEntry};
use super::database::Database;
use super::store::PackStore;
use failure::{err_msg, Error};
use log::error;
use std::sync::Arc;

///
/// Provides access to content-addressed blocks stored in the block table
/// and, once packed, in pack objects on the object store.
///
pub struct BlockStore {
    /// Key namespace this store serves, e.g. `/blocks`.
    prefix: Key,
    db: Database,
    packs: Arc<PackStore>,
}

impl BlockStore {
    /// Construct a block store for the given key namespace.
    pub fn new(prefix: Key, db: Database, packs: Arc<PackStore>) -> Self {
        Self { prefix, db, packs }
    }

    /// Return the key namespace this store serves.
    pub fn get_prefix(&self) -> &Key {
        &self.prefix
    }

    ///
    /// Store the block under the given CID. The block is durable once this
    /// returns; packing happens later in the background.
    ///
    pub fn put(&self, cid: &str, value: &[u8]) -> Result<(), Error> {
        self.db.put_block(cid, value)
    }

    ///
    /// Retrieve the block with the given CID, from the inline copy if the
    /// block has not been packed yet, otherwise from its pack object.
    ///
    pub fn get(&self, cid: &str) -> Result<Vec<u8>, Error> {
        let block = self.db.get_block(cid)?;
        self.read_block(&block)
    }

    ///
    /// Return `true` if a block with the given CID exists.
    ///
    pub fn has(&self, cid: &str) -> Result<bool, Error> {
        self.db.has_block(cid)
    }

    ///
    /// Return the size of the block with the given CID, without touching
    /// any block bytes.
    ///
    pub fn get_size(&self, cid: &str) -> Result<u64, Error> {
        self.db.get_block_size(cid)
    }

    ///
    /// Delete the block with the given CID. A block that has entered the
    /// pack pipeline is tombstoned rather than removed, since pack objects
    /// are immutable once written.
    ///
    pub fn delete(&self, cid: &str) -> Result<(), Error> {
        self.db.delete_block(cid)
    }

    ///
    /// Enumerate blocks matching the query. Values are fetched only when
    /// the query asks for them, which for packed blocks means one ranged
    /// read per block.
    ///
    pub fn query(&self, query: &Query) -> Result<Vec<QueryEntry>, Error> {
        // everything under the first namespace of the prefix is a CID prefix
        let stripped = query.prefix.strip_first_namespace();
        let cid_prefix = stripped.as_str().trim_start_matches('/');
        let blocks = self.db.query_blocks(cid_prefix, query.offset, query.limit)?;
        let mut results = Vec::with_capacity(blocks.len());
        for block in blocks {
            let value = if query.keys_only {
                None
            } else {
                Some(self.read_block(&block)?)
            };
            results.push(QueryEntry {
                key: Key::new(format!("{}/{}", self.prefix, block.cid)),
                value,
                size: block.size,
            });
        }
        Ok(results)
    }

    // Resolve the bytes of the given block row.
    fn read_block(&self, block: &Block) -> Result<Vec<u8>, Error> {
        match block.pack_status {
            PackStatus::UNPACKED | PackStatus::PACKING => match &block.data {
                Some(data) => Ok(data.clone()),
                None => {
                    error!(
                        "block {} in {} state with no data",
                        block.cid, block.pack_status
                    );
                    Err(err_msg(format!("block {} has no inline data", block.cid)))
                }
            },
            PackStatus::PACKED => {
                self.packs
                    .retrieve_range(&block.pack_object, block.pack_offset, block.size)
            }
        }
    }
}
