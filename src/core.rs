//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `core` module defines the most basic of functions and the core data
//! types used throughout the crate.

use chrono::prelude::*;
use failure::{err_msg, Error};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use ulid::Ulid;

///
/// A datastore key, a slash-separated path of namespaces, such as
/// `/blocks/CIQFTFEEHEDF6KLBT32BFAGLXEZL4UWFNWM4LFTLMXQBCERZ6CMLX3Y`.
/// Keys are normalized on construction: a leading slash is ensured, empty
/// segments are removed, and there is no trailing slash.
///
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Key(String);

impl Key {
    /// Construct a normalized key from the given string.
    pub fn new<S: AsRef<str>>(value: S) -> Self {
        let mut path = String::new();
        for segment in value.as_ref().split('/') {
            if !segment.is_empty() {
                path.push('/');
                path.push_str(segment);
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        Key(path)
    }

    /// Return the key as a string slice, always starting with a slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the namespaces of the key, in order.
    pub fn namespaces(&self) -> Vec<&str> {
        self.0.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Return the last namespace of the key, or the empty string for the
    /// root key.
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }

    /// Return a new key with the first namespace removed.
    pub fn strip_first_namespace(&self) -> Key {
        let ns = self.namespaces();
        if ns.len() < 2 {
            Key::new("/")
        } else {
            Key::new(ns[1..].join("/"))
        }
    }

    /// Return `true` if this key is a strict ancestor of the other key.
    pub fn is_ancestor_of(&self, other: &Key) -> bool {
        if self.0 == "/" {
            return other.0 != "/";
        }
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Key {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Key::new(s))
    }
}

///
/// Position of a block within the pack pipeline. Transitions are strictly
/// forward: unpacked to packing when selected for the next pack, packing to
/// packed when the pack object has been committed.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PackStatus {
    UNPACKED,
    PACKING,
    PACKED,
}

impl PackStatus {
    /// Convert the database representation to a status.
    pub fn from_i64(value: i64) -> Result<PackStatus, Error> {
        match value {
            0 => Ok(PackStatus::UNPACKED),
            1 => Ok(PackStatus::PACKING),
            2 => Ok(PackStatus::PACKED),
            _ => Err(err_msg(format!("not a recognized pack status: {}", value))),
        }
    }

    /// Convert the status to its database representation.
    pub fn as_i64(self) -> i64 {
        match self {
            PackStatus::UNPACKED => 0,
            PackStatus::PACKING => 1,
            PackStatus::PACKED => 2,
        }
    }
}

impl fmt::Display for PackStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PackStatus::UNPACKED => write!(f, "unpacked"),
            PackStatus::PACKING => write!(f, "packing"),
            PackStatus::PACKED => write!(f, "packed"),
        }
    }
}

///
/// A single row of the blocks table. While a block is unpacked or packing
/// the original bytes are held inline in `data`; once packed the bytes live
/// at `pack_offset` within the pack object named by `pack_object` and
/// `data` is cleared.
///
#[derive(Clone, Debug)]
pub struct Block {
    /// Content identifier, an opaque string assigned by the host.
    pub cid: String,
    /// Byte length of the original block data.
    pub size: u64,
    /// Inline block data, present until the block is packed.
    pub data: Option<Vec<u8>>,
    /// Tombstone flag for blocks that are retained only because their pack
    /// object is immutable.
    pub deleted: bool,
    /// Position within the pack pipeline.
    pub pack_status: PackStatus,
    /// Object name of the containing pack; empty until packed.
    pub pack_object: String,
    /// Byte offset of this block within the pack object.
    pub pack_offset: u64,
    /// Insertion time, used to order the packing queue.
    pub created: DateTime<Utc>,
}

///
/// Selection criteria for enumerating entries of the datastore.
///
#[derive(Clone, Debug)]
pub struct Query {
    /// Only entries whose key is a descendant of this prefix are returned.
    pub prefix: Key,
    /// If `true`, entry values are not fetched.
    pub keys_only: bool,
    /// Number of matching entries to skip.
    pub offset: u64,
    /// Maximum number of entries to return; zero means no limit.
    pub limit: u64,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            prefix: Key::new("/"),
            keys_only: false,
            offset: 0,
            limit: 0,
        }
    }
}

///
/// A single result of a query.
///
#[derive(Clone, Debug)]
pub struct QueryEntry {
    pub key: Key,
    /// Entry value; `None` for keys-only queries.
    pub value: Option<Vec<u8>>,
    pub size: u64,
}

/// Error indicating the requested entry does not exist, or has been deleted.
#[derive(Debug, Fail)]
#[fail(display = "entry not found")]
pub struct NotFoundError;

/// Error indicating a database update affected an unexpected number of rows,
/// which would leave the block table in an inconsistent state.
#[derive(Debug, Fail)]
#[fail(display = "expected {} affected row(s), found {}", expected, actual)]
pub struct ConflictError {
    pub expected: usize,
    pub actual: usize,
}

///
/// Return `true` if the given error is the not-found sentinel.
///
pub fn is_not_found(err: &Error) -> bool {
    err.downcast_ref::<NotFoundError>().is_some()
}

///
/// Generate a name for a new pack object. Uses a ULID so that object names
/// sort by creation time in store listings.
///
pub fn generate_pack_object() -> String {
    Ulid::new().to_string().to_lowercase()
}

// Packs smaller than this are not worth the per-object overhead.
const DEFAULT_MIN_PACK_SIZE: u64 = 60 * 1024 * 1024;
// Upper bound on the byte size of a single pack object.
const DEFAULT_MAX_PACK_SIZE: u64 = 62 * 1024 * 1024;
// Upper bound on the number of blocks in a single pack object.
const DEFAULT_MAX_PACK_BLOCKS: u64 = 1000;
// Idle period between pack cycles.
const DEFAULT_PACK_INTERVAL: Duration = Duration::from_secs(60);

///
/// Runtime configuration for the datastore, typically loaded from the
/// environment via `Config::from_env()`.
///
#[derive(Clone, Debug)]
pub struct Config {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Object store access string, `<type>:<json>` (see `store::load_store`).
    pub store_access: String,
    /// Bucket in which pack objects are stored.
    pub bucket: String,
    /// Idle period between pack cycles.
    pub pack_interval: Duration,
    /// A pack is only committed once the queue reaches this many bytes.
    pub min_pack_size: u64,
    /// Upper bound on the byte size of a pack.
    pub max_pack_size: u64,
    /// Upper bound on the number of blocks in a pack.
    pub max_pack_blocks: u64,
    /// Address on which the host serves its debug endpoint, if any. The
    /// datastore itself does not listen; the value is parsed here so the
    /// host has one place to read its configuration from.
    pub debug_addr: Option<String>,
    /// Whether the host keeps its bloom filter up to date, which produces a
    /// torrent of size queries; controls logging of those calls.
    pub update_bloom_filter: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tmp/database.db"),
            store_access: String::from("local:{\"basepath\":\"tmp/packs\"}"),
            bucket: String::from("packs"),
            pack_interval: DEFAULT_PACK_INTERVAL,
            min_pack_size: DEFAULT_MIN_PACK_SIZE,
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            max_pack_blocks: DEFAULT_MAX_PACK_BLOCKS,
            debug_addr: None,
            update_bloom_filter: false,
        }
    }
}

impl Config {
    ///
    /// Load the configuration from the environment, falling back to the
    /// defaults for anything not defined. Reads a `.env` file first, if one
    /// is present in the working directory.
    ///
    pub fn from_env() -> Result<Config, Error> {
        dotenv::dotenv().ok();
        let defaults = Config::default();
        let db_path = env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let store_access = env::var("STORE_ACCESS").unwrap_or(defaults.store_access);
        let bucket = env::var("PACK_BUCKET").unwrap_or(defaults.bucket);
        let pack_interval = match env::var("PACK_INTERVAL") {
            Ok(value) => Duration::from_secs(value.parse()?),
            Err(_) => defaults.pack_interval,
        };
        Ok(Config {
            db_path,
            store_access,
            bucket,
            pack_interval,
            min_pack_size: env_u64("MIN_PACK_SIZE", defaults.min_pack_size)?,
            max_pack_size: env_u64("MAX_PACK_SIZE", defaults.max_pack_size)?,
            max_pack_blocks: env_u64("MAX_PACK_BLOCKS", defaults.max_pack_blocks)?,
            debug_addr: env::var("DEBUG_ADDR").ok(),
            update_bloom_filter: env::var("UPDATE_BLOOM_FILTER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.update_bloom_filter),
        })
    }
}

// Read a u64 environment variable, or return the given default.
fn env_u64(name: &str, default: u64) -> Result<u64, Error> {
    match env::var(name) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}
