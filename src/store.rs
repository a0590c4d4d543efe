//
// Copyright (c) 2020 Nathan Fiedler
//

//! The `store` module defines functions for uploading and retrieving pack
//! objects stored in local or remote sites.

use failure::{err_msg, Error};
use log::debug;
#[cfg(test)]
use mockall::automock;
use std::str::FromStr;

pub mod local;
pub mod minio;

///
/// The type of store implementation to be constructed using the loader
/// function `load_store()`. Can be constructed from a string using the
/// `FromStr` trait's `from_str()` function.
///
#[derive(Debug, Eq, PartialEq, Hash)]
pub enum StoreType {
    LOCAL,
    MINIO,
}

impl ToString for StoreType {
    fn to_string(&self) -> String {
        match self {
            StoreType::LOCAL => String::from("local"),
            StoreType::MINIO => String::from("minio"),
        }
    }
}

impl FromStr for StoreType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StoreType::LOCAL),
            "minio" => Ok(StoreType::MINIO),
            _ => Err(err_msg(format!("not a recognized store type: {}", s))),
        }
    }
}

///
/// An object store knows how to write, read, and delete objects in named
/// buckets of a storage system, such as local disk or an S3 compatible
/// service. It has no opinion on the layout of pack objects; ranged reads
/// are expressed in plain byte offsets.
///
#[cfg_attr(test, automock)]
pub trait ObjectStore: Send + Sync {
    /// Return the type of this store.
    fn get_type(&self) -> StoreType;

    /// Write the object under the named bucket, creating the bucket if
    /// necessary. Writing the same bytes twice is not an error.
    fn put_object(&self, bucket: &str, object: &str, data: &[u8]) -> Result<(), Error>;

    /// Read `length` bytes of the named object starting at `offset`.
    fn get_object_range(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error>;

    /// Delete the named object from the given bucket.
    fn delete_object(&self, bucket: &str, object: &str) -> Result<(), Error>;
}

///
/// Construct the store described by the given access string, which has the
/// form `<type>:<json>`, where `<type>` is a recognized store type and
/// `<json>` is the configuration for that store type (see the `local` and
/// `minio` modules for the properties).
///
pub fn load_store(access: &str) -> Result<Box<dyn ObjectStore>, Error> {
    let mut parts = access.splitn(2, ':');
    let type_name = parts.next().unwrap_or("");
    let config = parts.next().unwrap_or("{}");
    match StoreType::from_str(type_name)? {
        StoreType::LOCAL => {
            let conf: local::LocalConfig = serde_json::from_str(config)?;
            Ok(Box::new(local::LocalStore::new(conf)))
        }
        StoreType::MINIO => {
            let conf: minio::MinioConfig = serde_json::from_str(config)?;
            Ok(Box::new(minio::MinioStore::new(conf)))
        }
    }
}

///
/// Stores and retrieves pack objects within a single bucket of an object
/// store. The packer decides how block bytes are concatenated into a pack;
/// this type only moves whole packs up and byte ranges down.
///
pub struct PackStore {
    /// The object store holding the pack objects.
    store: Box<dyn ObjectStore>,
    /// Bucket in which all pack objects live.
    bucket: String,
}

impl PackStore {
    /// Construct a pack store for the given bucket.
    pub fn new(store: Box<dyn ObjectStore>, bucket: &str) -> Self {
        Self {
            store,
            bucket: bucket.to_owned(),
        }
    }

    ///
    /// Upload the assembled pack under the given object name.
    ///
    pub fn store_pack(&self, object: &str, data: &[u8]) -> Result<(), Error> {
        self.store.put_object(&self.bucket, object, data)?;
        debug!("store_pack: uploaded {} ({} bytes)", object, data.len());
        Ok(())
    }

    ///
    /// Retrieve `length` bytes at `offset` from the named pack object.
    ///
    pub fn retrieve_range(&self, object: &str, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        self.store
            .get_object_range(&self.bucket, object, offset, length)
    }

    ///
    /// Delete the named pack object, for garbage collection of packs whose
    /// every block has been tombstoned.
    ///
    pub fn delete_pack(&self, object: &str) -> Result<(), Error> {
        self.store.delete_object(&self.bucket, object)
    }
}
