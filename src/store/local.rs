//
// Copyright (c) 2020 Nathan Fiedler
//
use failure::Error;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

///
/// Configuration for the LocalStore implementation.
///
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory under which buckets and objects are stored.
    pub basepath: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            basepath: String::from("."),
        }
    }
}

///
/// An `ObjectStore` implementation in which pack objects are stored on a
/// locally accessible file system, one file per object.
///
pub struct LocalStore {
    config: LocalConfig,
}

impl LocalStore {
    /// Construct a new instance of LocalStore with the given configuration.
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }
}

impl super::ObjectStore for LocalStore {
    fn get_type(&self) -> super::StoreType {
        super::StoreType::LOCAL
    }

    fn put_object(&self, bucket: &str, object: &str, data: &[u8]) -> Result<(), Error> {
        let mut path: PathBuf = [&self.config.basepath, bucket].iter().collect();
        fs::create_dir_all(&path)?;
        path.push(object);
        fs::write(&path, data)?;
        Ok(())
    }

    fn get_object_range(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        let path: PathBuf = [&self.config.basepath, bucket, object].iter().collect();
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0; length as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn delete_object(&self, bucket: &str, object: &str) -> Result<(), Error> {
        let path: PathBuf = [&self.config.basepath, bucket, object].iter().collect();
        fs::remove_file(path)?;
        Ok(())
    }
}
