//
// Copyright (c) 2020 Nathan Fiedler
//
use failure::{err_msg, Error};
use futures::{Future, Stream};
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_credential::StaticProvider;
use rusoto_s3::{
    CreateBucketError, CreateBucketRequest, DeleteObjectRequest, GetObjectRequest,
    PutObjectRequest, S3Client, S3,
};
use serde::{Deserialize, Serialize};

///
/// Configuration for the MinioStore implementation.
///
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct MinioConfig {
    /// The AWS/Minio region to connect to (e.g. "us-east-1").
    pub region: String,
    /// The endpoint should be something like http://192.168.99.100:9000 such
    /// that it includes the scheme and port number, otherwise the client
    /// library will default to https and port 80(?).
    pub endpoint: String,
    /// Access key portion of the credentials.
    pub access_key: String,
    /// Secret key portion of the credentials.
    pub secret_key: String,
}

impl Default for MinioConfig {
    fn default() -> Self {
        Self {
            region: String::from("us-west-1"),
            endpoint: String::from("http://localhost:9000"),
            access_key: String::new(),
            secret_key: String::new(),
        }
    }
}

///
/// An `ObjectStore` implementation that uses the Amazon S3 protocol to
/// connect to a Minio storage server.
///
pub struct MinioStore {
    config: MinioConfig,
}

impl MinioStore {
    /// Construct a new instance of MinioStore with the given configuration.
    pub fn new(config: MinioConfig) -> Self {
        Self { config }
    }

    ///
    /// Get an S3Client instance using the static credentials from the
    /// configuration.
    ///
    fn connect(&self) -> Result<S3Client, Error> {
        let region = Region::Custom {
            name: self.config.region.clone(),
            endpoint: self.config.endpoint.clone(),
        };
        let creds = StaticProvider::new_minimal(
            self.config.access_key.clone(),
            self.config.secret_key.clone(),
        );
        Ok(S3Client::new_with(HttpClient::new()?, creds, region))
    }
}

impl super::ObjectStore for MinioStore {
    fn get_type(&self) -> super::StoreType {
        super::StoreType::MINIO
    }

    fn put_object(&self, bucket: &str, object: &str, data: &[u8]) -> Result<(), Error> {
        let client = self.connect()?;
        // Ensure the bucket exists
        create_bucket(&client, bucket)?;
        let req = PutObjectRequest {
            bucket: bucket.to_owned(),
            key: object.to_owned(),
            content_length: Some(data.len() as i64),
            body: Some(data.to_vec().into()),
            ..Default::default()
        };
        let result = client.put_object(req).sync()?;
        if result.e_tag.is_some() {
            // compute MD5 of the pack and compare to returned e_tag
            let md5 = checksum_data(data);
            // AWS S3 quotes the etag values for some reason
            let quoted_etag = result.e_tag.as_ref().unwrap();
            let stripped_etag = &quoted_etag.trim_matches('"');
            if !md5.eq(stripped_etag) {
                return Err(err_msg("returned e_tag does not match MD5 of pack"));
            }
        }
        Ok(())
    }

    fn get_object_range(
        &self,
        bucket: &str,
        object: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, Error> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let client = self.connect()?;
        let request = GetObjectRequest {
            bucket: bucket.to_owned(),
            key: object.to_owned(),
            // an HTTP range is inclusive of the last byte
            range: Some(format!("bytes={}-{}", offset, offset + length - 1)),
            ..Default::default()
        };
        let result = client.get_object(request).sync()?;
        let stream = result.body.ok_or_else(|| err_msg("missing object body"))?;
        let mut buffer: Vec<u8> = Vec::with_capacity(length as usize);
        stream
            .for_each(|chunk| {
                buffer.extend_from_slice(&chunk);
                Ok(())
            })
            .wait()?;
        if buffer.len() as u64 != length {
            return Err(err_msg(format!(
                "ranged read of {} returned {} bytes, wanted {}",
                object,
                buffer.len(),
                length
            )));
        }
        Ok(buffer)
    }

    fn delete_object(&self, bucket: &str, object: &str) -> Result<(), Error> {
        let client = self.connect()?;
        let request = DeleteObjectRequest {
            bucket: bucket.to_owned(),
            key: object.to_owned(),
            ..Default::default()
        };
        client.delete_object(request).sync()?;
        Ok(())
    }
}

///
/// Ensure the named bucket exists.
///
fn create_bucket(client: &S3Client, bucket: &str) -> Result<(), Error> {
    let request = CreateBucketRequest {
        bucket: bucket.to_owned(),
        ..Default::default()
    };
    let result = client.create_bucket(request).sync();
    // certain error conditions are okay
    match result {
        Err(e) => match e {
            RusotoError::Service(se) => match se {
                CreateBucketError::BucketAlreadyExists(_) => Ok(()),
                CreateBucketError::BucketAlreadyOwnedByYou(_) => Ok(()),
            },
            _ => Err(Error::from_boxed_compat(Box::new(e))),
        },
        Ok(_) => Ok(()),
    }
}

///
/// Compute the MD5 digest of the given data.
///
fn checksum_data(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.input(data);
    let digest = hasher.result();
    format!("{:x}", digest)
}
