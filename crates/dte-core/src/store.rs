//! Object store seam for configuration and model result files
//!
//! A folder prefix starting with `s3://` resolves against an object store
//! bucket; anything else is a local filesystem path. Credential handling
//! stays with the host, which can inject its own `ObjectStore` behind the
//! trait. The bundled implementation fetches over plain HTTPS using the
//! bucket's virtual-hosted endpoint.

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use std::fs::File;
use std::io::Read;
use tracing::{error, info};

pub const S3_PREFIX: &str = "s3://";

/// Returns the bucket name when the folder prefix addresses an object store.
pub fn bucket_from_prefix(folder_prefix: &str) -> Option<&str> {
    folder_prefix.strip_prefix(S3_PREFIX)
}

enum ObjectBody {
    Response(reqwest::Response),
    Bytes(Vec<u8>),
}

/// A fetched object whose body has not necessarily been read yet. Callers
/// check the fingerprint first and only drain the body on a stale hit.
pub struct FetchedObject {
    fingerprint: String,
    body: ObjectBody,
}

impl FetchedObject {
    pub fn from_bytes(fingerprint: impl Into<String>, bytes: Vec<u8>) -> Self {
        FetchedObject {
            fingerprint: fingerprint.into(),
            body: ObjectBody::Bytes(bytes),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        match self.body {
            ObjectBody::Bytes(bytes) => Ok(bytes),
            ObjectBody::Response(response) => {
                let bytes = response
                    .bytes()
                    .await
                    .context("failed to read object body")?;
                Ok(bytes.to_vec())
            }
        }
    }
}

/// Fetches objects by bucket and key.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject>;
}

/// Object store client over the bucket's regional HTTPS endpoint. The ETag
/// response header is the content fingerprint.
pub struct HttpObjectStore {
    client: reqwest::Client,
    region: String,
}

impl HttpObjectStore {
    pub fn new(region: impl Into<String>) -> Self {
        HttpObjectStore {
            client: reqwest::Client::new(),
            region: region.into(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("https://{bucket}.s3.{}.amazonaws.com/{key}", self.region)
    }
}

#[async_trait::async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject> {
        info!(bucket, key, "fetching object");
        let response = self
            .client
            .get(self.object_url(bucket, key))
            .send()
            .await
            .with_context(|| format!("failed to get object {bucket}/{key}"))?;

        let status = response.status();
        if !status.is_success() {
            error!(bucket, key, %status, "object fetch failed");
            bail!("failed to get object {bucket}/{key}: status {status}");
        }

        let fingerprint = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|etag| etag.trim_matches('"').to_string())
            .unwrap_or_default();
        if fingerprint.is_empty() {
            bail!("object response for {bucket}/{key} carries no ETag");
        }

        Ok(FetchedObject {
            fingerprint,
            body: ObjectBody::Response(response),
        })
    }
}

/// In-memory object store for tests, examples and benchmarks. Objects are
/// registered with an explicit fingerprint so staleness can be simulated.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, (String, Vec<u8>)>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        bucket: &str,
        key: &str,
        fingerprint: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) {
        self.objects
            .insert(format!("{bucket}/{key}"), (fingerprint.into(), bytes.into()));
    }

    pub fn remove(&self, bucket: &str, key: &str) {
        self.objects.remove(&format!("{bucket}/{key}"));
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<FetchedObject> {
        match self.objects.get(&format!("{bucket}/{key}")) {
            Some(object) => {
                let (fingerprint, bytes) = object.value().clone();
                Ok(FetchedObject::from_bytes(fingerprint, bytes))
            }
            None => bail!("no such object {bucket}/{key}"),
        }
    }
}

/// Read the remaining contents of an already opened local file.
pub fn read_local_file(file: &mut File) -> Result<Vec<u8>> {
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .context("error reading file")?;
    Ok(contents)
}
