//! Durable blob storage for finished downloads.
//!
//! Everything goes through the `object_store` crate so S3-compatible services
//! and a plain local directory share one code path. A store built without any
//! backend reports itself as unconfigured and refuses every operation.

use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use axum::http::Method;
use futures_util::StreamExt;
use object_store::{
    Attribute, Attributes, ObjectStore, PutMultipartOpts, WriteMultipart,
    aws::AmazonS3Builder, local::LocalFileSystem, path::Path as ObjectPath, signer::Signer,
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::config::{S3Settings, StorageSettings};

/// 10 MiB parts, at most four in flight.
const PART_SIZE: usize = 10 * 1024 * 1024;
const MAX_IN_FLIGHT_PARTS: usize = 4;
const READ_CHUNK: usize = 256 * 1024;
const LOCAL_BUCKET: &str = "local";

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn is_configured(&self) -> bool;

    /// Name recorded next to stored keys.
    fn bucket(&self) -> Option<&str>;

    /// Streams `source` to `key`, overwriting any previous object. Returns the
    /// number of bytes uploaded.
    async fn upload(&self, key: &str, source: &Path, content_type: &str) -> Result<u64>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Time-limited URL to fetch `key`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

struct Backend {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    bucket: String,
    public_url: Option<String>,
    /// The local filesystem backend rejects object attributes.
    supports_attributes: bool,
}

/// [`BlobStore`] backed by any `object_store` implementation.
pub struct ObjectBlobStore {
    backend: Option<Backend>,
}

impl std::fmt::Debug for ObjectBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBlobStore")
            .field("bucket", &self.bucket())
            .finish()
    }
}

impl ObjectBlobStore {
    pub fn unconfigured() -> Self {
        Self { backend: None }
    }

    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        match settings {
            StorageSettings::Disabled => Ok(Self::unconfigured()),
            StorageSettings::S3(s3) => Self::s3(s3),
            StorageSettings::Local { root, public_url } => Self::local(root, public_url.clone()),
        }
    }

    pub fn s3(cfg: &S3Settings) -> Result<Self> {
        // Path-style requests keep MinIO/R2 style endpoints working.
        let store = AmazonS3Builder::new()
            .with_endpoint(&cfg.endpoint)
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_access_key_id(&cfg.access_key_id)
            .with_secret_access_key(&cfg.secret_access_key)
            .with_virtual_hosted_style_request(false)
            .with_allow_http(cfg.allow_http)
            .build()
            .with_context(|| format!("building S3 client for bucket {}", cfg.bucket))?;
        let store = Arc::new(store);

        info!(bucket = %cfg.bucket, endpoint = %cfg.endpoint, "object storage: s3");
        Ok(Self {
            backend: Some(Backend {
                store: store.clone(),
                signer: Some(store),
                bucket: cfg.bucket.clone(),
                public_url: cfg.public_url.clone(),
                supports_attributes: true,
            }),
        })
    }

    pub fn local(root: &Path, public_url: Option<String>) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating storage directory {}", root.display()))?;
        let store = LocalFileSystem::new_with_prefix(root)
            .with_context(|| format!("opening storage directory {}", root.display()))?;

        info!(root = %root.display(), "object storage: local directory");
        Ok(Self {
            backend: Some(Backend {
                store: Arc::new(store),
                signer: None,
                bucket: LOCAL_BUCKET.to_string(),
                public_url: public_url.map(|url| url.trim_end_matches('/').to_string()),
                supports_attributes: false,
            }),
        })
    }

    fn backend(&self) -> Result<&Backend> {
        self.backend
            .as_ref()
            .ok_or_else(|| anyhow!("object storage is not configured"))
    }
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    fn bucket(&self) -> Option<&str> {
        self.backend.as_ref().map(|backend| backend.bucket.as_str())
    }

    async fn upload(&self, key: &str, source: &Path, content_type: &str) -> Result<u64> {
        let backend = self.backend()?;
        let location = object_path(key)?;

        let file = File::open(source)
            .await
            .with_context(|| format!("opening {}", source.display()))?;
        let size = file
            .metadata()
            .await
            .with_context(|| format!("reading size of {}", source.display()))?
            .len();

        let mut opts = PutMultipartOpts::default();
        if backend.supports_attributes {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            opts.attributes = attributes;
        }

        let upload = backend
            .store
            .put_multipart_opts(&location, opts)
            .await
            .with_context(|| format!("starting upload of {key}"))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);

        if let Err(err) = pump(&mut writer, file).await {
            if let Err(abort_err) = writer.abort().await {
                warn!("could not abort upload of {key}: {abort_err}");
            }
            return Err(err.context(format!("uploading {key}")));
        }

        writer
            .finish()
            .await
            .with_context(|| format!("completing upload of {key}"))?;
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let backend = self.backend()?;
        let location = object_path(key)?;
        match backend.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err).with_context(|| format!("deleting {key}")),
        }
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let backend = self.backend()?;
        let location = object_path(key)?;

        if let Some(public_url) = &backend.public_url {
            return Ok(format!("{public_url}/{location}"));
        }

        let Some(signer) = &backend.signer else {
            bail!("storage backend cannot sign URLs; set S3_PUBLIC_URL");
        };
        let url = signer
            .signed_url(Method::GET, &location, ttl)
            .await
            .with_context(|| format!("signing URL for {key}"))?;
        Ok(url.to_string())
    }
}

/// Feeds the file into the multipart writer without holding more than
/// `MAX_IN_FLIGHT_PARTS` parts in memory.
async fn pump(writer: &mut WriteMultipart, file: File) -> Result<()> {
    let mut stream = ReaderStream::with_capacity(file, READ_CHUNK);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading local file")?;
        writer
            .wait_for_capacity(MAX_IN_FLIGHT_PARTS)
            .await
            .context("waiting for upload capacity")?;
        writer.write(&chunk);
    }
    Ok(())
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key).with_context(|| format!("invalid object key {key:?}"))
}
