use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use prebuilt_config::ObjectStorageSettings;
use std::fmt;
use std::io::Write;
use std::path::Path;

use super::ObjectStoreClient;
use crate::error::{CacheError, Result};
use crate::CancelToken;

/// S3 (or S3-compatible) bucket client.
///
/// The provider interface is synchronous, so every call blocks on a private
/// single-threaded runtime.
pub struct S3ObjectStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    runtime: tokio::runtime::Runtime,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    pub fn new(bucket: String, settings: &ObjectStorageSettings) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| CacheError::S3 {
                message: err.to_string(),
                status: None,
            })?;

        let client = runtime.block_on(async {
            let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
            if let Some(region) = &settings.region {
                loader = loader.region(Region::new(region.clone()));
            }
            if let Some(credentials) = &settings.credentials {
                loader = loader.credentials_provider(Credentials::new(
                    credentials.access_key_id.expose(),
                    credentials.secret_access_key.expose(),
                    None,
                    None,
                    "prebuilt",
                ));
            }
            let shared = loader.load().await;

            let mut builder = aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(settings.force_path_style);
            if let Some(endpoint) = &settings.endpoint {
                builder = builder.endpoint_url(endpoint);
            }
            aws_sdk_s3::Client::from_conf(builder.build())
        });

        Ok(Self {
            bucket,
            client,
            runtime,
        })
    }
}

/// Errors raised outside a service call (body streaming, file reads).
fn s3_error(err: impl std::error::Error) -> CacheError {
    CacheError::S3 {
        message: DisplayErrorContext(&err).to_string(),
        status: None,
    }
}

/// Service call errors keep the response status, so `AccessDenied` or
/// `NoSuchKey` are not retried.
fn sdk_error<E: std::error::Error + 'static>(err: SdkError<E>) -> CacheError {
    let status = err.raw_response().map(|response| response.status().as_u16());
    CacheError::S3 {
        message: DisplayErrorContext(&err).to_string(),
        status,
    }
}

impl ObjectStoreClient for S3ObjectStore {
    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }

    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.runtime.block_on(async {
            let mut keys = Vec::new();
            let mut continuation = None;
            loop {
                let page = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(sdk_error)?;
                keys.extend(
                    page.contents()
                        .iter()
                        .filter_map(|object| object.key().map(str::to_owned)),
                );
                match page.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_owned()),
                    None => break,
                }
            }
            Ok(keys)
        })
    }

    fn get(&self, key: &str, out: &mut dyn Write, cancel: &CancelToken) -> Result<u64> {
        self.runtime.block_on(async {
            let mut object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(sdk_error)?;

            let mut copied = 0u64;
            while let Some(chunk) = object.body.try_next().await.map_err(s3_error)? {
                if cancel.is_cancelled() {
                    return Err(CacheError::Cancelled);
                }
                out.write_all(&chunk)?;
                copied += chunk.len() as u64;
            }
            out.flush()?;
            Ok(copied)
        })
    }

    fn put(&self, key: &str, source: &Path) -> Result<()> {
        self.runtime.block_on(async {
            let body = ByteStream::from_path(source).await.map_err(s3_error)?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .send()
                .await
                .map_err(sdk_error)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.runtime.block_on(async {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(sdk_error)?;
            Ok(())
        })
    }
}
