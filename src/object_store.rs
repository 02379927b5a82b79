//! The narrow object-storage capability the translator needs: GET-with-range,
//! whole-object PUT, batched DELETE, and prefix LIST. Implemented once against
//! `aws-sdk-s3` ([`S3ObjectStore`]) and once as an in-memory mock for tests
//! ([`crate::test_support::MockObjectStore`]).

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};

use crate::error::Error;

/// Result of a `get`: either the requested bytes, or a signal that the key was a hole.
pub enum GetResult {
    Found(Vec<u8>),
    NoSuchKey,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `key`, optionally restricted to the inclusive byte range `[off, off+len-1]`.
    /// A `NoSuchKey` condition is reported as `GetResult::NoSuchKey`, not an `Err`.
    async fn get(&self, key: &str, range: Option<(u64, u64)>) -> Result<GetResult, Error>;

    /// Write `body` as the entirety of `key`.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), Error>;

    /// Delete up to 1000 keys in one batch call. Any per-key error in the response is
    /// fatal for the whole call. A call with zero keys must not reach the backend.
    async fn delete_many(&self, keys: &[String]) -> Result<(), Error>;

    /// List keys under `prefix`, in lexicographic order, strictly greater than
    /// `start_after` when given. Continuation pages are followed internally.
    async fn list(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>, Error>;

    /// Content length of `key`.
    async fn head(&self, key: &str) -> Result<u64, Error>;
}

/// Object store backed by a real S3-compatible service via `aws-sdk-s3`.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

/// Max keys per `delete_many` call, matching typical backend batch limits (§4.4.5).
pub const DELETE_BATCH_LIMIT: usize = 1000;

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str, range: Option<(u64, u64)>) -> Result<GetResult, Error> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some((off, last)) = range {
            req = req.range(format!("bytes={off}-{last}"));
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(aws_sdk_s3::error::SdkError::ServiceError(ctx))
                if matches!(ctx.err(), aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_)) =>
            {
                return Ok(GetResult::NoSuchKey);
            }
            Err(e) => return Err(backend_error(&e)),
        };

        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend { transient: true, message: e.to_string() })?;
        Ok(GetResult::Found(body.into_bytes().to_vec()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), Error> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend_error(&e))?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), Error> {
        if keys.is_empty() {
            // A zero-object delete_many must be a guarded no-op (§4.4.5, §9 open question 2).
            return Ok(());
        }
        debug_assert!(keys.len() <= DELETE_BATCH_LIMIT);

        let objects: Vec<ObjectIdentifier> = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<Result<_, _>>()
            .map_err(|e| Error::Assertion(e.to_string()))?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|e| Error::Assertion(e.to_string()))?;

        let resp = self
            .client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| backend_error(&e))?;

        let errors = resp.errors();
        if !errors.is_empty() {
            let message = errors
                .iter()
                .map(|e| format!("{}: {}", e.key().unwrap_or("?"), e.message().unwrap_or("?")))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::BatchDelete(message));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>, Error> {
        let mut out = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(start_after) = start_after {
                req = req.start_after(start_after);
            }
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| backend_error(&e))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    out.push(key.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(|s| s.to_string());
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn head(&self, key: &str) -> Result<u64, Error> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| backend_error(&e))?;
        Ok(resp.content_length().unwrap_or(0) as u64)
    }
}

fn backend_error<E, R>(err: &aws_sdk_s3::error::SdkError<E, R>) -> Error
where
    E: std::fmt::Debug,
    R: std::fmt::Debug,
{
    let transient = matches!(
        err,
        aws_sdk_s3::error::SdkError::TimeoutError(_)
            | aws_sdk_s3::error::SdkError::DispatchFailure(_)
    );
    Error::Backend { transient, message: format!("{err:?}") }
}
