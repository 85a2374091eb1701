//! S3 bucket backend
//!
//! CAS maps onto S3 conditional writes: the object's ETag is the token,
//! `If-Match` guards updates and `If-None-Match: *` guards creation.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::instrument;

use crate::{Error, Result};

use super::{Bucket, Cas};

/// S3 bucket backend
pub struct S3Bucket {
    client: Client,
    bucket: String,
}

impl S3Bucket {
    pub async fn new(bucket: String, region: String, endpoint: Option<String>) -> Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&config);

        if let Some(endpoint_url) = endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint_url)
                .force_path_style(true);
        }

        let s3_config = s3_config_builder.build();
        let client = Client::from_conf(s3_config);

        Ok(Self { client, bucket })
    }

    async fn fetch(&self, key: &str) -> Result<(Bytes, Cas)> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|service| service.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    Error::NotFound(key.to_string())
                } else {
                    Error::storage(format!("S3 get failed for {}: {}", key, e))
                }
            })?;

        let cas = response
            .e_tag()
            .map(Cas::new)
            .ok_or_else(|| Error::storage(format!("S3 did not return an ETag for {}", key)))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| Error::storage(format!("S3 body read failed: {}", e)))?;

        Ok((data.into_bytes(), cas))
    }
}

/// Conditional write rejections: 412 Precondition Failed, 409 concurrent conditional write.
fn is_precondition_failure<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .map(|response| matches!(response.status().as_u16(), 409 | 412))
        .unwrap_or(false)
}

#[async_trait]
impl Bucket for S3Bucket {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.fetch(key).await.map(|(data, _)| data)
    }

    #[instrument(skip(self))]
    async fn get_raw(&self, key: &str) -> Result<(Bytes, Cas)> {
        self.fetch(key).await
    }

    #[instrument(skip(self, data))]
    async fn set(&self, key: &str, data: Bytes) -> Result<Cas> {
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Error::storage(format!("S3 put failed for {}: {}", key, e)))?;

        Ok(response.e_tag().map(Cas::new).unwrap_or_default())
    }

    #[instrument(skip(self, data))]
    async fn write_cas(&self, key: &str, data: Bytes, cas: &Cas) -> Result<Cas> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data));

        request = match cas.token() {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        let response = request.send().await.map_err(|e| {
            if is_precondition_failure(&e) {
                Error::CasMismatch(key.to_string())
            } else {
                Error::storage(format!("S3 conditional put failed for {}: {}", key, e))
            }
        })?;

        response
            .e_tag()
            .map(Cas::new)
            .ok_or_else(|| Error::storage("S3 did not return an ETag for conditional put"))
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::storage(format!("S3 delete failed for {}: {}", key, e)))?;

        Ok(())
    }
}
