use crate::config::S3Config;
use crate::model::Attachment;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors reported by a blob store
#[derive(Error, Debug)]
pub enum BlobStoreError {
    /// Any failure while storing, publishing or resolving an uploaded object
    #[error("Failed to upload object {object}: {reason}")]
    UploadFailed { object: String, reason: String },

    #[error("Blob store request failed: {0}")]
    Request(String),
}

impl BlobStoreError {
    pub fn upload_failed(object: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UploadFailed {
            object: object.into(),
            reason: reason.into(),
        }
    }
}

/// Object listing entry
#[derive(Debug, Clone, PartialEq)]
pub struct BlobObject {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Object storage holding post attachments
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `attachment` as `bucket/object_name`, make it publicly readable
    /// and return its public media URL. Not retried.
    async fn upload(
        &self,
        attachment: &Attachment,
        bucket: &str,
        object_name: &str,
    ) -> Result<String, BlobStoreError>;

    /// List every object in the bucket
    async fn list_objects(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobStoreError>;

    async fn delete_object(&self, bucket: &str, object_name: &str) -> Result<(), BlobStoreError>;

    /// Public URL of an object, without checking that it exists
    fn object_url(&self, bucket: &str, object_name: &str) -> String;

    /// Check that the bucket is reachable
    async fn health_check(&self, bucket: &str) -> Result<(), BlobStoreError>;
}

/// S3-backed attachment storage
pub struct S3BlobStore {
    client: S3Client,
    config: S3Config,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        attachment: &Attachment,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(attachment.data.clone()))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("Failed to put object")?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        attachment: &Attachment,
        bucket: &str,
        key: &str,
        content_type: &str,
    ) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("Failed to create multipart upload")?;

        let upload_id = create_response
            .upload_id()
            .context("No upload ID in response")?
            .to_string();

        match self.upload_parts(attachment, bucket, key, &upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
                    .context("Failed to complete multipart upload")?;
                Ok(())
            }
            Err(e) => {
                // Parts already stored keep accruing cost until the upload is aborted
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        attachment: &Attachment,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in attachment.data.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let response = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(attachment.data.slice_ref(chunk)))
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
                .with_context(|| format!("Failed to upload part {}", part_number))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        Ok(completed_parts)
    }

    async fn store_and_publish(
        &self,
        attachment: &Attachment,
        bucket: &str,
        key: &str,
    ) -> Result<String> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("Bucket {} is not reachable", bucket))?;

        let content_type = content_type_for(attachment);

        if attachment.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(attachment, bucket, key, &content_type)
                .await?;
        } else {
            self.simple_upload(attachment, bucket, key, &content_type)
                .await?;
        }

        self.client
            .put_object_acl()
            .bucket(bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("Failed to grant public read access")?;

        // Resolve the stored object before handing out its link
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("Failed to resolve uploaded object")?;

        Ok(public_object_url(&self.config, bucket, key))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, attachment), fields(size_bytes = attachment.len()))]
    async fn upload(
        &self,
        attachment: &Attachment,
        bucket: &str,
        object_name: &str,
    ) -> Result<String, BlobStoreError> {
        let key = sanitize_path_component(object_name);

        debug!(key = %key, "Uploading attachment to S3");

        let url = self
            .store_and_publish(attachment, bucket, &key)
            .await
            .map_err(|e| BlobStoreError::upload_failed(object_name, format!("{:#}", e)))?;

        info!(key = %key, url = %url, "Attachment saved to S3");

        Ok(url)
    }

    async fn list_objects(&self, bucket: &str) -> Result<Vec<BlobObject>, BlobStoreError> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| BlobStoreError::Request(DisplayErrorContext(&e).to_string()))?;

            objects.extend(response.contents().iter().filter_map(|obj| {
                let key = obj.key()?;
                let last_modified = obj
                    .last_modified()
                    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()));
                Some(BlobObject {
                    key: key.to_string(),
                    last_modified,
                })
            }));

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, object_name: &str) -> Result<(), BlobStoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(sanitize_path_component(object_name))
            .send()
            .await
            .map_err(|e| BlobStoreError::Request(DisplayErrorContext(&e).to_string()))?;

        debug!(object = %object_name, "Object deleted from S3");
        Ok(())
    }

    fn object_url(&self, bucket: &str, object_name: &str) -> String {
        public_object_url(&self.config, bucket, &sanitize_path_component(object_name))
    }

    async fn health_check(&self, bucket: &str) -> Result<(), BlobStoreError> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| BlobStoreError::Request(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

/// Public URL under which an object is served
///
/// Order of preference: configured public base URL, custom endpoint in
/// path-style form, then the regional virtual-hosted AWS form.
pub fn public_object_url(config: &S3Config, bucket: &str, key: &str) -> String {
    if let Some(ref base) = config.public_base_url {
        return format!("{}/{}", base.trim_end_matches('/'), key);
    }

    match config.endpoint_url {
        Some(ref endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), bucket, key),
        None => format!(
            "https://{}.s3.{}.amazonaws.com/{}",
            bucket, config.region, key
        ),
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Content type declared by the client, falling back to the file extension
fn content_type_for(attachment: &Attachment) -> String {
    if let Some(ref content_type) = attachment.content_type {
        if !content_type.is_empty() {
            return content_type.clone();
        }
    }

    let extension = attachment
        .file_name
        .as_deref()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .unwrap_or_default();

    get_content_type(extension)
}

/// Get content type for an image extension
fn get_content_type(format: &str) -> String {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg".to_string(),
        "png" => "image/png".to_string(),
        "webp" => "image/webp".to_string(),
        "bmp" => "image/bmp".to_string(),
        "gif" => "image/gif".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config() -> S3Config {
        S3Config {
            bucket: "post-images".to_string(),
            region: "us-west-2".to_string(),
            endpoint_url: None,
            force_path_style: false,
            public_base_url: None,
            multipart_threshold_bytes: 5 * 1024 * 1024,
            part_size_bytes: 5 * 1024 * 1024,
        }
    }

    #[test]
    fn test_public_url_aws() {
        let config = s3_config();
        assert_eq!(
            public_object_url(&config, "post-images", "abc"),
            "https://post-images.s3.us-west-2.amazonaws.com/abc"
        );
    }

    #[test]
    fn test_public_url_custom_endpoint() {
        let mut config = s3_config();
        config.endpoint_url = Some("http://localhost:9000/".to_string());
        config.force_path_style = true;
        assert_eq!(
            public_object_url(&config, "post-images", "abc"),
            "http://localhost:9000/post-images/abc"
        );
    }

    #[test]
    fn test_public_url_prefers_base_url() {
        let mut config = s3_config();
        config.endpoint_url = Some("http://localhost:9000".to_string());
        config.public_base_url = Some("https://media.around.app".to_string());
        assert_eq!(
            public_object_url(&config, "post-images", "abc"),
            "https://media.around.app/abc"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(
            sanitize_path_component("550e8400-e29b-41d4-a716-446655440000"),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(sanitize_path_component("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[test]
    fn test_content_type_for() {
        let declared = Attachment::new(vec![1u8]).with_content_type("image/png");
        assert_eq!(content_type_for(&declared), "image/png");

        let mut named = Attachment::new(vec![1u8]);
        named.file_name = Some("sunset.JPG".to_string());
        assert_eq!(content_type_for(&named), "image/jpeg");

        let bare = Attachment::new(vec![1u8]);
        assert_eq!(content_type_for(&bare), "application/octet-stream");
    }

    #[test]
    fn test_get_content_type() {
        assert_eq!(get_content_type("jpeg"), "image/jpeg");
        assert_eq!(get_content_type("PNG"), "image/png");
        assert_eq!(get_content_type("unknown"), "application/octet-stream");
    }
}
