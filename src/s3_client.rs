// src/s3_client.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! `ObjectClient` over the AWS Rust SDK, and construction of the SDK client
//! from [`FsOptions`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime, DateTimeFormat};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart as AwsCompletedPart,
    CreateBucketConfiguration, Delete, ObjectCannedAcl, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use aws_smithy_http_client::tls;
use aws_smithy_http_client::tls::rustls_provider::CryptoMode;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::client::{
    ClientResult, CompleteOutcome, CompletedPart, ListPage, ListRequest, ObjectAttributes,
    ObjectClient, ObjectEntry, ObjectHead,
};
use crate::config::FsOptions;
use crate::constants::DEFAULT_REGION;
use crate::error::{ErrorDetail, KeyError};
use crate::retry::parse_embedded_error;

// -----------------------------------------------------------------------------
// TLS helper, for CA bundle
// -----------------------------------------------------------------------------

/// Create a TLS context using a CA bundle file
fn tls_context_from_pem(filename: impl AsRef<Path>) -> Result<tls::TlsContext> {
    let pem_contents = fs::read(&filename)
        .with_context(|| format!("Failed to read CA bundle file: {}", filename.as_ref().display()))?;

    let trust_store = tls::TrustStore::empty().with_pem_certificate(pem_contents.as_slice());

    tls::TlsContext::builder()
        .with_trust_store(trust_store)
        .build()
        .with_context(|| format!("Failed to build TLS context from PEM {}", filename.as_ref().display()))
}

// -----------------------------------------------------------------------------
// Error translation
// -----------------------------------------------------------------------------

fn error_detail<E>(err: &SdkError<E, HttpResponse>) -> ErrorDetail
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let mut detail = ErrorDetail {
        code: err.code().map(str::to_string),
        message: err
            .message()
            .map(str::to_string)
            .or_else(|| Some(DisplayErrorContext(err).to_string())),
        ..Default::default()
    };
    if let SdkError::ServiceError(service_err) = err {
        detail.exception_name = service_err.err().code().map(str::to_string);
    }
    if let Some(raw) = err.raw_response() {
        detail.http_status = Some(raw.status().as_u16());
        detail.server = raw.headers().get("server").map(str::to_string);
    }
    detail.retryable = matches!(
        err,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    );
    detail
}

fn to_chrono(dt: &AwsDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn build_error(what: &str, err: impl std::fmt::Display) -> ErrorDetail {
    ErrorDetail::new("InvalidRequest", format!("failed to build {}: {}", what, err))
}

/// Apply object attributes to a PutObject or CreateMultipartUpload builder.
macro_rules! with_attributes {
    ($req:expr, $attrs:expr) => {{
        let attrs: &ObjectAttributes = $attrs;
        let mut req = $req;
        if let Some(v) = &attrs.content_type {
            req = req.content_type(v);
        }
        if let Some(v) = &attrs.cache_control {
            req = req.cache_control(v);
        }
        if let Some(v) = &attrs.content_language {
            req = req.content_language(v);
        }
        if let Some(v) = &attrs.expires {
            match AwsDateTime::from_str(v, DateTimeFormat::HttpDate) {
                Ok(dt) => req = req.expires(dt),
                Err(e) => debug!("ignoring unparseable Expires '{}': {}", v, e),
            }
        }
        if let Some(v) = &attrs.acl {
            req = req.acl(ObjectCannedAcl::from(v.as_str()));
        }
        req
    }};
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// S3 access through the AWS SDK.
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
}

impl S3Client {
    pub fn from_sdk(client: Client) -> Self {
        Self { client }
    }

    pub fn sdk(&self) -> &Client {
        &self.client
    }

    /// Build an SDK client from options.  Credentials come from the default
    /// provider chain (environment, profile, IMDS).
    pub async fn connect(opts: &FsOptions) -> Result<Self> {
        opts.validate()?;

        let http_client = match &opts.tls_ca_file_path {
            Some(ca_bundle_path) => {
                debug!("Loading CA bundle from: {}", ca_bundle_path);
                let tls_context = tls_context_from_pem(ca_bundle_path)?;
                Some(
                    aws_smithy_http_client::Builder::new()
                        .tls_provider(tls::Provider::Rustls(CryptoMode::AwsLc))
                        .tls_context(tls_context)
                        .build_https(),
                )
            }
            None => None,
        };

        let region = RegionProviderChain::first_try(opts.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::v2025_08_07()).region(region);
        if let Some(endpoint) = opts.endpoint_url()? {
            debug!("Using S3 endpoint {}", endpoint);
            loader = loader.endpoint_url(endpoint);
        }

        let timeout_config = TimeoutConfig::builder()
            .connect_timeout(opts.connect_timeout)
            .operation_timeout(opts.request_timeout)
            .build();
        loader = loader.timeout_config(timeout_config);
        if let Some(client) = http_client {
            loader = loader.http_client(client);
        }
        let cfg = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&cfg)
            .force_path_style(opts.force_path_style)
            .build();
        Ok(Self::from_sdk(Client::from_conf(s3_config)))
    }
}

#[async_trait]
impl ObjectClient for S3Client {
    async fn head_bucket(&self, bucket: &str) -> ClientResult<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }

    async fn create_bucket(&self, bucket: &str, region: Option<&str>) -> ClientResult<()> {
        let mut req = self.client.create_bucket().bucket(bucket);
        // us-east-1 is the implicit location and must not be sent as a constraint.
        if let Some(region) = region.filter(|r| *r != DEFAULT_REGION) {
            let cfg = CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build();
            req = req.create_bucket_configuration(cfg);
        }
        req.send().await.map(|_| ()).map_err(|e| error_detail(&e))
    }

    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()> {
        self.client
            .delete_bucket()
            .bucket(bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }

    async fn list_buckets(&self) -> ClientResult<Vec<String>> {
        let out = self.client.list_buckets().send().await.map_err(|e| error_detail(&e))?;
        Ok(out
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> ClientResult<ObjectHead> {
        let out = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| error_detail(&e))?;
        Ok(ObjectHead {
            size: out.content_length().unwrap_or(0).max(0) as u64,
            content_type: out.content_type().map(str::to_string),
            last_modified: out.last_modified().and_then(to_chrono),
            e_tag: out.e_tag().map(str::to_string),
            version_id: out.version_id().map(str::to_string),
            cache_control: out.cache_control().map(str::to_string),
            content_language: out.content_language().map(str::to_string),
            expires: out.expires_string().map(str::to_string),
        })
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> ClientResult<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        let out = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={}-{}", offset, offset + length - 1))
            .send()
            .await
            .map_err(|e| error_detail(&e))?;
        let body = out.body.collect().await.map_err(|e| {
            ErrorDetail::new("ResponseError", format!("error reading object body: {}", e)).retryable(true)
        })?;
        Ok(body.into_bytes())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        attrs: &ObjectAttributes,
    ) -> ClientResult<()> {
        let req = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body));
        with_attributes!(req, attrs)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }

    async fn copy_object(&self, source: &str, bucket: &str, key: &str) -> ClientResult<()> {
        self.client
            .copy_object()
            .copy_source(source)
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> ClientResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }

    async fn delete_objects(&self, bucket: &str, keys: &[String]) -> ClientResult<Vec<KeyError>> {
        let objects = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| build_error("ObjectIdentifier", e))?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .map_err(|e| build_error("Delete", e))?;
        let out = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| error_detail(&e))?;
        Ok(out
            .errors()
            .iter()
            .map(|e| KeyError {
                key: e.key().unwrap_or_default().to_string(),
                detail: ErrorDetail {
                    code: e.code().map(str::to_string),
                    message: e.message().map(str::to_string),
                    ..Default::default()
                },
            })
            .collect())
    }

    async fn list_objects(&self, req: &ListRequest) -> ClientResult<ListPage> {
        let out = self
            .client
            .list_objects_v2()
            .bucket(&req.bucket)
            .set_prefix(req.prefix.clone())
            .set_delimiter(req.delimiter.clone())
            .set_continuation_token(req.continuation_token.clone())
            .set_max_keys(req.max_keys)
            .send()
            .await
            .map_err(|e| error_detail(&e))?;

        let objects: Vec<ObjectEntry> = out
            .contents()
            .iter()
            .filter_map(|o| {
                o.key().map(|k| ObjectEntry {
                    key: k.to_string(),
                    size: o.size().unwrap_or(0).max(0) as u64,
                    last_modified: o.last_modified().and_then(to_chrono),
                })
            })
            .collect();
        let common_prefixes: Vec<String> = out
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
        let key_count = out
            .key_count()
            .map(|n| n.max(0) as usize)
            .unwrap_or(objects.len() + common_prefixes.len());
        Ok(ListPage {
            objects,
            common_prefixes,
            key_count,
            is_truncated: out.is_truncated() == Some(true),
            next_continuation_token: out.next_continuation_token().map(str::to_string),
        })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        attrs: &ObjectAttributes,
    ) -> ClientResult<String> {
        let req = self.client.create_multipart_upload().bucket(bucket).key(key);
        let out = with_attributes!(req, attrs)
            .send()
            .await
            .map_err(|e| error_detail(&e))?;
        match out.upload_id() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(ErrorDetail::new(
                "InvalidResponse",
                "CreateMultipartUpload returned empty upload_id",
            )),
        }
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> ClientResult<String> {
        let out = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| error_detail(&e))?;
        Ok(out.e_tag().unwrap_or_default().to_string())
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ClientResult<CompleteOutcome> {
        let completed: Vec<AwsCompletedPart> = parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .e_tag(&p.e_tag)
                    .part_number(p.part_number)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        match self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
        {
            Ok(out) => Ok(CompleteOutcome {
                e_tag: out.e_tag().map(str::to_string),
                embedded_error: None,
            }),
            Err(err) => {
                // A 2xx status with an error document is reported as embedded.
                let raw_ok = err.raw_response().filter(|r| r.status().is_success());
                match raw_ok {
                    Some(raw) => {
                        let mut detail = raw
                            .body()
                            .bytes()
                            .and_then(parse_embedded_error)
                            .unwrap_or_else(|| error_detail(&err));
                        detail.server = raw.headers().get("server").map(str::to_string);
                        detail.retryable = true;
                        Ok(CompleteOutcome { e_tag: None, embedded_error: Some(detail) })
                    }
                    None => Err(error_detail(&err)),
                }
            }
        }
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ClientResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| error_detail(&e))
    }
}
