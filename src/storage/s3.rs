//! Amazon S3 backend.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication,
//! using path-style addressing so one client reaches every bucket. A
//! container is a bucket; an object name is a key.
//!
//! Uses only pure-Rust dependencies (`hmac`, `sha2`) for AWS signing, so it
//! builds anywhere without C toolchains for `aws-lc-sys`.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! region = "us-east-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)
//!
//! # Operations
//!
//! | Trait method | S3 API |
//! |--------------|--------|
//! | `list_containers` | `ListBuckets` |
//! | `create_container` | `CreateBucket` |
//! | `list_objects` | `ListObjectsV2` (paginated) |
//! | `upload` | `HeadObject` (when not replacing) + `PutObject` |
//! | `download` | `GetObject` |

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Method;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{check_object_name, ObjectInfo, ObjectMetadata, ObjectStore};
use crate::config::S3Config;
use crate::error::{IngestError, Result};

type HmacSha256 = Hmac<Sha256>;

/// AWS credentials loaded from environment variables.
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
    /// and optionally `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| IngestError::config("AWS_ACCESS_KEY_ID environment variable not set"))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
            IngestError::config("AWS_SECRET_ACCESS_KEY environment variable not set")
        })?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self::new(access_key_id, secret_access_key, session_token))
    }
}

pub struct S3ObjectStore {
    config: S3Config,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(config: S3Config, creds: AwsCredentials) -> Self {
        Self {
            config,
            creds,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env(config: S3Config) -> Result<Self> {
        Ok(Self::new(config, AwsCredentials::from_env()?))
    }

    /// Sign and send one request.
    ///
    /// `bucket` and `key` form the path-style canonical URI; every
    /// `x-amz-*` header passed in `extra_headers` is signed.
    async fn send(
        &self,
        method: Method,
        bucket: Option<&str>,
        key: Option<&str>,
        query: &[(String, String)],
        body: Vec<u8>,
        extra_headers: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let (scheme, host) = endpoint(&self.config);

        let mut canonical_uri = String::from("/");
        if let Some(bucket) = bucket {
            canonical_uri.push_str(&uri_encode(bucket));
            if let Some(key) = key {
                canonical_uri.push('/');
                canonical_uri.push_str(&encode_key(key));
            }
        }

        // Build canonical query string (must be sorted)
        let mut sorted_params = query.to_vec();
        sorted_params.sort();
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.trim().to_string()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req_builder = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &authorization);
        for (k, v) in &headers {
            if k != "host" {
                req_builder = req_builder.header(k.as_str(), v.as_str());
            }
        }
        if !body.is_empty() {
            req_builder = req_builder.body(body);
        }

        debug!(method = %method, url = %url, "s3 request");
        req_builder
            .send()
            .await
            .map_err(|e| IngestError::storage(format!("S3 {} {} failed: {}", method, url, e)))
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool> {
        let resp = self
            .send(Method::HEAD, Some(bucket), Some(key), &[], Vec::new(), &[])
            .await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => Err(IngestError::storage(format!(
                "S3 HeadObject failed (HTTP {}) for s3://{}/{}",
                status, bucket, key
            ))),
        }
    }
}

/// Turn a non-success response into a storage error carrying the body.
async fn check_status(resp: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(IngestError::storage(format!(
        "S3 {} failed (HTTP {}): {}",
        operation,
        status,
        body.chars().take(500).collect::<String>()
    )))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn kind(&self) -> &str {
        "s3"
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        let resp = self.send(Method::GET, None, None, &[], Vec::new(), &[]).await?;
        let resp = check_status(resp, "ListBuckets").await?;
        let xml = resp
            .text()
            .await
            .map_err(|e| IngestError::storage(e.to_string()))?;
        Ok(parse_list_buckets_response(&xml))
    }

    async fn create_container(&self, name: &str) -> Result<()> {
        let body = if self.config.region == "us-east-1" {
            Vec::new()
        } else {
            format!(
                "<CreateBucketConfiguration xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
                 <LocationConstraint>{}</LocationConstraint></CreateBucketConfiguration>",
                self.config.region
            )
            .into_bytes()
        };
        let resp = self.send(Method::PUT, Some(name), None, &[], body, &[]).await?;
        check_status(resp, "CreateBucket").await?;
        Ok(())
    }

    async fn list_objects(&self, container: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("max-keys".to_string(), "1000".to_string()),
            ];
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self
                .send(Method::GET, Some(container), None, &query, Vec::new(), &[])
                .await?;
            let resp = check_status(resp, "ListObjectsV2").await?;
            let xml = resp
                .text()
                .await
                .map_err(|e| IngestError::storage(e.to_string()))?;

            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml);
            objects.extend(batch);

            match (is_truncated, next_token) {
                (true, Some(token)) => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }

    async fn upload(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        metadata: &ObjectMetadata,
        replace: bool,
    ) -> Result<bool> {
        check_object_name(path)?;
        if !replace && self.head_object(container, path).await? {
            debug!(container, path, "object exists and replace is false");
            return Ok(false);
        }

        let headers: Vec<(String, String)> = metadata
            .iter()
            .map(|(k, v)| (format!("x-amz-meta-{}", k.to_lowercase()), v.clone()))
            .collect();

        let resp = self
            .send(
                Method::PUT,
                Some(container),
                Some(path),
                &[],
                bytes.to_vec(),
                &headers,
            )
            .await?;
        check_status(resp, "PutObject").await?;
        Ok(true)
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        check_object_name(path)?;
        let resp = self
            .send(Method::GET, Some(container), Some(path), &[], Vec::new(), &[])
            .await?;
        let resp = check_status(resp, "GetObject").await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| IngestError::storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn object_url(&self, container: &str, path: &str) -> String {
        format!("s3://{}/{}", container, path)
    }
}

// ============ AWS SigV4 Helpers ============

/// Scheme and host for requests.
///
/// A custom `endpoint_url` (MinIO, LocalStack) keeps its scheme; otherwise
/// the regional AWS endpoint is used over HTTPS.
fn endpoint(config: &S3Config) -> (&'static str, String) {
    match config.endpoint_url {
        Some(ref endpoint) => {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            (scheme, host)
        }
        None => ("https", format!("s3.{}.amazonaws.com", config.region)),
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, leaving only `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Encode an object key segment by segment, keeping `/` separators.
fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

// ============ XML Parsing ============

/// Parse a `ListObjectsV2` response: objects, truncation flag, next token.
fn parse_list_objects_response(xml: &str) -> (Vec<ObjectInfo>, bool, Option<String>) {
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let objects = xml_blocks(xml, "Contents")
        .into_iter()
        .filter_map(|block| {
            let key = extract_xml_value(block, "Key")?;
            // Zero-byte "folder" markers are not documents
            if key.is_empty() || key.ends_with('/') {
                return None;
            }
            let etag = extract_xml_value(block, "ETag")
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            let size = extract_xml_value(block, "Size")
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some(ObjectInfo {
                name: key,
                size,
                etag,
            })
        })
        .collect();

    (objects, is_truncated, next_token)
}

fn parse_list_buckets_response(xml: &str) -> Vec<String> {
    xml_blocks(xml, "Bucket")
        .into_iter()
        .filter_map(|block| extract_xml_value(block, "Name"))
        .collect()
}

/// Inner text of every `<tag>...</tag>` block (non-nested).
fn xml_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut blocks = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        let block_start = start + open.len();
        match remaining[block_start..].find(&close) {
            Some(end) => {
                blocks.push(&remaining[block_start..block_start + end]);
                remaining = &remaining[block_start + end + close.len()..];
            }
            None => break,
        }
    }
    blocks
}

/// Text content of the first `<tag>` element, with XML entities decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    Some(unescape_xml(&xml[start..start + end]))
}

fn unescape_xml(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
