//! Object storage for the original uploaded files.
//!
//! [`ObjectStore`] is the seam the orchestrator and the relay depend on;
//! [`S3ObjectStore`] implements it against any S3-compatible service (AWS S3
//! or MinIO) with hand-rolled AWS Signature V4:
//!
//! - `put` / `get` / `delete` / `exists` send header-signed REST requests
//!   (`PUT`, `GET`, `DELETE`, `HEAD` on the object URL).
//! - `presigned_url` signs a `GET` in the query string so a browser can fetch
//!   the file directly for a limited time.
//!
//! When `endpoint_url` is configured the client uses path-style addressing
//! (`{endpoint}/{bucket}/{key}`), which MinIO requires; otherwise
//! virtual-hosted style on `{bucket}.s3.{region}.amazonaws.com`.
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
//! optional `AWS_SESSION_TOKEN`.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::config::ObjectStoreConfig;
use crate::error::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// A time-limited URL that allows an anonymous `GET` of `key`.
    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    /// Load credentials from standard AWS environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

pub struct S3ObjectStore {
    client: reqwest::Client,
    config: ObjectStoreConfig,
    creds: AwsCredentials,
}

/// Where an object lives: scheme, `Host` header value and canonical URI.
struct ObjectLocation {
    scheme: &'static str,
    host: String,
    canonical_uri: String,
}

impl ObjectLocation {
    fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.canonical_uri)
    }
}

impl S3ObjectStore {
    pub fn new(client: reqwest::Client, config: ObjectStoreConfig, creds: AwsCredentials) -> Self {
        Self {
            client,
            config,
            creds,
        }
    }

    fn locate(&self, key: &str) -> ObjectLocation {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match self.config.endpoint_url {
            Some(ref endpoint) => {
                // Custom endpoint (MinIO, LocalStack, etc.)
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
                ObjectLocation {
                    scheme,
                    host,
                    canonical_uri: format!("/{}/{}", uri_encode(&self.config.bucket), encoded_key),
                }
            }
            None => ObjectLocation {
                scheme: "https",
                host: format!(
                    "{}.s3.{}.amazonaws.com",
                    self.config.bucket, self.config.region
                ),
                canonical_uri: format!("/{}", encoded_key),
            },
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        key: &str,
        body: Option<(Bytes, Option<&str>)>,
    ) -> Result<reqwest::Response> {
        let location = self.locate(key);
        let payload_hash = match body {
            Some((ref bytes, _)) => hex_sha256(bytes),
            None => hex_sha256(b""),
        };
        let headers = sign_headers(
            &self.creds,
            &self.config.region,
            method.as_str(),
            &location.host,
            &location.canonical_uri,
            &payload_hash,
            Utc::now(),
        );

        let mut req = self.client.request(method.clone(), location.url());
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some((bytes, content_type)) = body {
            if let Some(ct) = content_type {
                req = req.header("Content-Type", ct);
            }
            req = req.body(bytes);
        }

        req.send().await.map_err(|e| {
            GatewayError::object_store(format!(
                "{} s3://{}/{} failed: {}",
                method, self.config.bucket, key, e
            ))
        })
    }
}

async fn status_error(op: &str, key: &str, resp: reqwest::Response) -> GatewayError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    GatewayError::object_store(format!(
        "{} {} failed (HTTP {}): {}",
        op,
        key,
        status,
        body.chars().take(500).collect::<String>()
    ))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: Option<&str>) -> Result<()> {
        let size = bytes.len();
        let resp = self
            .send(reqwest::Method::PUT, key, Some((bytes, content_type)))
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("PutObject", key, resp).await);
        }
        tracing::debug!(bucket = %self.config.bucket, key, size, "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let resp = self.send(reqwest::Method::GET, key, None).await?;
        if !resp.status().is_success() {
            return Err(status_error("GetObject", key, resp).await);
        }
        resp.bytes()
            .await
            .map_err(|e| GatewayError::object_store(format!("reading {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self.send(reqwest::Method::DELETE, key, None).await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(status_error("DeleteObject", key, resp).await);
        }
        tracing::debug!(bucket = %self.config.bucket, key, "object deleted");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let resp = self.send(reqwest::Method::HEAD, key, None).await?;
        match resp.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error("HeadObject", key, resp).await),
        }
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if key.is_empty() {
            return Err(GatewayError::object_store("cannot presign an empty key"));
        }
        let location = self.locate(key);
        Ok(presign_get(
            &self.creds,
            &self.config.region,
            location.scheme,
            &location.host,
            &location.canonical_uri,
            ttl,
            Utc::now(),
        ))
    }
}

// ============ SigV4 ============

/// Headers (including `Authorization`) for a header-signed request.
fn sign_headers(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    host: &str,
    canonical_uri: &str,
    payload_hash: &str,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

    let mut headers = vec![
        ("host".to_string(), host.to_string()),
        ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
        ("x-amz-date".to_string(), amz_date.clone()),
    ];
    if let Some(ref token) = creds.session_token {
        headers.push(("x-amz-security-token".to_string(), token.clone()));
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
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, payload_hash
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    );

    // reqwest derives Host from the URL
    headers.retain(|(k, _)| k != "host");
    headers.push(("Authorization".to_string(), authorization));
    headers
}

/// Query-string presigned `GET` URL.
fn presign_get(
    creds: &AwsCredentials,
    region: &str,
    scheme: &str,
    host: &str,
    canonical_uri: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);

    let mut params = vec![
        ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential".to_string(),
            format!("{}/{}", creds.access_key_id, credential_scope),
        ),
        ("X-Amz-Date".to_string(), amz_date.clone()),
        ("X-Amz-Expires".to_string(), ttl.as_secs().to_string()),
        ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
    ];
    if let Some(ref token) = creds.session_token {
        params.push(("X-Amz-Security-Token".to_string(), token.clone()));
    }
    params.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical_querystring: String = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        canonical_uri, canonical_querystring, host, UNSIGNED_PAYLOAD
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

    format!(
        "{}://{}{}?{}&X-Amz-Signature={}",
        scheme, host, canonical_uri, canonical_querystring, signature
    )
}

/// Compute hex-encoded SHA-256 hash.
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

/// URI-encode per SigV4: everything except unreserved characters.
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
