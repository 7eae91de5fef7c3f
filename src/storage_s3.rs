//! Amazon S3 storage.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (`hmac` + `sha2`, no C dependencies). Supports `ListObjectsV2`
//! pagination and custom endpoints for S3-compatible services (MinIO,
//! LocalStack), which are addressed path-style.
//!
//! # Credentials
//!
//! Taken from `s3.access_key` / `s3.secret_key` (or `S3_ACCESS_KEY` /
//! `S3_SECRET_KEY`), falling back to `AWS_ACCESS_KEY_ID` /
//! `AWS_SECRET_ACCESS_KEY`. `AWS_SESSION_TOKEN` is honoured when set.
//!
//! Paths handed to this backend are object keys relative to the bucket; a
//! leading `/` or `s3://<bucket>/` is stripped.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::io::StreamReader;

use crate::config::S3Config;
use crate::storage::{base_name, BoxedReader, FileInfo, Storage};

type HmacSha256 = Hmac<Sha256>;

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn resolve(config: &S3Config) -> Result<Self> {
        let access_key_id = match config.access_key.as_deref().filter(|k| !k.is_empty()) {
            Some(k) => k.to_string(),
            None => std::env::var("AWS_ACCESS_KEY_ID")
                .context("S3 access key not configured (s3.access_key or AWS_ACCESS_KEY_ID)")?,
        };
        let secret_access_key = match config.secret_key.as_deref().filter(|k| !k.is_empty()) {
            Some(k) => k.to_string(),
            None => std::env::var("AWS_SECRET_ACCESS_KEY").context(
                "S3 secret key not configured (s3.secret_key or AWS_SECRET_ACCESS_KEY)",
            )?,
        };
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Storage ============

pub struct S3Storage {
    bucket: String,
    region: String,
    scheme: &'static str,
    host: String,
    /// `/<bucket>` for path-style endpoints, empty for virtual-hosted AWS.
    path_prefix: String,
    creds: AwsCredentials,
    http: reqwest::Client,
}

/// One entry of a `ListObjectsV2` page.
#[derive(Debug, Clone, PartialEq)]
struct S3Object {
    key: String,
    size: u64,
    last_modified: i64,
}

impl S3Storage {
    pub fn new(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            bail!("s3.bucket must be set for S3 storage");
        }
        let creds = AwsCredentials::resolve(config)?;
        let (scheme, host, path_prefix) = endpoint_parts(config);

        Ok(Self {
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            scheme,
            host,
            path_prefix,
            creds,
            http: reqwest::Client::new(),
        })
    }

    fn key<'a>(&self, path: &'a str) -> &'a str {
        let path = path.strip_prefix("s3://").map_or(path, |rest| {
            rest.strip_prefix(self.bucket.as_str()).unwrap_or(rest)
        });
        path.trim_start_matches('/')
    }

    /// Send a SigV4-signed request for `key` with `query` parameters.
    async fn signed_request(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("{}/{}", self.path_prefix, encoded_key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut sorted_params = query.to_vec();
        sorted_params.sort();
        let canonical_querystring: String = sorted_params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let payload_hash = hex_sha256(&body);

        let mut headers = vec![
            ("host".to_string(), self.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
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
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_querystring,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut url = format!("{}://{}{}", self.scheme, self.host, canonical_uri);
        if !canonical_querystring.is_empty() {
            url.push('?');
            url.push_str(&canonical_querystring);
        }

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        req.send()
            .await
            .with_context(|| format!("S3 {} s3://{}/{} failed", method, self.bucket, key))
    }

    /// All objects under `prefix`, following continuation tokens.
    async fn list_objects(&self, prefix: &str, max_keys: Option<usize>) -> Result<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                (
                    "max-keys".to_string(),
                    max_keys.unwrap_or(1000).to_string(),
                ),
            ];
            if !prefix.is_empty() {
                query.push(("prefix".to_string(), prefix.to_string()));
            }
            if let Some(ref token) = continuation_token {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let resp = self.signed_request(Method::GET, "", &query, Vec::new()).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let xml_body = resp.text().await?;
            let (batch, is_truncated, next_token) = parse_list_objects_response(&xml_body);
            objects.extend(batch);

            if max_keys.is_some() || !is_truncated || next_token.is_none() {
                break;
            }
            continuation_token = next_token;
        }

        Ok(objects)
    }

    async fn head(&self, key: &str) -> Result<Option<reqwest::Response>> {
        let resp = self.signed_request(Method::HEAD, key, &[], Vec::new()).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp)),
            s => bail!("S3 HeadObject failed (HTTP {}) for key '{}'", s, key),
        }
    }

    async fn get(&self, key: &str) -> Result<reqwest::Response> {
        let resp = self.signed_request(Method::GET, key, &[], Vec::new()).await?;
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }
        Ok(resp)
    }
}

fn dir_prefix(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{}/", key)
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.key(path);
        let bytes = self.get(key).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(path);
        let resp = self
            .signed_request(Method::PUT, key, &[], data.to_vec())
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 PutObject failed (HTTP {}) for key '{}': {}", status, key, body);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let key = self.key(prefix);
        if !key.is_empty() && self.head(key).await?.is_some() {
            return Ok(vec![key.to_string()]);
        }
        let mut keys: Vec<String> = self
            .list_objects(&dir_prefix(key), None)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        let resp = self
            .signed_request(Method::DELETE, key, &[], Vec::new())
            .await?;
        if !resp.status().is_success() {
            bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        if self.head(key).await?.is_some() {
            return Ok(true);
        }
        self.is_directory(path).await
    }

    async fn is_directory(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        if key.is_empty() {
            return Ok(true);
        }
        let found = self.list_objects(&dir_prefix(key), Some(1)).await?;
        Ok(!found.is_empty())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let key = self.key(path);
        if let Some(resp) = self.head(key).await? {
            let size = resp
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let modified = resp
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            return Ok(FileInfo {
                name: base_name(key).to_string(),
                size,
                mode: 0o644,
                modified,
                is_dir: false,
            });
        }

        let objects = self.list_objects(&dir_prefix(key), None).await?;
        if objects.is_empty() {
            bail!("s3://{}/{} not found", self.bucket, key);
        }
        let latest = objects.iter().map(|o| o.last_modified).max().unwrap_or(0);
        Ok(FileInfo {
            name: base_name(key).to_string(),
            size: 0,
            mode: 0o755,
            modified: DateTime::from_timestamp(latest, 0).unwrap_or_default(),
            is_dir: true,
        })
    }

    async fn get_reader(&self, path: &str) -> Result<BoxedReader> {
        let key = self.key(path);
        let stream = self
            .get(key)
            .await?
            .bytes_stream()
            .map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}

// ============ AWS SigV4 Helpers ============

/// Scheme, host, and path prefix for requests.
///
/// A custom endpoint (MinIO, LocalStack) is addressed path-style with the
/// scheme it was given; otherwise `<bucket>.s3.<region>.amazonaws.com`.
fn endpoint_parts(config: &S3Config) -> (&'static str, String, String) {
    match config.endpoint.as_deref().filter(|e| !e.is_empty()) {
        Some(endpoint) => {
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
            (scheme, host, format!("/{}", config.bucket))
        }
        None => (
            "https",
            format!("{}.s3.{}.amazonaws.com", config.bucket, config.region),
            String::new(),
        ),
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

/// RFC 3986 encoding of everything except `A-Z a-z 0-9 - _ . ~`.
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

// ============ XML Parsing ============

/// Parse one `ListObjectsV2` page: objects, truncation flag, next token.
/// Folder placeholder keys (ending in `/`) are skipped.
fn parse_list_objects_response(xml: &str) -> (Vec<S3Object>, bool, Option<String>) {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated")
        .map(|v| v == "true")
        .unwrap_or(false);
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").unwrap_or_default();
        if key.is_empty() || key.ends_with('/') {
            continue;
        }

        let last_modified = extract_xml_value(block, "LastModified")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        let size = extract_xml_value(block, "Size")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        objects.push(S3Object {
            key,
            size,
            last_modified,
        });
    }

    (objects, is_truncated, next_token)
}

/// Text content of the first `<tag>`, with XML escapes decoded.
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)?;
    let raw = &xml[start..start + end];
    Some(
        quick_xml::escape::unescape(raw)
            .map(|v| v.into_owned())
            .unwrap_or_else(|_| raw.to_string()),
    )
}
