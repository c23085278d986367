//! Object storage for the history file and its cursor.
//!
//! With `--s3` the pipeline pulls both files from a bucket once at start and
//! pushes them back after every applied day, so a fresh machine can resume
//! replication where the previous one stopped.
//!
//! Requests are signed with AWS Signature V4 using `hmac` + `sha2`.
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and,
//! optionally, `AWS_SESSION_TOKEN`. A custom `endpoint_url` (MinIO,
//! LocalStack) switches to path-style addressing.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch `key` into `dest`. Returns `false` when the object does not exist.
    async fn download(&self, key: &str, dest: &Path) -> Result<bool>;

    async fn upload(&self, source: &Path, key: &str) -> Result<()>;
}

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self> {
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

pub struct S3Store {
    config: S3Config,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3Store {
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

    fn signed(
        &self,
        method: reqwest::Method,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<reqwest::RequestBuilder> {
        let target = object_target(&self.config, key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), UNSIGNED_PAYLOAD.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }

        let authorization = authorization_header(
            &self.creds,
            &self.config.region,
            method.as_str(),
            &target.canonical_uri,
            &mut headers,
            &date_stamp,
            &amz_date,
        )?;

        let mut req = self
            .client
            .request(method, &target.url)
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", UNSIGNED_PAYLOAD)
            .header("x-amz-date", &amz_date);
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        Ok(req)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn download(&self, key: &str, dest: &Path) -> Result<bool> {
        let resp = self
            .signed(reqwest::Method::GET, key, Utc::now())?
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.config.bucket, key))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(bucket = %self.config.bucket, key, "object not found");
            return Ok(false);
        }
        if !resp.status().is_success() {
            bail!(
                "S3 GetObject failed (HTTP {}) for key '{}'",
                resp.status(),
                key
            );
        }

        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;
        let mut resp = resp;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            written += chunk.len() as u64;
        }
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        drop(file);
        tokio::fs::rename(&part, dest)
            .await
            .with_context(|| format!("Failed to move {} into place", dest.display()))?;

        tracing::info!(key, bytes = written, dest = %dest.display(), "downloaded from object storage");
        Ok(true)
    }

    async fn upload(&self, source: &Path, key: &str) -> Result<()> {
        let body = tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let bytes = body.len();

        let resp = self
            .signed(reqwest::Method::PUT, key, Utc::now())?
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to put s3://{}/{}", self.config.bucket, key))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                text.trim()
            );
        }

        tracing::info!(key, bytes, "uploaded to object storage");
        Ok(())
    }
}

struct ObjectTarget {
    url: String,
    host: String,
    canonical_uri: String,
}

/// Virtual-hosted style on AWS, path style on a custom endpoint.
fn object_target(config: &S3Config, key: &str) -> ObjectTarget {
    let encoded_key = key
        .split('/')
        .map(uri_encode)
        .collect::<Vec<_>>()
        .join("/");

    match &config.endpoint_url {
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
            let canonical_uri = format!("/{}/{}", uri_encode(&config.bucket), encoded_key);
            ObjectTarget {
                url: format!("{}://{}{}", scheme, host, canonical_uri),
                host,
                canonical_uri,
            }
        }
        None => {
            let host = format!("{}.s3.{}.amazonaws.com", config.bucket, config.region);
            let canonical_uri = format!("/{}", encoded_key);
            ObjectTarget {
                url: format!("https://{}{}", host, canonical_uri),
                host,
                canonical_uri,
            }
        }
    }
}

/// Build the SigV4 `Authorization` header. `headers` is sorted in place.
fn authorization_header(
    creds: &AwsCredentials,
    region: &str,
    method: &str,
    canonical_uri: &str,
    headers: &mut [(String, String)],
    date_stamp: &str,
    amz_date: &str,
) -> Result<String> {
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
        .collect();

    let canonical_request = format!(
        "{}\n{}\n\n{}\n{}\n{}",
        method, canonical_uri, canonical_headers, signed_headers, UNSIGNED_PAYLOAD
    );

    let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        credential_scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let signing_key = derive_signing_key(&creds.secret_access_key, date_stamp, region, "s3")?;
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        creds.access_key_id, credential_scope, signed_headers, signature
    ))
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| anyhow::anyhow!("Invalid HMAC key length"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
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
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config(endpoint: Option<&str>) -> S3Config {
        S3Config {
            bucket: "ofc-data".into(),
            region: "sa-east-1".into(),
            endpoint_url: endpoint.map(String::from),
            history_key: "presets-history.osh.pbf".into(),
            cursor_key: "presets-history.osh.pbf.json".into(),
        }
    }

    #[test]
    fn test_signing_key_matches_aws_example() {
        // From the AWS SigV4 documentation.
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b+c"), "a%20b%2Bc");
        assert_eq!(uri_encode("file-1_x.osh.pbf"), "file-1_x.osh.pbf");
    }

    #[test]
    fn test_object_target_aws() {
        let t = object_target(&s3_config(None), "history/presets.osh.pbf");
        assert_eq!(t.host, "ofc-data.s3.sa-east-1.amazonaws.com");
        assert_eq!(
            t.url,
            "https://ofc-data.s3.sa-east-1.amazonaws.com/history/presets.osh.pbf"
        );
    }

    #[test]
    fn test_object_target_custom_endpoint_is_path_style() {
        let t = object_target(&s3_config(Some("http://localhost:9000/")), "a.json");
        assert_eq!(t.host, "localhost:9000");
        assert_eq!(t.canonical_uri, "/ofc-data/a.json");
        assert_eq!(t.url, "http://localhost:9000/ofc-data/a.json");
    }

    #[test]
    fn test_authorization_header_shape() {
        let creds = AwsCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            session_token: None,
        };
        let mut headers = vec![
            ("x-amz-date".to_string(), "20240101T000000Z".to_string()),
            ("host".to_string(), "example.com".to_string()),
        ];
        let auth = authorization_header(
            &creds,
            "us-east-1",
            "GET",
            "/key",
            &mut headers,
            "20240101",
            "20240101T000000Z",
        )
        .unwrap();
        assert!(auth.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240101/us-east-1/s3/aws4_request, SignedHeaders=host;x-amz-date, Signature="
        ));
        assert_eq!(headers[0].0, "host");
    }
}
