//! Amazon S3 object storage.
//!
//! Uploads, downloads and presigns objects with the S3 REST API and
//! AWS Signature V4. Signing uses only `hmac` + `sha2`, no AWS SDK.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//! bucket = "tryon-composites"
//! region = "ap-south-1"
//! prefix = "stylist/"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style addressing
//! ```
//!
//! # Environment Variables
//!
//! - `AWS_ACCESS_KEY_ID`: required
//! - `AWS_SECRET_ACCESS_KEY`: required
//! - `AWS_SESSION_TOKEN`: optional (temporary credentials / IAM roles)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::StorageConfig;

use super::ObjectStorage;

type HmacSha256 = Hmac<Sha256>;

/// S3 caps presigned URL lifetime at seven days.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
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

pub struct S3Storage {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    prefix: String,
    creds: AwsCredentials,
}

/// Where a key lives: scheme + host, and the canonical (encoded) path.
struct Target {
    scheme: &'static str,
    host: String,
    canonical_uri: String,
}

impl Target {
    fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.canonical_uri)
    }
}

impl S3Storage {
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.bucket required for s3 backend"))?;
        let region = config
            .region
            .clone()
            .ok_or_else(|| anyhow::anyhow!("storage.region required for s3 backend"))?;
        Ok(Self::new(
            bucket,
            region,
            config.endpoint_url.clone(),
            config.prefix.clone(),
            AwsCredentials::from_env()?,
        ))
    }

    pub fn new(
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
        prefix: String,
        creds: AwsCredentials,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket,
            region,
            endpoint_url,
            prefix,
            creds,
        }
    }

    fn full_key(&self, key: &str) -> String {
        let prefix = self.prefix.trim_matches('/');
        let key = key.trim_start_matches('/');
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", prefix, key)
        }
    }

    /// Virtual-hosted style on AWS, path style on custom endpoints.
    fn target(&self, key: &str) -> Target {
        let encoded_key = self
            .full_key(key)
            .split('/')
            .map(uri_encode)
            .collect::<Vec<_>>()
            .join("/");

        match &self.endpoint_url {
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
                Target {
                    scheme,
                    host,
                    canonical_uri: format!("/{}/{}", uri_encode(&self.bucket), encoded_key),
                }
            }
            None => Target {
                scheme: "https",
                host: format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                canonical_uri: format!("/{}", encoded_key),
            },
        }
    }

    /// Signs a request with the `Authorization` header and returns the headers to send.
    fn auth_headers(
        &self,
        method: &str,
        target: &Target,
        payload_hash: &str,
        content_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<(String, String)> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ct) = content_type {
            headers.push(("content-type".to_string(), ct.to_string()));
        }
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
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
            method, target.canonical_uri, canonical_headers, signed_headers, payload_hash
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

        let mut out: Vec<(String, String)> = headers
            .into_iter()
            .filter(|(k, _)| k != "host")
            .collect();
        out.push(("authorization".to_string(), authorization));
        out
    }

    /// Builds a query-string-signed GET URL valid for `ttl`.
    pub fn presign_get(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> String {
        let target = self.target(key);
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let expires = ttl.as_secs().clamp(1, MAX_PRESIGN_SECS);

        let mut params = vec![
            ("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string()),
            (
                "X-Amz-Credential".to_string(),
                format!("{}/{}", self.creds.access_key_id, credential_scope),
            ),
            ("X-Amz-Date".to_string(), amz_date.clone()),
            ("X-Amz-Expires".to_string(), expires.to_string()),
            ("X-Amz-SignedHeaders".to_string(), "host".to_string()),
        ];
        if let Some(ref token) = self.creds.session_token {
            params.push(("X-Amz-Security-Token".to_string(), token.clone()));
        }
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let canonical_querystring = params
            .iter()
            .map(|(k, v)| format!("{}={}", uri_encode(k), uri_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            target.canonical_uri, canonical_querystring, target.host
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        format!(
            "{}?{}&X-Amz-Signature={}",
            target.url(),
            canonical_querystring,
            signature
        )
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn upload(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<String> {
        let target = self.target(key);
        let payload_hash = hex_sha256(bytes);
        let headers = self.auth_headers("PUT", &target, &payload_hash, Some(content_type), Utc::now());

        let mut req = self.client.put(target.url()).body(bytes.to_vec());
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to put s3://{}/{}: {}", self.bucket, key, e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "S3 PutObject failed (HTTP {}) for key '{}': {}",
                status,
                key,
                body.chars().take(500).collect::<String>()
            );
        }
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let target = self.target(key);
        let payload_hash = hex_sha256(b"");
        let headers = self.auth_headers("GET", &target, &payload_hash, None, Utc::now());

        let mut req = self.client.get(target.url());
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get s3://{}/{}: {}", self.bucket, key, e))?;
        if !resp.status().is_success() {
            bail!("S3 GetObject failed (HTTP {}) for key '{}'", resp.status(), key);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(self.presign_get(key, ttl, Utc::now()))
    }
}

// ============ AWS SigV4 Helpers ============

/// Compute the hex-encoded SHA-256 hash of data.
fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
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

/// URI-encode a string per RFC 3986: everything except `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
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
    use chrono::TimeZone;

    fn storage(endpoint: Option<&str>, prefix: &str) -> S3Storage {
        S3Storage::new(
            "looks".into(),
            "ap-south-1".into(),
            endpoint.map(str::to_string),
            prefix.into(),
            AwsCredentials {
                access_key_id: "AKIDEXAMPLE".into(),
                secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
                session_token: None,
            },
        )
    }

    #[test]
    fn signing_key_matches_aws_reference() {
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn uri_encoding_keeps_unreserved() {
        assert_eq!(uri_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn virtual_hosted_target_with_prefix() {
        let s = storage(None, "/stylist/");
        let t = s.target("composites/t1/a b.png");
        assert_eq!(t.host, "looks.s3.ap-south-1.amazonaws.com");
        assert_eq!(t.canonical_uri, "/stylist/composites/t1/a%20b.png");
        assert_eq!(t.scheme, "https");
    }

    #[test]
    fn custom_endpoint_uses_path_style() {
        let s = storage(Some("http://localhost:9000/"), "");
        let t = s.target("k.png");
        assert_eq!(t.url(), "http://localhost:9000/looks/k.png");
    }

    #[test]
    fn presigned_url_carries_query_auth() {
        let s = storage(None, "");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let url = s.presign_get("composites/t1/x.png", Duration::from_secs(3600), now);

        assert!(url.starts_with("https://looks.s3.ap-south-1.amazonaws.com/composites/t1/x.png?"));
        assert!(url.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
        assert!(url.contains("X-Amz-Credential=AKIDEXAMPLE%2F20260301%2Fap-south-1%2Fs3%2Faws4_request"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(url.contains("X-Amz-SignedHeaders=host"));

        // Same inputs, same signature.
        assert_eq!(url, s.presign_get("composites/t1/x.png", Duration::from_secs(3600), now));
    }

    #[test]
    fn presign_ttl_is_capped() {
        let s = storage(None, "");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let url = s.presign_get("x", Duration::from_secs(30 * 24 * 3600), now);
        assert!(url.contains("X-Amz-Expires=604800"));
    }

    #[test]
    fn auth_headers_exclude_host_and_sign_content_type() {
        let s = storage(None, "");
        let t = s.target("x.png");
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let headers = s.auth_headers("PUT", &t, &hex_sha256(b"img"), Some("image/png"), now);
        assert!(headers.iter().all(|(k, _)| k != "host"));
        let auth = &headers.iter().find(|(k, _)| k == "authorization").unwrap().1;
        assert!(auth.contains("SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date"));
    }
}
