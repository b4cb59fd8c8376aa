//! S3 parent settings read from the child's `s3.*` image metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::Zeroizing;

use super::signer::{uri_encode, DEFAULT_REGION};

pub const KEY_PREFIX: &str = "s3.";
pub const KEY_ENABLED: &str = "s3.enabled";
pub const KEY_BUCKET: &str = "s3.bucket";
pub const KEY_ENDPOINT: &str = "s3.endpoint";
pub const KEY_REGION: &str = "s3.region";
pub const KEY_ACCESS_KEY: &str = "s3.access_key";
pub const KEY_SECRET_KEY: &str = "s3.secret_key";
pub const KEY_PREFIX_PATH: &str = "s3.prefix";
pub const KEY_IMAGE_NAME: &str = "s3.image_name";
pub const KEY_IMAGE_FORMAT: &str = "s3.image_format";
pub const KEY_TIMEOUT_MS: &str = "s3.timeout_ms";
pub const KEY_MAX_RETRIES: &str = "s3.max_retries";

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The only image layout supported: the whole disk as one S3 object.
pub const FORMAT_RAW: &str = "raw";

#[derive(Clone)]
pub struct S3Config {
    pub enabled: bool,
    pub bucket: String,
    pub endpoint: String,
    pub region: String,
    pub access_key: Option<String>,
    /// Decoded secret; wiped on drop.
    pub secret_key: Option<Zeroizing<String>>,
    pub prefix: Option<String>,
    pub image_name: String,
    pub image_format: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// Object size of the child image; set by the parent resolver.
    pub object_size: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            enabled: false,
            bucket: String::new(),
            endpoint: String::new(),
            region: DEFAULT_REGION.to_string(),
            access_key: None,
            secret_key: None,
            prefix: None,
            image_name: String::new(),
            image_format: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            object_size: 0,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("enabled", &self.enabled)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("prefix", &self.prefix)
            .field("image_name", &self.image_name)
            .field("image_format", &self.image_format)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("object_size", &self.object_size)
            .finish()
    }
}

fn non_empty(meta: &BTreeMap<String, String>, key: &str) -> Option<String> {
    meta.get(key).filter(|v| !v.is_empty()).cloned()
}

impl S3Config {
    /// Build from `s3.*` metadata. `None` when `s3.enabled` is absent.
    ///
    /// A secret that is not valid base64 disables the config when an access
    /// key is set, and is ignored (anonymous access) otherwise. Unparsable
    /// numeric fields keep their defaults.
    pub fn from_metadata(meta: &BTreeMap<String, String>) -> Option<Self> {
        let enabled = meta.get(KEY_ENABLED)?;
        let mut config = S3Config {
            enabled: enabled == "true" || enabled == "1",
            ..Default::default()
        };
        if !config.enabled {
            tracing::debug!("s3 parent disabled in metadata");
            return Some(config);
        }

        config.bucket = meta.get(KEY_BUCKET).cloned().unwrap_or_default();
        config.endpoint = meta.get(KEY_ENDPOINT).cloned().unwrap_or_default();
        if let Some(region) = non_empty(meta, KEY_REGION) {
            config.region = region;
        }
        config.access_key = non_empty(meta, KEY_ACCESS_KEY);

        if let Some(encoded) = non_empty(meta, KEY_SECRET_KEY) {
            match decode_secret(&encoded) {
                Some(secret) => config.secret_key = Some(secret),
                None if config.access_key.is_some() => {
                    tracing::error!(
                        "failed to decode s3.secret_key for authenticated access, disabling s3 parent"
                    );
                    config.enabled = false;
                    return Some(config);
                }
                None => {
                    tracing::debug!("no valid s3.secret_key, using anonymous access");
                }
            }
        }

        config.prefix = non_empty(meta, KEY_PREFIX_PATH);
        config.image_name = meta.get(KEY_IMAGE_NAME).cloned().unwrap_or_default();
        config.image_format = meta.get(KEY_IMAGE_FORMAT).cloned().unwrap_or_default();

        if let Some(raw) = meta.get(KEY_TIMEOUT_MS) {
            match raw.trim().parse() {
                Ok(v) => config.timeout_ms = v,
                Err(_) => tracing::warn!(value = %raw, "invalid s3.timeout_ms, using default"),
            }
        }
        if let Some(raw) = meta.get(KEY_MAX_RETRIES) {
            match raw.trim().parse() {
                Ok(v) => config.max_retries = v,
                Err(_) => tracing::warn!(value = %raw, "invalid s3.max_retries, using default"),
            }
        }

        Some(config)
    }

    /// Enabled with bucket, endpoint, image name and the `raw` format set,
    /// and a secret present whenever an access key is.
    pub fn is_valid(&self) -> bool {
        self.enabled
            && !self.bucket.is_empty()
            && !self.endpoint.is_empty()
            && !self.image_name.is_empty()
            && self.image_format == FORMAT_RAW
            && (self.access_key.is_none() || self.secret_key.is_some())
    }

    pub fn is_anonymous(&self) -> bool {
        self.access_key.is_none()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Path-style URL of the image object:
    /// `<endpoint>/<bucket>/[<prefix>/]<image_name>`, key segments URI-encoded.
    pub fn object_url(&self) -> String {
        let mut key = String::new();
        if let Some(prefix) = self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            if !prefix.is_empty() {
                key.push_str(prefix);
                key.push('/');
            }
        }
        key.push_str(self.image_name.trim_start_matches('/'));
        format!(
            "{}/{}/{}",
            self.endpoint.trim_end_matches('/'),
            uri_encode(self.bucket.trim_matches('/'), true),
            uri_encode(&key, false)
        )
    }
}

fn decode_secret(encoded: &str) -> Option<Zeroizing<String>> {
    let bytes = Zeroizing::new(STANDARD.decode(encoded.trim()).ok()?);
    let text = std::str::from_utf8(&bytes).ok()?;
    Some(Zeroizing::new(text.to_string()))
}
