use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::BackfillError;

/// Identifies one image. `pool_id` and `image_id` are filled in once the
/// image has been opened; before that only the names are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSpec {
    pub pool_name: String,
    /// Empty string is the default namespace.
    #[serde(default)]
    pub namespace: String,
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ImageSpec {
    pub fn new(pool_name: &str, namespace: &str, image_name: &str) -> Self {
        Self {
            pool_name: pool_name.to_string(),
            namespace: namespace.to_string(),
            image_name: image_name.to_string(),
            pool_id: None,
            image_id: None,
        }
    }

    /// Attach the cluster-resolved identifiers.
    pub fn resolved(mut self, pool_id: i64, image_id: &str) -> Self {
        self.pool_id = Some(pool_id);
        self.image_id = Some(image_id.to_string());
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.pool_id.is_some() && self.image_id.is_some()
    }

    /// Name-only key, stable before and after resolution.
    pub fn name_key(&self) -> (String, String, String) {
        (
            self.pool_name.clone(),
            self.namespace.clone(),
            self.image_name.clone(),
        )
    }
}

impl Ord for ImageSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pool_id
            .cmp(&other.pool_id)
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.image_id.cmp(&other.image_id))
            .then_with(|| self.pool_name.cmp(&other.pool_name))
            .then_with(|| self.image_name.cmp(&other.image_name))
    }
}

impl PartialOrd for ImageSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ImageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.pool_name, self.image_name)
        } else {
            write!(f, "{}/{}/{}", self.pool_name, self.namespace, self.image_name)
        }
    }
}

impl FromStr for ImageSpec {
    type Err = BackfillError;

    /// Parse `pool/image` or `pool/namespace/image`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let (pool, ns, image) = match parts.as_slice() {
            [pool, image] => (*pool, "", *image),
            [pool, ns, image] => (*pool, *ns, *image),
            _ => {
                return Err(BackfillError::InvalidArgument(format!(
                    "image spec must be 'pool/image' or 'pool/namespace/image', got '{s}'"
                )));
            }
        };
        if pool.is_empty() || image.is_empty() {
            return Err(BackfillError::InvalidArgument(format!(
                "image spec '{s}' has an empty pool or image name"
            )));
        }
        Ok(ImageSpec::new(pool, ns, image))
    }
}
