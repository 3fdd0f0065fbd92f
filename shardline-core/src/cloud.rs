//! Node locations
//!
//! A location is a `cloud.region.zone` triple. Placement blocks may leave the
//! region or zone empty, in which case they match any value at that level.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardlineError};

/// Cloud / region / zone of a node or a placement block
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CloudInfo {
    pub cloud: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
}

impl CloudInfo {
    pub fn new(cloud: impl Into<String>, region: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            cloud: cloud.into(),
            region: region.into(),
            zone: zone.into(),
        }
    }

    /// Returns true if `other` falls inside this location.
    ///
    /// Empty fields act as wildcards, so `aws.us-west.` contains every zone
    /// of `us-west`.
    pub fn contains(&self, other: &CloudInfo) -> bool {
        fn level(pattern: &str, value: &str) -> bool {
            pattern.is_empty() || pattern == value
        }
        level(&self.cloud, &other.cloud)
            && level(&self.region, &other.region)
            && level(&self.zone, &other.zone)
    }
}

impl fmt::Display for CloudInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.cloud, self.region, self.zone)
    }
}

impl FromStr for CloudInfo {
    type Err = ShardlineError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [cloud, region, zone] if !cloud.is_empty() => Ok(Self::new(*cloud, *region, *zone)),
            [cloud, region] if !cloud.is_empty() => Ok(Self::new(*cloud, *region, "")),
            [cloud] if !cloud.is_empty() => Ok(Self::new(*cloud, "", "")),
            _ => Err(ShardlineError::InvalidCloudInfo(s.to_string())),
        }
    }
}
