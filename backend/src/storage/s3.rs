//! S3 bucket source using rust-s3 crate.
//!
//! Supports AWS S3 and S3-compatible services (MinIO, etc.). Settings come
//! from `S3Settings`: bucket, region, optional endpoint (switches to
//! path-style addressing), optional key prefix and optional static
//! credentials. Without static credentials the default AWS chain is used.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::region::Region;

use super::{
    file_name_of, organization_for, ArtifactSource, DiscoveredObject, Discovery, ObjectLocation,
};
use crate::config::S3Settings;
use crate::error::{AppError, Result};

/// Lists uploaded dumps under a bucket prefix
pub struct S3Source {
    bucket: Box<Bucket>,
    prefix: Option<String>,
}

impl S3Source {
    pub fn new(settings: &S3Settings) -> Result<Self> {
        let credentials = match (&settings.access_key, &settings.secret_key) {
            (Some(ak), Some(sk)) => Credentials::new(Some(ak), Some(sk), None, None, None)
                .map_err(|e| AppError::Config(format!("Invalid S3 credentials: {}", e)))?,
            // env vars -> ~/.aws/credentials -> instance metadata
            _ => Credentials::default()
                .map_err(|e| AppError::Config(format!("Failed to load AWS credentials: {}", e)))?,
        };

        let region = match &settings.endpoint {
            Some(endpoint) => Region::Custom {
                region: settings.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => settings
                .region
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid S3 region: {}", settings.region)))?,
        };

        let bucket = Bucket::new(&settings.bucket, region, credentials)
            .map_err(|e| AppError::Config(format!("Failed to create S3 bucket: {}", e)))?;

        // Path-style access for MinIO compatibility
        let bucket = if settings.endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self {
            bucket,
            prefix: settings.prefix.clone(),
        })
    }

    fn search_prefix(&self) -> String {
        list_prefix(self.prefix.as_deref())
    }
}

#[async_trait]
impl ArtifactSource for S3Source {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn discover(&self) -> Result<Discovery> {
        let search_prefix = self.search_prefix();
        let results = self
            .bucket
            .list(search_prefix.clone(), None)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list objects: {}", e)))?;

        let mut discovery = Discovery::default();
        for object in results.into_iter().flat_map(|result| result.contents) {
            if let Some(found) =
                object_from_listing(&search_prefix, &object.key, object.size, &object.last_modified)
            {
                discovery.objects.push(found);
            }
        }

        tracing::debug!(
            bucket = %self.bucket.name(),
            prefix = %search_prefix,
            found = discovery.objects.len(),
            "Listed S3 objects"
        );
        Ok(discovery)
    }
}

/// Listing prefix for an optional configured prefix.
fn list_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}/", p),
        None => String::new(),
    }
}

/// Turn one listing entry into a discovered object. Directory markers are
/// skipped.
fn object_from_listing(
    search_prefix: &str,
    key: &str,
    size: u64,
    last_modified: &str,
) -> Option<DiscoveredObject> {
    if key.ends_with('/') {
        return None;
    }
    let relative = key.strip_prefix(search_prefix).unwrap_or(key);
    let modified = DateTime::parse_from_rfc3339(last_modified)
        .ok()
        .map(|t| t.with_timezone(&Utc));
    Some(DiscoveredObject {
        location: ObjectLocation::Remote(key.to_string()),
        organization: organization_for(relative),
        file_name: file_name_of(relative).to_string(),
        size,
        modified,
    })
}
