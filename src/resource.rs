//! Resource resolution.
//!
//! Resolves configuration and service fragments by location:
//!
//! - `http://` / `https://` URLs are fetched over the network (only when
//!   networking is allowed)
//! - absolute paths are read from the filesystem
//! - bare names are looked up on each mirror in turn as
//!   `<mirror>/<first char>/<name>.yml`

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

/// Default HTTP timeout for resource fetches.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Catalog section listing the available services.
pub const SERVICES_SECTION: &str = "services";

/// Classification of a resource location string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLocation<'a> {
    /// HTTP(S) URL
    Url(&'a str),
    /// Absolute filesystem path
    Path(&'a str),
    /// Bare logical name, resolved against mirrors
    Name(&'a str),
}

impl<'a> ResourceLocation<'a> {
    pub fn classify(location: &'a str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            ResourceLocation::Url(location)
        } else if location.starts_with('/') {
            ResourceLocation::Path(location)
        } else {
            ResourceLocation::Name(location)
        }
    }
}

/// Build the mirror URL for a bare resource name.
///
/// Returns `None` for an empty name.
pub fn mirror_url(mirror: &str, name: &str) -> Option<String> {
    let first = name.chars().next()?;
    Some(format!(
        "{}/{}/{}.yml",
        mirror.trim_end_matches('/'),
        first,
        name
    ))
}

/// Loads resources from local paths, URLs, or mirrors.
#[derive(Debug, Clone)]
pub struct ResourceLoader {
    /// HTTP client
    client: reqwest::Client,
}

impl ResourceLoader {
    /// Create a loader with the default timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a loader with a custom HTTP timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Load the bytes of a resource.
    ///
    /// Mirrors are only consulted for bare names. A mirror candidate is
    /// loaded as if with an empty mirror list, so resolution never recurses.
    pub async fn load(&self, location: &str, network: bool, mirrors: &[String]) -> Result<Vec<u8>> {
        match ResourceLocation::classify(location) {
            ResourceLocation::Name(name) => self.load_from_mirrors(name, network, mirrors).await,
            _ => self.load_direct(location, network).await,
        }
    }

    async fn load_direct(&self, location: &str, network: bool) -> Result<Vec<u8>> {
        match ResourceLocation::classify(location) {
            ResourceLocation::Url(url) => self.fetch(url, network).await,
            ResourceLocation::Path(path) => Ok(tokio::fs::read(path).await?),
            ResourceLocation::Name(name) => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Try each mirror in order. Fails with `NoNetwork` if any mirror was
    /// skipped for lack of networking, otherwise with `NotFound`.
    async fn load_from_mirrors(
        &self,
        name: &str,
        network: bool,
        mirrors: &[String],
    ) -> Result<Vec<u8>> {
        let mut network_blocked = false;

        for mirror in mirrors {
            let Some(url) = mirror_url(mirror, name) else {
                break;
            };

            match self.load_direct(&url, network).await {
                Ok(bytes) => {
                    debug!(resource = %name, url = %url, "Loaded resource from mirror");
                    return Ok(bytes);
                }
                Err(e) => {
                    debug!(resource = %name, url = %url, error = %e, "Mirror did not serve resource");
                    network_blocked |= e.is_no_network();
                }
            }
        }

        if network_blocked {
            Err(Error::NoNetwork(name.to_string()))
        } else {
            Err(Error::NotFound(name.to_string()))
        }
    }

    async fn fetch(&self, url: &str, network: bool) -> Result<Vec<u8>> {
        if !network {
            return Err(Error::NoNetwork(url.to_string()));
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Aggregate the service catalog of every reachable mirror.
    ///
    /// Each mirror serves `<mirror>/index.yml`, a mapping from section name
    /// to a list of service names. Mirrors that fail to load or decode are
    /// logged and skipped.
    pub async fn services(&self, mirrors: &[String]) -> Vec<String> {
        let mut result = Vec::new();

        for mirror in mirrors {
            let index_url = format!("{}/index.yml", mirror.trim_end_matches('/'));

            let content = match self.load(&index_url, true, &[]).await {
                Ok(content) => content,
                Err(e) => {
                    error!(url = %index_url, error = %e, "Failed to load service index");
                    continue;
                }
            };

            let index: HashMap<String, Vec<String>> = match serde_yaml::from_slice(&content) {
                Ok(index) => index,
                Err(e) => {
                    error!(url = %index_url, error = %e, "Failed to decode service index");
                    continue;
                }
            };

            if let Some(list) = index.get(SERVICES_SECTION) {
                result.extend(list.iter().cloned());
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_classify() {
        assert_eq!(
            ResourceLocation::classify("https://example.com/x.yml"),
            ResourceLocation::Url("https://example.com/x.yml")
        );
        assert_eq!(
            ResourceLocation::classify("http://example.com/x.yml"),
            ResourceLocation::Url("http://example.com/x.yml")
        );
        assert_eq!(
            ResourceLocation::classify("/etc/x.yml"),
            ResourceLocation::Path("/etc/x.yml")
        );
        assert_eq!(
            ResourceLocation::classify("console"),
            ResourceLocation::Name("console")
        );
    }

    #[test]
    fn test_mirror_url() {
        assert_eq!(
            mirror_url("http://a", "foo").as_deref(),
            Some("http://a/f/foo.yml")
        );
        assert_eq!(
            mirror_url("http://a/", "foo").as_deref(),
            Some("http://a/f/foo.yml")
        );
        assert_eq!(mirror_url("http://a", ""), None);
    }

    #[tokio::test]
    async fn test_network_disabled() {
        let loader = ResourceLoader::new().unwrap();
        let err = loader
            .load("http://127.0.0.1:1/x.yml", false, &[])
            .await
            .unwrap_err();
        assert!(err.is_no_network());
    }

    #[tokio::test]
    async fn test_name_without_mirrors_not_found() {
        let loader = ResourceLoader::new().unwrap();
        let err = loader.load("foo", true, &[]).await.unwrap_err();
        assert_matches!(err, Error::NotFound(name) if name == "foo");
    }

    #[tokio::test]
    async fn test_empty_name_not_found() {
        let loader = ResourceLoader::new().unwrap();
        let mirrors = vec!["http://127.0.0.1:1".to_string()];
        let err = loader.load("", true, &mirrors).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
