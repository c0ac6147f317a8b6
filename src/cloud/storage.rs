//! Cloud Storage JSON API client

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

use super::GcpClient;
use crate::backend::ResultStore;
use crate::error::{Result, TurbineError};

const STORAGE_URL: &str = "https://storage.googleapis.com";
const SERVICE: &str = "storage";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

/// Client for a single bucket
#[derive(Clone)]
pub struct StorageClient {
    gcp: GcpClient,
    base_url: String,
    bucket: String,
}

impl StorageClient {
    /// Create a client, optionally against an emulator endpoint
    pub fn new(gcp: GcpClient, bucket: &str, endpoint: Option<&str>) -> Self {
        Self {
            gcp,
            base_url: endpoint.unwrap_or(STORAGE_URL).trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
        }
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Build `<base>/<segments...>` with every segment percent-encoded
    fn url(&self, segments: &[&str]) -> Result<Url> {
        build_url(&self.base_url, segments)
    }

    fn object_url(&self, name: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", name])
    }

    /// Create the bucket if it does not exist
    pub async fn ensure_bucket(&self, project: &str, location: &str) -> Result<()> {
        let url = self.url(&["storage", "v1", "b"])?;
        let request = self
            .gcp
            .http()
            .post(url)
            .query(&[("project", project)])
            .json(&json!({ "name": self.bucket, "location": location }));

        match self.gcp.send(SERVICE, request).await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, location, "Created bucket");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(bucket = %self.bucket, "Bucket already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Upload an object
    pub async fn upload(&self, name: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        let request = self
            .gcp
            .http()
            .post(url)
            .query(&[("uploadType", "media"), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);
        self.gcp.send(SERVICE, request).await?;
        tracing::debug!(bucket = %self.bucket, object = name, "Uploaded object");
        Ok(())
    }

    /// Download an object's contents
    pub async fn download(&self, name: &str) -> Result<Vec<u8>> {
        let url = self.object_url(name)?;
        let request = self.gcp.http().get(url).query(&[("alt", "media")]);
        match self.gcp.send(SERVICE, request).await {
            Ok(response) => Ok(response.bytes().await?.to_vec()),
            Err(e) if e.is_not_found() => Err(TurbineError::NotFound(format!(
                "gs://{}/{}",
                self.bucket, name
            ))),
            Err(e) => Err(e),
        }
    }

    /// Check whether an object exists
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let url = self.object_url(name)?;
        let request = self.gcp.http().get(url).query(&[("fields", "name")]);
        match self.gcp.send(SERVICE, request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List object names under a prefix, following page tokens
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("prefix", prefix.to_string()),
                ("fields", "items(name),nextPageToken".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let request = self.gcp.http().get(url.clone()).query(&query);
            let page: ObjectList = self.gcp.send_json(SERVICE, request).await?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    /// Delete an object; a missing one is not an error
    pub async fn delete(&self, name: &str) -> Result<()> {
        let url = self.object_url(name)?;
        let request = self.gcp.http().delete(url);
        match self.gcp.send(SERVICE, request).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Join percent-encoded path segments onto a base URL
pub fn build_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| TurbineError::config(format!("invalid storage endpoint {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| TurbineError::config(format!("storage endpoint {} cannot be a base", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[async_trait]
impl ResultStore for StorageClient {
    async fn put(&self, name: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.upload(name, data, content_type).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.download(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        StorageClient::exists(self, name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        StorageClient::list(self, prefix).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        StorageClient::delete(self, name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names_are_encoded() {
        let url = build_url(
            "https://storage.googleapis.com",
            &["storage", "v1", "b", "bkt", "o", "jobs/a b/results/x.json"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bkt/o/jobs%2Fa%20b%2Fresults%2Fx.json"
        );
    }

    #[test]
    fn test_emulator_base_with_path() {
        let url = build_url("http://localhost:4443/", &["storage", "v1", "b"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:4443/storage/v1/b");
    }

    #[test]
    fn test_list_page_parsing() {
        let page: ObjectList = serde_json::from_str(
            r#"{"items":[{"name":"jobs/a/results/a-00000.json"}],"nextPageToken":"abc"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));

        let empty: ObjectList = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_page_token.is_none());
    }
}
