//! Read-only listing of GGUF files in a Hugging Face repository.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use super::quantization::{self, GgufCandidate};
use crate::error::{Error, Result};

pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type", default)]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Clone)]
pub struct RemoteCatalog {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteCatalog {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    /// GGUF files of `repo_id` at `revision`, ranked best first.
    pub async fn list_candidates(
        &self,
        repo_id: &str,
        revision: &str,
    ) -> Result<Vec<GgufCandidate>> {
        validate_repo_id(repo_id)?;
        let url = format!("{}/api/models/{}/tree/{}", self.endpoint, repo_id, revision);
        debug!("Listing remote artifacts at {}", url);

        let response = self.client.get(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ModelNotFound(repo_id.to_string()));
        }
        let entries: Vec<TreeEntry> = response.error_for_status()?.json().await?;
        Ok(candidates_from_tree(entries))
    }

    pub async fn best_candidate(&self, repo_id: &str, revision: &str) -> Result<GgufCandidate> {
        self.list_candidates(repo_id, revision)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::ModelNotFound(format!("{repo_id} has no GGUF files")))
    }
}

fn validate_repo_id(repo_id: &str) -> Result<()> {
    let mut parts = repo_id.split('/');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty()
    );
    if valid && !repo_id.contains("..") {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "repository id must look like owner/name, got '{repo_id}'"
        )))
    }
}

fn candidates_from_tree(entries: Vec<TreeEntry>) -> Vec<GgufCandidate> {
    let candidates: Vec<GgufCandidate> = entries
        .into_iter()
        .filter(|entry| entry.kind != "directory")
        .filter(|entry| entry.path.to_ascii_lowercase().ends_with(".gguf"))
        .map(|entry| GgufCandidate::from_path(entry.path, entry.size))
        .collect();
    quantization::rank(&candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_listing_is_filtered_and_ranked() {
        let raw = r#"[
            {"type": "file", "path": "README.md", "size": 10},
            {"type": "file", "path": "model.Q8_0.gguf", "size": 800},
            {"type": "file", "path": "model.Q4_K_M.gguf", "size": 400},
            {"type": "file", "path": "model.Q4_K_M-00001-of-00002.gguf", "size": 200},
            {"type": "directory", "path": "old.gguf"}
        ]"#;
        let entries: Vec<TreeEntry> = serde_json::from_str(raw).unwrap();
        let ranked = candidates_from_tree(entries);

        let paths: Vec<String> = ranked
            .iter()
            .map(|c| c.path.display().to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                "model.Q4_K_M.gguf",
                "model.Q8_0.gguf",
                "model.Q4_K_M-00001-of-00002.gguf"
            ]
        );
        assert_eq!(ranked[0].size_bytes, 400);
    }

    #[test]
    fn repo_ids_need_owner_and_name() {
        assert!(validate_repo_id("TheBloke/Llama-2-7B-GGUF").is_ok());
        assert!(validate_repo_id("justname").is_err());
        assert!(validate_repo_id("a/b/c").is_err());
        assert!(validate_repo_id("../b").is_err());
    }
}
