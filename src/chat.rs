//! Retrieval-augmented chat.
//!
//! Two flavors: [`ChatService::ask_store`] lets the model search a
//! file-search store, [`ChatService::ask_files`] attaches Files API files to
//! the prompt directly.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::ChatError;
use crate::remote::{FileRef, GenerateRequest, RemoteStore};

/// Longest accepted prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 8000;

const STORE_INSTRUCTION: &str = "You answer questions using only the documents retrieved \
from the file search store. If the retrieved content does not contain the answer, say that \
the documents do not cover it. Do not use outside knowledge.";

const FILES_INSTRUCTION: &str = "You answer questions about the attached files. Base every \
statement on their content and say so when the files do not contain the answer.";

const STORE_PREFIX: &str = "fileSearchStores/";
const FILE_PREFIX: &str = "files/";

/// Checks the prompt is present and not longer than [`MAX_PROMPT_CHARS`].
pub fn validate_prompt(prompt: &str) -> Result<(), ChatError> {
    if prompt.trim().is_empty() {
        return Err(ChatError::Validation("prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ChatError::Validation(format!(
            "prompt exceeds {} characters",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(())
}

/// Maps a user-supplied id to a Files API resource name.
///
/// `abc` and `files/abc` both become `files/abc`. Store names are not files
/// and yield `None`.
pub fn normalize_file_name(id: &str) -> Option<String> {
    let id = id.trim().trim_start_matches('/');
    if id.is_empty() || id.starts_with(STORE_PREFIX) {
        return None;
    }
    if id.starts_with(FILE_PREFIX) {
        Some(id.to_string())
    } else {
        Some(format!("{}{}", FILE_PREFIX, id))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreAnswer {
    pub model: String,
    pub store_id: String,
    pub answer: String,
    pub grounding: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesAnswer {
    pub model: String,
    pub files: Vec<String>,
    pub answer: String,
}

pub struct ChatService {
    remote: Arc<dyn RemoteStore>,
    default_model: String,
}

impl ChatService {
    pub fn new(remote: Arc<dyn RemoteStore>, default_model: impl Into<String>) -> Self {
        Self {
            remote,
            default_model: default_model.into(),
        }
    }

    fn model(&self, requested: Option<&str>) -> String {
        requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string()
    }

    pub async fn ask_store(
        &self,
        store_id: &str,
        prompt: &str,
        model: Option<&str>,
        metadata_filter: Option<&str>,
    ) -> Result<StoreAnswer, ChatError> {
        validate_prompt(prompt)?;
        if store_id.trim().is_empty() {
            return Err(ChatError::Validation(
                "No store configured. Pass storeId or set one with POST /config.".to_string(),
            ));
        }

        let model = self.model(model);
        let response = self
            .remote
            .generate(GenerateRequest {
                model: model.clone(),
                system_instruction: STORE_INSTRUCTION.to_string(),
                prompt: prompt.to_string(),
                store_names: vec![store_id.to_string()],
                metadata_filter: metadata_filter
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(String::from),
                files: Vec::new(),
            })
            .await?;

        info!(store = store_id, model = %model, "Store chat answered");
        Ok(StoreAnswer {
            model,
            store_id: store_id.to_string(),
            answer: response.text,
            grounding: response.grounding,
        })
    }

    pub async fn ask_files(
        &self,
        file_ids: &[String],
        prompt: &str,
        model: Option<&str>,
    ) -> Result<FilesAnswer, ChatError> {
        validate_prompt(prompt)?;
        if file_ids.is_empty() {
            return Err(ChatError::Validation("fileId or fileIds is required".to_string()));
        }

        let mut names = Vec::with_capacity(file_ids.len());
        for id in file_ids {
            let name = normalize_file_name(id).ok_or_else(|| {
                ChatError::Validation(format!(
                    "'{}' is not a file id; store documents cannot be attached",
                    id
                ))
            })?;
            names.push(name);
        }

        let mut refs = Vec::with_capacity(names.len());
        for name in &names {
            let file = self.remote.get_file(name).await?;
            let uri = file.uri.ok_or_else(|| {
                ChatError::Validation(format!("file {} has no URI yet", name))
            })?;
            refs.push(FileRef {
                uri,
                mime_type: file
                    .mime_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            });
        }

        let model = self.model(model);
        let response = self
            .remote
            .generate(GenerateRequest {
                model: model.clone(),
                system_instruction: FILES_INSTRUCTION.to_string(),
                prompt: prompt.to_string(),
                store_names: Vec::new(),
                metadata_filter: None,
                files: refs,
            })
            .await?;

        info!(files = names.len(), model = %model, "Files chat answered");
        Ok(FilesAnswer {
            model,
            files: names,
            answer: response.text,
        })
    }
}
