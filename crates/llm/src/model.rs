use std::path::{Path, PathBuf};

/// Fallback model name when a weights path has no usable file stem.
pub const UNNAMED_MODEL: &str = "local-model";

/// Parameters applied when model weights are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub context_size: u32,
    pub gpu_layer_count: u32,
}

impl LoadParams {
    pub fn new(context_size: u32, gpu_layer_count: u32) -> Self {
        Self {
            context_size,
            gpu_layer_count,
        }
    }
}

/// Owned handle to loaded model weights.
///
/// Not `Clone`: whoever holds the handle owns the weights and must give it back
/// through `InferenceEngine::unload_model`.
#[derive(Debug, PartialEq, Eq)]
pub struct ModelHandle {
    id: u64,
    path: PathBuf,
    name: String,
    params: LoadParams,
}

impl ModelHandle {
    pub fn new(id: u64, path: impl Into<PathBuf>, params: LoadParams) -> Self {
        let path = path.into();
        let name = model_name_from_path(&path);
        Self {
            id,
            path,
            name,
            params,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> LoadParams {
        self.params
    }
}

/// Derives the model identifier served by a local server from its weights path.
///
/// `models/qwen2.5-7b-instruct.Q4_K_M.gguf` becomes `qwen2.5-7b-instruct.Q4_K_M`.
pub fn model_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_string())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| UNNAMED_MODEL.to_string())
}
