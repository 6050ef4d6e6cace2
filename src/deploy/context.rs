//! Setup contexts shipped to remote nodes as `--install-this-ctx`
//!
//! Each context is JSON, then standard Base64, so it survives as a single
//! shell word.

use crate::config::RegistryConf;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Part shared by every node role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralSetupCtx {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSetupCtx {
    #[serde(flatten)]
    pub general: GeneralSetupCtx,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSetupCtx {
    #[serde(flatten)]
    pub general: GeneralSetupCtx,
    pub token: String,
    /// API server URL, e.g. `https://10.0.0.1:6443`
    pub server: String,
}

pub fn encode<T: Serialize>(ctx: &T) -> Result<String> {
    let json = serde_json::to_vec(ctx).context("Failed to serialize setup context")?;
    Ok(STANDARD.encode(json))
}

pub fn decode<T: DeserializeOwned>(ctx_b64: &str) -> Result<T> {
    let json = STANDARD
        .decode(ctx_b64.trim())
        .context("Setup context is not valid base64")?;
    serde_json::from_slice(&json).context("Failed to parse setup context")
}
