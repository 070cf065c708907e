// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Runtime entrypoints injected into every sandbox.
//!
//! The entrypoint prints [`BOOT_MARKER`] once the runtime is up, reads the
//! `{event, context}` document (stdin, or the file named by
//! `FNBOX_EVENT_FILE`), calls `handler(event, context)` and prints one
//! [`RESULT_MARKER`] line:
//!
//! ```text
//! __FNBOX_RESULT__ {"ok":true,"value":{...},"memoryPeakKB":10240}
//! __FNBOX_RESULT__ {"ok":false,"error":"ValueError: bad","memoryPeakKB":10240}
//! ```
//!
//! On handler error the traceback goes to stderr and the exit status is 1.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::registry::FunctionMetadata;
use crate::types::Runtime;

pub const BOOT_MARKER: &str = "__FNBOX_BOOT__";
pub const RESULT_MARKER: &str = "__FNBOX_RESULT__";

/// Directory holding the handler module, relative to the staging root.
pub const CODE_DIR: &str = "code";

const PYTHON_BOOTSTRAP: &str = include_str!("../../assets/bootstrap.py");
const NODE_BOOTSTRAP: &str = include_str!("../../assets/bootstrap.js");

/// File name and source of the entrypoint for `runtime`.
pub fn entrypoint(runtime: Runtime) -> (&'static str, &'static str) {
    match runtime {
        Runtime::Python => ("bootstrap.py", PYTHON_BOOTSTRAP),
        Runtime::Nodejs => ("bootstrap.js", NODE_BOOTSTRAP),
    }
}

/// Files laid out by [`stage`].
#[derive(Debug, Clone)]
pub struct StagedCode {
    pub root: PathBuf,
    pub entrypoint: PathBuf,
    pub module: PathBuf,
}

/// Write the entrypoint and the handler module under `root`.
///
/// ```text
/// root/bootstrap.py
/// root/code/<module>.py
/// ```
pub async fn stage(
    root: &Path,
    metadata: &FunctionMetadata,
    artifact: &[u8],
) -> std::io::Result<StagedCode> {
    let (entry_name, entry_source) = entrypoint(metadata.runtime);
    let code_dir = root.join(CODE_DIR);
    tokio::fs::create_dir_all(&code_dir).await?;

    let entrypoint = root.join(entry_name);
    tokio::fs::write(&entrypoint, entry_source).await?;

    let module = code_dir.join(format!(
        "{}.{}",
        metadata.handler.module(),
        metadata.runtime.extension()
    ));
    tokio::fs::write(&module, artifact).await?;

    Ok(StagedCode {
        root: root.to_path_buf(),
        entrypoint,
        module,
    })
}

/// Environment read by the entrypoint.
pub fn handler_env(metadata: &FunctionMetadata, code_dir: &str) -> Vec<(&'static str, String)> {
    vec![
        ("FNBOX_HANDLER", metadata.handler.to_string()),
        ("FNBOX_CODE_DIR", code_dir.to_string()),
    ]
}

/// Content-addressed tag for a function image.
///
/// Changes whenever the base image, the entrypoint, the handler name or the
/// artifact bytes change.
pub fn content_tag(metadata: &FunctionMetadata, base: &str, artifact: &[u8]) -> String {
    let (_, entry_source) = entrypoint(metadata.runtime);
    let mut hasher = Sha256::new();
    for part in [
        base.as_bytes(),
        entry_source.as_bytes(),
        metadata.handler.as_str().as_bytes(),
        artifact,
    ] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hex::encode(hasher.finalize());
    format!("fnbox-fn-{}:{}", metadata.runtime.name(), &digest[..16])
}
