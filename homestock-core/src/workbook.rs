//! Boundary with the external workbook service that copies verified files
//! into worksheets, re-evaluates formulas and writes the final workbook.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::FileType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub file_path: PathBuf,
    pub file_type: Option<FileType>,
    /// Overrides the worksheet mapping for this file.
    pub worksheet_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyDataRequest {
    pub source_files: Vec<SourceFile>,
    pub template_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub worksheet_mapping: Option<BTreeMap<FileType, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyDataResponse {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub worksheets: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFormulasRequest {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunFormulasResponse {
    pub success: bool,
    pub formulas_executed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyToOutputRequest {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub worksheets_to_copy: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyToOutputResponse {
    pub success: bool,
    pub output_path: Option<PathBuf>,
    pub worksheets_copied: Vec<String>,
    pub error: Option<String>,
}

/// Each call is atomic. `Ok` with `success = false` is a reported failure;
/// `Err` means the service could not be reached or answered garbage.
pub trait WorkbookService {
    fn copy_data_to_excel(&self, request: &CopyDataRequest) -> Result<CopyDataResponse>;

    fn run_formulas(&self, request: &RunFormulasRequest) -> Result<RunFormulasResponse>;

    fn copy_to_output(&self, request: &CopyToOutputRequest) -> Result<CopyToOutputResponse>;
}

/// Runs an external program per call: `<program> [args..] <operation>`,
/// request JSON on stdin, response JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandWorkbookService {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandWorkbookService {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(&self, operation: &str, request: &Req) -> Result<Resp> {
        let payload = serde_json::to_vec(request)?;
        debug!("workbook service {} {}", self.program.display(), operation);

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Workbook(format!("failed to start {}: {}", self.program.display(), e)))?;

        // stdin is fed from its own thread while stdout and stderr drain
        let stdin = child.stdin.take();
        let (written, output) = thread::scope(|s| {
            let writer = s.spawn(move || match stdin {
                Some(mut stdin) => stdin.write_all(&payload),
                None => Ok(()),
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));
            (written, output)
        });
        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Workbook(if stderr.is_empty() {
                format!("{} {} exited with {}", self.program.display(), operation, output.status)
            } else {
                stderr
            }));
        }

        // a service may answer without reading its request
        if let Err(e) = written {
            if e.kind() != io::ErrorKind::BrokenPipe {
                return Err(e.into());
            }
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

impl WorkbookService for CommandWorkbookService {
    fn copy_data_to_excel(&self, request: &CopyDataRequest) -> Result<CopyDataResponse> {
        self.call("copy_data_to_excel", request)
    }

    fn run_formulas(&self, request: &RunFormulasRequest) -> Result<RunFormulasResponse> {
        self.call("run_formulas", request)
    }

    fn copy_to_output(&self, request: &CopyToOutputRequest) -> Result<CopyToOutputResponse> {
        self.call("copy_to_output", request)
    }
}
