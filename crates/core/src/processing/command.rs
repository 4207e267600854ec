//! External command processor.
//!
//! Runs a program such as ImageMagick `convert` or `ffmpeg` over scratch
//! files. Arguments may contain `:source` and `:dest`, plus `:<option>` for
//! any style option, e.g. `["-resize", ":geometry", ":source", ":dest"]`.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;

use super::processor::{Processor, ProcessorError};
use crate::attachment::Blob;

/// Processor backed by an external program.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    unsupported_markers: Vec<String>,
    output_extension: Option<String>,
    output_content_type: Option<String>,
}

impl CommandProcessor {
    /// Run `program` with `args`.
    #[must_use]
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            unsupported_markers: Vec::new(),
            output_extension: None,
            output_content_type: None,
        }
    }

    /// Treat a failure whose stderr contains `marker` as unsupported input.
    #[must_use]
    pub fn unsupported_when(mut self, marker: impl Into<String>) -> Self {
        self.unsupported_markers.push(marker.into());
        self
    }

    /// Extension of the destination file; some programs pick the output
    /// format from it.
    #[must_use]
    pub fn output_extension(mut self, extension: impl Into<String>) -> Self {
        self.output_extension = Some(extension.into());
        self
    }

    /// MIME type of the produced content.
    #[must_use]
    pub fn output_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.output_content_type = Some(content_type.into());
        self
    }

    fn interpolate(
        &self,
        source: &Path,
        dest: &Path,
        options: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let source = source.to_string_lossy();
        let dest = dest.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                let mut arg = arg.replace(":source", &source).replace(":dest", &dest);
                for (key, value) in options {
                    arg = arg.replace(&format!(":{key}"), value);
                }
                arg
            })
            .collect()
    }
}

fn scratch_file(prefix: &str, extension: Option<&str>) -> io::Result<NamedTempFile> {
    let suffix = extension.map(|e| format!(".{e}")).unwrap_or_default();
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&suffix)
        .tempfile()
}

fn source_extension(input: &Blob) -> Option<&str> {
    input
        .original_filename
        .as_deref()
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn transform(
        &self,
        input: &Blob,
        options: &BTreeMap<String, String>,
    ) -> Result<Option<Blob>, ProcessorError> {
        // Both files are removed when dropped, on every return path.
        let source = scratch_file("vellum-src-", source_extension(input))?;
        let dest = scratch_file("vellum-dst-", self.output_extension.as_deref())?;
        tokio::fs::write(source.path(), &input.data).await?;

        let args = self.interpolate(source.path(), dest.path(), options);
        tracing::debug!(program = %self.program, ?args, "running processor command");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProcessorError::CommandNotFound {
                    program: self.program.clone(),
                },
                _ => ProcessorError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if self
                .unsupported_markers
                .iter()
                .any(|marker| stderr.contains(marker.as_str()))
            {
                return Err(ProcessorError::unsupported(stderr));
            }
            return Err(ProcessorError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        let data = tokio::fs::read(dest.path()).await?;
        if data.is_empty() {
            return Ok(None);
        }
        let mut blob = Blob::new(data);
        if let Some(content_type) = &self.output_content_type {
            blob = blob.with_content_type(content_type.clone());
        }
        Ok(Some(blob))
    }
}
