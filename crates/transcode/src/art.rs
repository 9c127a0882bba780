//! Cover art preparation.

use crate::error::{ErrorKind, Result};
use encore_formats::Format;
use encore_pipeline::picture_block;
use encore_storage::BackendHandle;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// How cover art reaches the encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Art {
    /// A local image file mapped in as an attached-picture video stream.
    Attached(PathBuf),
    /// A base64 picture block carried as a tag, for Ogg containers.
    Block(String),
}

impl Art {
    pub fn attached(&self) -> Option<&Path> {
        match self {
            Self::Attached(path) => Some(path),
            Self::Block(_) => None,
        }
    }

    pub fn block(&self) -> Option<&str> {
        match self {
            Self::Block(block) => Some(block),
            Self::Attached(_) => None,
        }
    }
}

/// Whether art is embedded at all: only downloads get it, and never formats
/// that explicitly drop video.
pub(crate) fn wants_art(format: &Format) -> bool {
    format.usage.can_download() && !format.drops_video()
}

/// Fetch the art blob into `dir` and decide how to embed it.
///
/// An unreadable art blob fails like an unreadable master. Art that can't be
/// identified for an Ogg picture block is skipped with a warning.
pub(crate) async fn prepare(
    storage: &BackendHandle,
    magick: &str,
    art: &Path,
    format: &Format,
    dir: &Path,
) -> Result<Option<Art>> {
    let data = match storage.read(art).await {
        Ok(data) => data,
        Err(err) => {
            tracing::error!(art = %art.display(), error = %err, "Cover art is missing");
            return Err(err.raise(ErrorKind::SourceMissing(art.display().to_string())));
        },
    };
    let extension = art.extension().and_then(|e| e.to_str()).unwrap_or("img");
    let local = dir.join(format!("art.{extension}"));
    tokio::fs::write(&local, &data).await.or_raise(|| ErrorKind::WorkDir)?;
    if !format.is_ogg() {
        return Ok(Some(Art::Attached(local)));
    }
    // Ogg muxers won't take a picture stream; embed it as a tag instead.
    let Some((width, height)) = identify(magick, &local).await else {
        return Ok(None);
    };
    Ok(Some(Art::Block(picture_block(&data, mime_type(extension), "", width, height))))
}

async fn identify(magick: &str, image: &Path) -> Option<(u32, u32)> {
    let output = Command::new(magick)
        .arg(image)
        .args(["-identify", "null:-"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;
    let output = match output {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(program = magick, error = %err, "Failed to run ImageMagick; skipping art");
            return None;
        },
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(diagnostics = %stderr.trim(), "Failed to identify art with ImageMagick; skipping art");
        return None;
    }
    parse_dimensions(&String::from_utf8_lossy(&output.stdout))
}

/// First `WIDTHxHEIGHT` token of `-identify` output.
fn parse_dimensions(identify: &str) -> Option<(u32, u32)> {
    identify.split_whitespace().find_map(|token| {
        let (width, rest) = token.split_once('x')?;
        let height = rest.find(|c: char| !c.is_ascii_digit()).map_or(rest, |end| &rest[..end]);
        Some((width.parse().ok()?, height.parse().ok()?))
    })
}

fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}
