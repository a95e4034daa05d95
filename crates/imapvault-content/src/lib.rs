//! On-disk attachment layout and attachment text extraction.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use imapvault_mail::ParsedAttachment;

const UNKNOWN_DATE_DIR: &str = "unknown-date";
const HTML_TEXT_WIDTH: usize = 100;

/// Turns a saved attachment into searchable text. Never fails: unsupported
/// formats and read errors come back as bracketed placeholders.
pub trait TextExtractor {
    fn extract_text(&self, path: &Path) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileTextExtractor;

impl TextExtractor for FileTextExtractor {
    fn extract_text(&self, path: &Path) -> String {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();
        let result = match ext.as_str() {
            ".txt" => fs::read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            ".html" | ".htm" => {
                fs::read(path).map(|bytes| html2text::from_read(bytes.as_slice(), HTML_TEXT_WIDTH))
            }
            _ => return format!("[Unsupported attachment type: {}]", ext),
        };
        match result {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "attachment extraction failed");
                format!("[Error extracting {}: {}]", path.display(), err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredAttachment {
    pub filename: String,
    pub content_type: String,
    pub path: PathBuf,
    pub size: u64,
    pub extracted_text: String,
}

/// `<root>/<safe_folder>/<YYYY>/<MM>/<uid>/<filename>`
#[derive(Debug, Clone)]
pub struct AttachmentLayout {
    root: PathBuf,
}

impl AttachmentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn message_dir(&self, folder: &str, year_month: Option<(i32, u32)>, uid: u32) -> PathBuf {
        let mut dir = self.root.join(safe_folder(folder));
        match year_month {
            Some((year, month)) => {
                dir.push(format!("{:04}", year));
                dir.push(format!("{:02}", month));
            }
            None => dir.push(UNKNOWN_DATE_DIR),
        }
        dir.push(uid.to_string());
        dir
    }

    /// Writes every attachment of one message and extracts its text. Returns
    /// `None` when the message has no attachments, so no directory is made.
    pub fn store(
        &self,
        folder: &str,
        year_month: Option<(i32, u32)>,
        uid: u32,
        attachments: &[ParsedAttachment],
        extractor: &dyn TextExtractor,
    ) -> Result<Option<(PathBuf, Vec<StoredAttachment>)>> {
        if attachments.is_empty() {
            return Ok(None);
        }
        let dir = self.message_dir(folder, year_month, uid);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating attachment directory {}", dir.display()))?;

        let mut stored = Vec::with_capacity(attachments.len());
        let mut taken = HashSet::new();
        for (index, attachment) in attachments.iter().enumerate() {
            let filename = distinct_filename(attachment_filename(index, attachment), index, &taken);
            taken.insert(filename.clone());
            let mut path = dir.join(&filename);
            if path.is_dir() {
                let mut name = path.into_os_string();
                name.push("_file");
                path = PathBuf::from(name);
            }
            fs::write(&path, &attachment.payload)
                .with_context(|| format!("writing attachment {}", path.display()))?;
            debug!(uid, folder, path = %path.display(), "attachment written");
            let extracted_text = extractor.extract_text(&path);
            stored.push(StoredAttachment {
                filename,
                content_type: attachment.content_type.clone(),
                path,
                size: attachment.payload.len() as u64,
                extracted_text,
            });
        }
        Ok(Some((dir, stored)))
    }
}

pub fn safe_folder(folder: &str) -> String {
    folder.replace(['/', ' '], "_")
}

/// Declared filename made path-safe, or `attachment_<i><ext>` with the
/// extension guessed from the content type.
pub fn attachment_filename(index: usize, attachment: &ParsedAttachment) -> String {
    let declared = attachment
        .filename
        .as_deref()
        .map(|name| name.trim().replace(['/', '\\'], "_"))
        .filter(|name| !name.is_empty() && name != "." && name != "..");
    declared.unwrap_or_else(|| {
        format!(
            "attachment_{}{}",
            index,
            extension_for(&attachment.content_type)
        )
    })
}

/// Repeated names within one message get the part index before the
/// extension: `a.txt`, `a_1.txt`.
fn distinct_filename(name: String, index: usize, taken: &HashSet<String>) -> String {
    if !taken.contains(&name) {
        return name;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name.as_str(), ""),
    };
    let mut candidate = format!("{}_{}{}", stem, index, ext);
    let mut bump = index;
    while taken.contains(&candidate) {
        bump += 1;
        candidate = format!("{}_{}{}", stem, bump, ext);
    }
    candidate
}

fn extension_for(content_type: &str) -> String {
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_else(|| ".bin".to_string())
}
