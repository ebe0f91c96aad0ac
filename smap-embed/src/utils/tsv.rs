//! Tab-separated table helpers
//!
//! Shared by the link cache, the dataset, and the metadata reader.

use std::borrow::Cow;
use std::io::Write;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Replace characters that would break the row/cell structure
pub fn sanitize_cell(cell: &str) -> Cow<'_, str> {
    if cell.contains(['\t', '\n', '\r']) {
        Cow::Owned(cell.replace(['\t', '\n', '\r'], " "))
    } else {
        Cow::Borrowed(cell)
    }
}

/// Format one newline-terminated row
pub fn format_row<I, S>(cells: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut line = String::new();
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&sanitize_cell(cell.as_ref()));
    }
    line.push('\n');
    line
}

/// Split a row into cells, tolerating CRLF line endings
pub fn split_row(line: &str) -> Vec<&str> {
    line.strip_suffix('\r').unwrap_or(line).split('\t').collect()
}

/// Length of the prefix made of complete (newline-terminated) lines
pub fn complete_len(content: &[u8]) -> usize {
    content
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}

/// Replace `path` with `content` via a temp file in the same directory
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Append one complete row and sync it, all or nothing
///
/// If any step fails the file is cut back to its previous length, so the
/// next row is never glued onto a fragment of this one.
pub async fn append_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    let len_before = file.metadata().await?.len();
    let result = write_synced(file, line).await;
    if let Err(e) = &result {
        match file.set_len(len_before).await {
            Ok(()) => warn!(error = %e, "Append failed, partial row rolled back"),
            Err(rollback) => warn!(
                error = %e,
                rollback_error = %rollback,
                "Append failed and the partial row could not be removed"
            ),
        }
    }
    result
}

async fn write_synced(file: &mut File, line: &[u8]) -> std::io::Result<()> {
    file.write_all(line).await?;
    file.flush().await?;
    file.sync_data().await
}
