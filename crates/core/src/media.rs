//! File-type helpers for produced artifacts.

use std::path::Path;

/// Extensions treated as video results, lowercase.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi", "mkv", "gif"];

pub fn is_video(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Pick the artifact a job reports as its result: the first video-like
/// file, otherwise the first file.
pub fn select_result<'a, P: AsRef<Path>>(files: &'a [P]) -> Option<&'a P> {
    files
        .iter()
        .find(|f| is_video(f.as_ref()))
        .or_else(|| files.first())
}
