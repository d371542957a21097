//! Deterministic names derived from a video's source id.
//!
//! Retrying a download must land on the same temp file and overwrite the same
//! object, so these are pure functions of the source id and nothing else.

/// Prefix of every temp download; used by the startup sweep.
pub const TEMP_FILE_PREFIX: &str = "ytdl-";
pub const VIDEO_EXTENSION: &str = "mp4";

/// Replaces anything outside `[A-Za-z0-9_-]`. When the id had to be altered,
/// a short blake3 digest of the original is appended so two different ids can
/// never collapse onto the same name.
pub fn safe_source_id(source_id: &str) -> String {
    let sanitized: String = source_id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    if !sanitized.is_empty() && sanitized == source_id {
        return sanitized;
    }

    let digest = blake3::hash(source_id.as_bytes()).to_hex();
    format!("{sanitized}-{}", &digest[..12])
}

/// File name (not path) of the local download for `source_id`.
pub fn temp_file_name(source_id: &str) -> String {
    format!(
        "{TEMP_FILE_PREFIX}{}.{VIDEO_EXTENSION}",
        safe_source_id(source_id)
    )
}

/// Object key the finished download is stored under.
pub fn storage_key(source_id: &str) -> String {
    let id = safe_source_id(source_id);
    format!("videos/{id}/{id}.{VIDEO_EXTENSION}")
}
