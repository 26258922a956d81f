//! Mime-type detection for backends without a native content-type field.

/// Number of leading bytes inspected when sniffing a payload.
pub const SNIFF_LEN: usize = 8192;

/// Fallback for binary payloads of unknown type.
pub const OCTET_STREAM: &str = "application/octet-stream";
/// Reported for zero-length payloads.
pub const EMPTY: &str = "application/x-empty";
/// Fallback for text payloads whose extension says nothing more specific.
pub const TEXT_PLAIN: &str = "text/plain";

/// Detects the mime type of `bytes`, using `key` only to refine text payloads.
pub fn sniff(key: &str, bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return EMPTY.to_string();
    }
    if let Some(kind) = infer::get(bytes) {
        return kind.mime_type().to_string();
    }
    if !looks_like_text(bytes) {
        return OCTET_STREAM.to_string();
    }
    mime_guess::from_path(key)
        .first_raw()
        .filter(|guess| is_textual(guess))
        .unwrap_or(TEXT_PLAIN)
        .to_string()
}

fn looks_like_text(bytes: &[u8]) -> bool {
    let valid = match std::str::from_utf8(bytes) {
        Ok(_) => true,
        // a prefix may cut a multi-byte sequence short
        Err(e) => e.error_len().is_none(),
    };
    valid
        && bytes
            .iter()
            .all(|b| !b.is_ascii_control() || matches!(b, b'\t' | b'\n' | b'\r' | 0x0c | 0x1b))
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/")
        || matches!(
            mime,
            "application/json"
                | "application/xml"
                | "application/javascript"
                | "application/toml"
                | "application/x-sh"
                | "image/svg+xml"
        )
}
