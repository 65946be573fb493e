// Shared IM utilities (used by Telegram and Feishu adapters)

/// Sentence terminators considered when no line break fits the window
const SENTENCE_TERMINATORS: [char; 6] = ['.', '!', '?', '。', '！', '？'];

/// Map MIME type to file extension.
pub(crate) fn mime_to_ext(mime: &str) -> &str {
    match mime {
        "audio/ogg" => "ogg",
        "audio/opus" => "opus",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/m4a" => "m4a",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "application/pdf" => "pdf",
        _ => {
            // Handle mime types with parameters (e.g. "audio/ogg; codecs=opus")
            if mime.starts_with("audio/ogg") {
                "ogg"
            } else if mime.starts_with("image/") {
                // Best-effort: extract subtype as extension
                mime.strip_prefix("image/")
                    .and_then(|s| s.split(';').next())
                    .unwrap_or("bin")
            } else {
                "bin"
            }
        }
    }
}

/// Sanitize a filename to prevent path traversal attacks.
/// Strips path separators, `.` and `..` components, and null bytes.
pub(crate) fn sanitize_filename(name: &str) -> String {
    // Take only the last path component (strip any directory traversal)
    let base = name.rsplit(['/', '\\']).next().unwrap_or("file");
    // Remove null bytes and leading dots (prevent hidden files / `.` / `..`)
    let cleaned: String = base
        .chars()
        .filter(|c| *c != '\0')
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Lower-cased extension of a file name, if any
pub(crate) fn file_ext(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Number of characters (the unit platform length limits are checked in)
pub(crate) fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split text into chunks of at most `max_len` characters.
///
/// Inside the first `max_len` characters of the remaining text the split point is
/// the end of the last paragraph break, else line break, else sentence terminator,
/// else whitespace, else a hard cut at `max_len`. Leading whitespace of the next
/// chunk is trimmed.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if char_len(text) <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if char_len(remaining) <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte offset of the char boundary right after `max_len` characters
        let window_end = remaining
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let window = &remaining[..window_end];
        let break_at = find_split_point(window).unwrap_or(window_end);

        chunks.push(remaining[..break_at].to_string());
        remaining = remaining[break_at..].trim_start();
    }

    chunks
}

/// Byte offset just past the preferred boundary in `window`
fn find_split_point(window: &str) -> Option<usize> {
    window
        .rfind("\n\n")
        .map(|i| i + 2)
        .or_else(|| window.rfind('\n').map(|i| i + 1))
        .or_else(|| last_char_end(window, |c| SENTENCE_TERMINATORS.contains(&c)))
        .or_else(|| last_char_end(window, char::is_whitespace))
        .filter(|&i| i > 0)
}

fn last_char_end(window: &str, pred: impl Fn(char) -> bool) -> Option<usize> {
    window
        .char_indices()
        .rev()
        .find(|(_, c)| pred(*c))
        .map(|(i, c)| i + c.len_utf8())
}
