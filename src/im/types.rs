// IM outbound types (Rust side)
// Platform-agnostic message chain, per-platform error kinds and adapter configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::proxy_config::ProxySettings;

// ── Message chain ───────────────────────────────────────────

/// Where a binary segment's bytes come from. Parsed once when the chain is
/// built; downstream code matches on the variant and never re-inspects strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinaryRef {
    /// Platform-native id (Telegram file_id, Feishu image_key/file_key). Sent as-is.
    OpaqueHandle(String),
    /// http(s) URL, downloaded before upload
    RemoteUrl(String),
    /// base64 payload (without the `base64://` scheme), decoded before upload
    InlineBytes(String),
    /// File on local disk
    LocalPath(PathBuf),
}

/// Prefixes that mark a platform-native handle
const OPAQUE_PREFIXES: [&str; 3] = ["file_id:", "file_key:", "image_key:"];

impl BinaryRef {
    /// Parse the string form used by upstream producers.
    pub fn parse(raw: &str) -> Self {
        for prefix in OPAQUE_PREFIXES {
            if let Some(handle) = raw.strip_prefix(prefix) {
                return BinaryRef::OpaqueHandle(handle.to_string());
            }
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return BinaryRef::RemoteUrl(raw.to_string());
        }
        if let Some(payload) = raw.strip_prefix("base64://") {
            return BinaryRef::InlineBytes(payload.to_string());
        }
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        BinaryRef::LocalPath(PathBuf::from(path))
    }

    /// Short description for logs (never dumps inline payloads)
    pub fn describe(&self) -> String {
        match self {
            BinaryRef::OpaqueHandle(h) => format!("handle:{}", h),
            BinaryRef::RemoteUrl(u) => u.clone(),
            BinaryRef::InlineBytes(b) => format!("base64({} chars)", b.len()),
            BinaryRef::LocalPath(p) => p.display().to_string(),
        }
    }
}

/// One inline-keyboard button
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Button {
    /// Opens a link
    Url { label: String, url: String },
    /// Sends an opaque callback token back to the bot
    Callback { label: String, token: String },
}

impl Button {
    pub fn url(label: impl Into<String>, url: impl Into<String>) -> Self {
        Button::Url { label: label.into(), url: url.into() }
    }

    pub fn callback(label: impl Into<String>, token: impl Into<String>) -> Self {
        Button::Callback { label: label.into(), token: token.into() }
    }

    pub fn label(&self) -> &str {
        match self {
            Button::Url { label, .. } | Button::Callback { label, .. } => label,
        }
    }
}

/// Rows of buttons, rendered row-major
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<Button>>,
}

impl InlineKeyboard {
    pub fn new(rows: Vec<Vec<Button>>) -> Self {
        Self { rows }
    }

    /// True when no row holds a button
    pub fn is_empty(&self) -> bool {
        self.rows.iter().all(|r| r.is_empty())
    }

    /// All buttons in row-major order
    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.rows.iter().flatten()
    }
}

/// One typed unit of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Mention {
        user_id: String,
        name: Option<String>,
    },
    Image {
        source: BinaryRef,
        caption: Option<String>,
    },
    File {
        source: BinaryRef,
        name: Option<String>,
        caption: Option<String>,
    },
    Voice {
        source: BinaryRef,
    },
    Keyboard(InlineKeyboard),
    /// Quote/reply to an existing message
    Reply {
        message_id: String,
    },
    /// A segment kind produced upstream that no adapter can render (dropped with a warning)
    Unsupported {
        kind: String,
    },
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text(text.into())
    }

    pub fn image(raw: &str) -> Self {
        Segment::Image { source: BinaryRef::parse(raw), caption: None }
    }

    pub fn file(raw: &str, name: Option<&str>) -> Self {
        Segment::File {
            source: BinaryRef::parse(raw),
            name: name.map(String::from),
            caption: None,
        }
    }

    pub fn voice(raw: &str) -> Self {
        Segment::Voice { source: BinaryRef::parse(raw) }
    }

    /// Kind name used in logs
    pub fn kind(&self) -> &str {
        match self {
            Segment::Text(_) => "text",
            Segment::Mention { .. } => "mention",
            Segment::Image { .. } => "image",
            Segment::File { .. } => "file",
            Segment::Voice { .. } => "voice",
            Segment::Keyboard(_) => "keyboard",
            Segment::Reply { .. } => "reply",
            Segment::Unsupported { kind } => kind,
        }
    }

    /// Display text for a mention (`@name`, falling back to the id)
    pub fn mention_display(user_id: &str, name: Option<&str>) -> String {
        format!("@{}", name.filter(|n| !n.is_empty()).unwrap_or(user_id))
    }
}

/// Ordered sequence of segments forming one logical outbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageChain {
    pub segments: Vec<Segment>,
}

impl MessageChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain holding a single text segment
    pub fn plain(text: impl Into<String>) -> Self {
        Self { segments: vec![Segment::Text(text.into())] }
    }

    /// Builder-style append
    pub fn with(mut self, segment: Segment) -> Self {
        self.segments.push(segment);
        self
    }

    pub fn extend(&mut self, other: MessageChain) {
        self.segments.extend(other.segments);
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Merge runs of consecutive Text segments into one
    pub fn squash_text(&mut self) {
        let mut squashed: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for segment in self.segments.drain(..) {
            if let (Some(Segment::Text(prev)), Segment::Text(next)) = (squashed.last_mut(), &segment) {
                prev.push_str(next);
                continue;
            }
            squashed.push(segment);
        }
        self.segments = squashed;
    }
}

/// One item of a streaming sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFragment {
    Chain(MessageChain),
    /// Ends the current message; the next text starts a new one
    Break,
}

/// Platform-issued identifier of a sent message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(String);

impl DeliveryHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Configuration ───────────────────────────────────────────

/// Streaming knobs for one platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    /// Minimum spacing between two edits of the same draft
    pub throttle_interval_ms: u64,
    /// Max characters per message
    pub max_message_length: usize,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_telegram_stream() -> StreamSettings {
    StreamSettings {
        throttle_interval_ms: 600,
        max_message_length: 4096,
    }
}

fn default_feishu_api_base() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

fn default_feishu_stream() -> StreamSettings {
    StreamSettings {
        throttle_interval_ms: 1000,
        max_message_length: 30000,
    }
}

/// Telegram bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_telegram_stream")]
    pub stream: StreamSettings,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: default_telegram_api_base(),
            stream: default_telegram_stream(),
        }
    }
}

/// Feishu / Lark app configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeishuConfig {
    pub app_id: String,
    pub app_secret: String,
    /// `https://open.feishu.cn/open-apis` or `https://open.larksuite.com/open-apis`
    #[serde(default = "default_feishu_api_base")]
    pub api_base: String,
    /// Stream by editing a draft in place; off means buffer and send once
    #[serde(default)]
    pub stream_edit: bool,
    #[serde(default = "default_feishu_stream")]
    pub stream: StreamSettings,
}

impl FeishuConfig {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            api_base: default_feishu_api_base(),
            stream_edit: false,
            stream: default_feishu_stream(),
        }
    }
}

/// Whole bridge configuration (`~/.imbridge/config.json`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub feishu: Option<FeishuConfig>,
    /// Where media resolution writes its temporary files
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Unified log directory (file logging disabled when absent)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub proxy_settings: Option<ProxySettings>,
}

impl BridgeConfig {
    /// Temp directory for downloads/decodes, defaulting to `<system temp>/imbridge`
    pub fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("imbridge"))
    }

    /// Persist unified logs under `logDir` when one is configured.
    /// Returns whether file logging was requested.
    pub fn init_logging(&self) -> bool {
        match &self.log_dir {
            Some(dir) => {
                crate::logger::init_log_dir(dir.clone());
                true
            }
            None => false,
        }
    }
}

// ── Errors ──────────────────────────────────────────────────

/// Telegram API error types
#[derive(Debug)]
pub enum TelegramError {
    /// Network timeout during API call
    NetworkTimeout,
    /// Rate limited by Telegram (retry after N seconds)
    RateLimited(u64),
    /// Markdown parsing failed (should retry as plain text)
    MarkdownParseError,
    /// Message content didn't change (safe to ignore)
    MessageNotModified,
    /// Message exceeds the length limit
    MessageTooLong,
    /// Group thread no longer exists
    ThreadNotFound,
    /// Bot was kicked from group
    BotKicked,
    /// Bot token is invalid
    TokenUnauthorized,
    /// Other API error
    Other(String),
}

impl std::fmt::Display for TelegramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkTimeout => write!(f, "Network timeout"),
            Self::RateLimited(secs) => write!(f, "Rate limited, retry after {}s", secs),
            Self::MarkdownParseError => write!(f, "Markdown parse error"),
            Self::MessageNotModified => write!(f, "Message not modified"),
            Self::MessageTooLong => write!(f, "Message too long"),
            Self::ThreadNotFound => write!(f, "Thread not found"),
            Self::BotKicked => write!(f, "Bot kicked from group"),
            Self::TokenUnauthorized => write!(f, "Token unauthorized"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TelegramError {}

impl TelegramError {
    /// Rejected because of the rich format; the same content may pass as plain text
    pub fn is_render_failure(&self) -> bool {
        matches!(self, Self::MarkdownParseError | Self::MessageTooLong)
    }
}

/// Feishu Open API error types
#[derive(Debug)]
pub enum FeishuError {
    /// Transport-level failure
    Network(String),
    /// App credentials rejected
    TokenUnauthorized,
    /// Message content rejected by the server (retry as plain text)
    InvalidContent(String),
    /// Any other non-zero API code
    Api { code: i64, msg: String },
    Other(String),
}

impl std::fmt::Display for FeishuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network(e) => write!(f, "Network error: {}", e),
            Self::TokenUnauthorized => write!(f, "Token unauthorized"),
            Self::InvalidContent(msg) => write!(f, "Invalid message content: {}", msg),
            Self::Api { code, msg } => write!(f, "Feishu API error code {}: {}", code, msg),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FeishuError {}

impl FeishuError {
    /// Rejected because of the rich format; the same content may pass as plain text
    pub fn is_render_failure(&self) -> bool {
        matches!(self, Self::InvalidContent(_))
    }
}

/// Attachment resolution failures
#[derive(Debug)]
pub enum MediaError {
    Download(String),
    Decode(String),
    Io(String),
    /// Remote payload exceeded the download cap (bytes)
    TooLarge(usize),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download(e) => write!(f, "Download failed: {}", e),
            Self::Decode(e) => write!(f, "Inline data decode failed: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::TooLarge(size) => write!(f, "Payload too large: {} bytes", size),
        }
    }
}

impl std::error::Error for MediaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_ref_parse_prefixes() {
        assert_eq!(
            BinaryRef::parse("file_id:AgAD123"),
            BinaryRef::OpaqueHandle("AgAD123".to_string())
        );
        assert_eq!(
            BinaryRef::parse("image_key:img_v2_abc"),
            BinaryRef::OpaqueHandle("img_v2_abc".to_string())
        );
        assert_eq!(
            BinaryRef::parse("https://example.com/a.png"),
            BinaryRef::RemoteUrl("https://example.com/a.png".to_string())
        );
        assert_eq!(
            BinaryRef::parse("base64://aGVsbG8="),
            BinaryRef::InlineBytes("aGVsbG8=".to_string())
        );
        assert_eq!(
            BinaryRef::parse("file:///tmp/a.png"),
            BinaryRef::LocalPath(PathBuf::from("/tmp/a.png"))
        );
        assert_eq!(
            BinaryRef::parse("relative/a.png"),
            BinaryRef::LocalPath(PathBuf::from("relative/a.png"))
        );
    }

    #[test]
    fn test_squash_text_merges_runs_only() {
        let mut chain = MessageChain::plain("Hel")
            .with(Segment::text("lo"))
            .with(Segment::image("file_id:x"))
            .with(Segment::text(" a"))
            .with(Segment::text("b"));
        chain.squash_text();
        assert_eq!(
            chain.segments,
            vec![
                Segment::text("Hello"),
                Segment::image("file_id:x"),
                Segment::text(" ab"),
            ]
        );
    }

    #[test]
    fn test_keyboard_row_major_and_empty() {
        let kb = InlineKeyboard::new(vec![
            vec![Button::callback("a", "1"), Button::url("b", "https://b")],
            vec![],
            vec![Button::callback("c", "3")],
        ]);
        let labels: Vec<&str> = kb.buttons().map(|b| b.label()).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
        assert!(!kb.is_empty());
        assert!(InlineKeyboard::new(vec![vec![]]).is_empty());
    }

    #[test]
    fn test_mention_display_falls_back_to_id() {
        assert_eq!(Segment::mention_display("ou_1", Some("alice")), "@alice");
        assert_eq!(Segment::mention_display("ou_1", Some("")), "@ou_1");
        assert_eq!(Segment::mention_display("ou_1", None), "@ou_1");
    }

    #[test]
    fn test_config_defaults_from_minimal_json() {
        let cfg: BridgeConfig = serde_json::from_str(
            r#"{"telegram": {"botToken": "t"}, "feishu": {"appId": "a", "appSecret": "s"}}"#,
        )
        .unwrap();
        let tg = cfg.telegram.unwrap();
        assert_eq!(tg.api_base, "https://api.telegram.org");
        assert_eq!(tg.stream.throttle_interval_ms, 600);
        assert_eq!(tg.stream.max_message_length, 4096);
        let fs = cfg.feishu.unwrap();
        assert!(!fs.stream_edit);
        assert_eq!(fs.stream.max_message_length, 30000);
        assert!(cfg.proxy_settings.is_none());
    }
}
