// Telegram Bot API outbound adapter
// Renders message chains into sendMessage / sendPhoto / sendDocument / sendVoice calls
// (split + MarkdownV2 fallback), edits, deletes, reactions and draft streaming.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::{json, Value};

use super::adapter::MessageEvent;
use super::markdown::markdown_to_telegram_v2;
use super::media::{MediaResolver, ResolvedMedia, UploadCache};
use super::stream::{run_buffered, run_stream, DraftSink, StreamPolicy};
use super::types::{
    BinaryRef, BridgeConfig, Button, DeliveryHandle, InlineKeyboard, MessageChain, Segment,
    StreamFragment, TelegramConfig, TelegramError,
};
use super::util::split_message;
use crate::proxy_config::{self, ProxySettings};
use crate::{ulog_debug, ulog_warn};

/// HTTP timeout for Bot API calls (uploads included)
const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Text carrying an inline keyboard when the chain has nothing else to attach it to
const KEYBOARD_PLACEHOLDER: &str = "👇";

/// Chat addressed by an event. `"chat_id#thread_id"` targets a forum topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    pub chat_id: String,
    pub thread_id: Option<i64>,
}

impl ChatTarget {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('#') {
            Some((chat, thread)) => {
                let thread_id = thread.parse::<i64>().ok();
                if thread_id.is_none() {
                    ulog_warn!("[telegram] Ignoring invalid thread id in target {}", raw);
                }
                Self { chat_id: chat.to_string(), thread_id }
            }
            None => Self { chat_id: raw.to_string(), thread_id: None },
        }
    }

    /// Base parameters shared by every send in this chat
    fn params(&self) -> Value {
        let mut params = json!({ "chat_id": self.chat_id });
        if let Some(tid) = self.thread_id {
            params["message_thread_id"] = json!(tid);
        }
        params
    }
}

/// Binary message kinds and their Bot API method/field names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaKind {
    Photo,
    Document,
    Voice,
}

impl MediaKind {
    fn method(&self) -> &'static str {
        match self {
            MediaKind::Photo => "sendPhoto",
            MediaKind::Document => "sendDocument",
            MediaKind::Voice => "sendVoice",
        }
    }

    fn field(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Document => "document",
            MediaKind::Voice => "voice",
        }
    }

    fn default_ext(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Document => "bin",
            MediaKind::Voice => "ogg",
        }
    }

    /// file_id of the uploaded content in a send* result
    fn uploaded_file_id(&self, result: &Value) -> Option<String> {
        let node = match self {
            // Photo sizes come smallest first
            MediaKind::Photo => result["photo"].as_array()?.last()?,
            MediaKind::Document => &result["document"],
            MediaKind::Voice => &result["voice"],
        };
        node["file_id"].as_str().map(String::from)
    }
}

/// A binary segment queued for delivery
#[derive(Debug)]
struct MediaItem<'a> {
    kind: MediaKind,
    source: &'a BinaryRef,
    name: Option<&'a str>,
    caption: Option<&'a str>,
}

/// Content of a media send: a reusable file_id or bytes to upload
enum MediaBody {
    FileId(String),
    Upload { bytes: Vec<u8>, file_name: String },
}

/// Telegram Bot API client (shared by all events of one bot)
pub struct TelegramAdapter {
    bot_token: String,
    api_base: String,
    client: Client,
    media: MediaResolver,
    policy: StreamPolicy,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, proxy: Option<&ProxySettings>, temp_dir: PathBuf) -> Self {
        let client_builder = Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        let client = proxy_config::build_client_with_proxy(client_builder, proxy)
            .unwrap_or_else(|e| {
                ulog_warn!("[telegram] Failed to build client with proxy: {}, falling back to direct", e);
                Client::new()
            });

        Self {
            bot_token: config.bot_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            media: MediaResolver::new(client.clone(), temp_dir),
            client,
            policy: StreamPolicy::from(&config.stream),
        }
    }

    /// Build from the bridge config (proxy and temp dir applied).
    /// `None` when no telegram section is configured.
    pub fn from_bridge(config: &BridgeConfig) -> Option<Self> {
        let telegram = config.telegram.as_ref()?;
        Some(Self::new(
            telegram,
            config.proxy_settings.as_ref(),
            config.resolved_temp_dir(),
        ))
    }

    pub fn stream_policy(&self) -> &StreamPolicy {
        &self.policy
    }

    // ===== Telegram Bot API endpoints =====

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// JSON API call. Single attempt: rate limits and transient errors are reported, not retried.
    async fn api_call(&self, method: &str, body: &Value) -> Result<Value, TelegramError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::parse_response(method, resp).await
    }

    /// multipart/form-data API call (file uploads)
    async fn multipart_call(&self, method: &str, form: Form) -> Result<Value, TelegramError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(Self::transport_error)?;
        Self::parse_response(method, resp).await
    }

    fn transport_error(e: reqwest::Error) -> TelegramError {
        if e.is_timeout() {
            TelegramError::NetworkTimeout
        } else {
            TelegramError::Other(format!("HTTP error: {}", e))
        }
    }

    async fn parse_response(method: &str, resp: reqwest::Response) -> Result<Value, TelegramError> {
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();

        if status.as_u16() == 429 {
            let retry_after = serde_json::from_str::<Value>(&body_text)
                .ok()
                .and_then(|v| v["parameters"]["retry_after"].as_u64())
                .unwrap_or(5);
            ulog_warn!("[telegram] Rate limited on {}, retry after {}s", method, retry_after);
            return Err(TelegramError::RateLimited(retry_after));
        }

        let json: Value = serde_json::from_str(&body_text)
            .map_err(|e| TelegramError::Other(format!("JSON parse error: {}", e)))?;

        if json["ok"].as_bool() == Some(true) {
            return Ok(json["result"].clone());
        }

        let description = json["description"].as_str().unwrap_or("");
        let error_code = json["error_code"].as_i64().unwrap_or(0);

        Err(match error_code {
            400 if description.contains("can't parse entities") => TelegramError::MarkdownParseError,
            400 if description.contains("message is not modified") => TelegramError::MessageNotModified,
            400 if description.contains("MESSAGE_TOO_LONG") || description.contains("message is too long") => {
                TelegramError::MessageTooLong
            }
            400 if description.contains("thread not found") => TelegramError::ThreadNotFound,
            403 if description.contains("was kicked") || description.contains("was blocked") => {
                TelegramError::BotKicked
            }
            401 => TelegramError::TokenUnauthorized,
            _ => TelegramError::Other(format!("API error {} on {}: {}", error_code, method, description)),
        })
    }

    fn message_id(result: &Value) -> Result<i64, TelegramError> {
        result["message_id"]
            .as_i64()
            .ok_or_else(|| TelegramError::Other("No message_id in response".into()))
    }

    /// sendMessage as MarkdownV2, retried once as plain text on a render failure
    async fn send_text(&self, params: &Value, text: &str) -> Result<i64, TelegramError> {
        let mut body = params.clone();
        body["text"] = json!(markdown_to_telegram_v2(text));
        body["parse_mode"] = json!("MarkdownV2");

        match self.api_call("sendMessage", &body).await {
            Ok(result) => return Self::message_id(&result),
            Err(e) if e.is_render_failure() => {
                ulog_debug!("[telegram] MarkdownV2 send failed ({}), falling back to plain text", e);
            }
            Err(e) => return Err(e),
        }

        let mut body = params.clone();
        body["text"] = json!(text);
        let result = self.api_call("sendMessage", &body).await?;
        Self::message_id(&result)
    }

    /// sendMessage without any format conversion (stream drafts)
    async fn send_plain(&self, params: &Value, text: &str) -> Result<i64, TelegramError> {
        let mut body = params.clone();
        body["text"] = json!(text);
        let result = self.api_call("sendMessage", &body).await?;
        Self::message_id(&result)
    }

    /// editMessageText, optionally as MarkdownV2 with a plain fallback.
    /// "message is not modified" counts as success.
    async fn edit_text(
        &self,
        chat_id: &str,
        message_id: i64,
        text: &str,
        reply_markup: Option<&Value>,
        formatted: bool,
    ) -> Result<(), TelegramError> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup.clone();
        }

        if formatted {
            let mut rich = body.clone();
            rich["text"] = json!(markdown_to_telegram_v2(text));
            rich["parse_mode"] = json!("MarkdownV2");
            match self.api_call("editMessageText", &rich).await {
                Ok(_) | Err(TelegramError::MessageNotModified) => return Ok(()),
                Err(e) if e.is_render_failure() => {
                    ulog_debug!("[telegram] MarkdownV2 edit failed ({}), retrying as plain text", e);
                }
                Err(e) => return Err(e),
            }
        }

        match self.api_call("editMessageText", &body).await {
            Ok(_) | Err(TelegramError::MessageNotModified) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn delete_message(&self, chat_id: &str, message_id: i64) -> Result<(), TelegramError> {
        self.api_call(
            "deleteMessage",
            &json!({
                "chat_id": chat_id,
                "message_id": message_id
            }),
        )
        .await?;
        Ok(())
    }

    /// Set reaction emoji on a message; empty clears this bot's reaction
    pub async fn set_reaction(
        &self,
        chat_id: &str,
        message_id: i64,
        emoji: &str,
    ) -> Result<(), TelegramError> {
        let reaction = if emoji.is_empty() {
            json!([])
        } else {
            json!([{ "type": "emoji", "emoji": emoji }])
        };
        self.api_call(
            "setMessageReaction",
            &json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "reaction": reaction
            }),
        )
        .await?;
        Ok(())
    }

    /// Send one binary segment. The upload cache turns repeated references in the
    /// same send into file_id sends.
    async fn send_media(
        &self,
        params: &Value,
        item: &MediaItem<'_>,
        cache: &mut UploadCache,
    ) -> Result<i64, TelegramError> {
        let body = match cache.get(item.kind.field(), item.source) {
            Some(file_id) => MediaBody::FileId(file_id.to_string()),
            None => {
                let resolved = self
                    .media
                    .resolve(item.source, item.name, item.kind.default_ext())
                    .await
                    .map_err(|e| TelegramError::Other(e.to_string()))?;
                match resolved {
                    ResolvedMedia::Handle(file_id) => MediaBody::FileId(file_id),
                    ResolvedMedia::Local(local) => MediaBody::Upload {
                        bytes: local
                            .read()
                            .await
                            .map_err(|e| TelegramError::Other(e.to_string()))?,
                        file_name: item
                            .name
                            .map(String::from)
                            .unwrap_or_else(|| local.file_name().to_string()),
                    },
                }
            }
        };

        let result = match item.caption {
            Some(caption) => {
                let rich = markdown_to_telegram_v2(caption);
                match self.post_media(item.kind, params, &body, Some((&rich, true))).await {
                    Ok(result) => result,
                    Err(e) if e.is_render_failure() => {
                        ulog_debug!("[telegram] MarkdownV2 caption failed ({}), using plain caption", e);
                        self.post_media(item.kind, params, &body, Some((caption, false))).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            None => self.post_media(item.kind, params, &body, None).await?,
        };

        if matches!(body, MediaBody::Upload { .. }) {
            if let Some(file_id) = item.kind.uploaded_file_id(&result) {
                cache.insert(item.kind.field(), item.source, file_id);
            }
        }
        Self::message_id(&result)
    }

    /// Issue a send{Photo,Document,Voice} call. `caption` is (text, is_markdown_v2).
    async fn post_media(
        &self,
        kind: MediaKind,
        params: &Value,
        body: &MediaBody,
        caption: Option<(&str, bool)>,
    ) -> Result<Value, TelegramError> {
        let mut params = params.clone();
        if let Some((text, markdown)) = caption {
            params["caption"] = json!(text);
            if markdown {
                params["parse_mode"] = json!("MarkdownV2");
            }
        }

        match body {
            MediaBody::FileId(file_id) => {
                params[kind.field()] = json!(file_id);
                self.api_call(kind.method(), &params).await
            }
            MediaBody::Upload { bytes, file_name } => {
                let part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                let form = form_from_params(&params).part(kind.field(), part);
                self.multipart_call(kind.method(), form).await
            }
        }
    }
}

/// Flatten JSON params into multipart text fields (objects as JSON strings)
fn form_from_params(params: &Value) -> Form {
    let mut form = Form::new();
    if let Some(map) = params.as_object() {
        for (key, value) in map {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
    }
    form
}

/// Render an inline keyboard as `reply_markup`
fn keyboard_markup(keyboard: &InlineKeyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .rows
        .iter()
        .filter(|row| !row.is_empty())
        .map(|row| {
            row.iter()
                .map(|button| match button {
                    Button::Url { label, url } => json!({ "text": label, "url": url }),
                    Button::Callback { label, token } => {
                        json!({ "text": label, "callback_data": token })
                    }
                })
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

/// Buckets of one chain, ready to dispatch
#[derive(Debug, Default)]
struct Classified<'a> {
    /// Text with mentions prefixed
    text: String,
    /// Last non-empty keyboard wins
    keyboard: Option<&'a InlineKeyboard>,
    reply_to: Option<&'a str>,
    media: Vec<MediaItem<'a>>,
}

fn classify(chain: &MessageChain) -> Classified<'_> {
    let mut out = Classified::default();
    let mut mentions = String::new();
    let mut text = String::new();

    for segment in &chain.segments {
        match segment {
            Segment::Text(t) => text.push_str(t),
            Segment::Mention { user_id, name } => {
                mentions.push_str(&Segment::mention_display(user_id, name.as_deref()));
                mentions.push(' ');
            }
            Segment::Image { source, caption } => out.media.push(MediaItem {
                kind: MediaKind::Photo,
                source,
                name: None,
                caption: caption.as_deref(),
            }),
            Segment::File { source, name, caption } => out.media.push(MediaItem {
                kind: MediaKind::Document,
                source,
                name: name.as_deref(),
                caption: caption.as_deref(),
            }),
            Segment::Voice { source } => out.media.push(MediaItem {
                kind: MediaKind::Voice,
                source,
                name: None,
                caption: None,
            }),
            Segment::Keyboard(kb) if !kb.is_empty() => out.keyboard = Some(kb),
            Segment::Keyboard(_) => {}
            Segment::Reply { message_id } => out.reply_to = Some(message_id.as_str()),
            Segment::Unsupported { kind } => {
                ulog_warn!("[telegram] Unsupported segment type dropped: {}", kind);
            }
        }
    }

    out.text = if text.is_empty() {
        mentions.trim_end().to_string()
    } else {
        mentions + &text
    };
    out
}

/// Outbound event bound to one Telegram chat (optionally a forum topic)
pub struct TelegramEvent {
    adapter: Arc<TelegramAdapter>,
    target: ChatTarget,
}

impl TelegramEvent {
    /// `target` is a chat id, optionally suffixed with `#thread_id`
    pub fn new(adapter: Arc<TelegramAdapter>, target: &str) -> Self {
        Self { adapter, target: ChatTarget::parse(target) }
    }

    fn parse_handle(handle: &DeliveryHandle) -> Option<i64> {
        let id = handle.as_str().parse::<i64>().ok();
        if id.is_none() {
            ulog_warn!("[telegram] Invalid message handle: {}", handle);
        }
        id
    }

    /// Params for one send, with reply and keyboard applied
    fn send_params(&self, reply_to: Option<i64>, markup: Option<&Value>) -> Value {
        let mut params = self.target.params();
        if let Some(id) = reply_to {
            params["reply_to_message_id"] = json!(id);
        }
        if let Some(m) = markup {
            params["reply_markup"] = m.clone();
        }
        params
    }
}

impl MessageEvent for TelegramEvent {
    async fn send(&self, chain: &MessageChain) -> Option<DeliveryHandle> {
        let classified = classify(chain);
        let markup = classified.keyboard.map(keyboard_markup);
        let reply_to = classified.reply_to.and_then(|id| {
            let parsed = id.parse::<i64>().ok();
            if parsed.is_none() {
                ulog_warn!("[telegram] Ignoring non-numeric reply id {}", id);
            }
            parsed
        });

        let mut primary: Option<i64> = None;
        let mut keyboard_sent = false;

        if !classified.text.trim().is_empty() {
            // A leading whitespace run can split off as its own chunk; Telegram rejects blank text
            let chunks: Vec<String> = split_message(&classified.text, self.adapter.policy.max_message_len)
                .into_iter()
                .filter(|chunk| !chunk.trim().is_empty())
                .collect();
            let last = chunks.len() - 1;
            for (i, chunk) in chunks.iter().enumerate() {
                let chunk_markup = if i == last { markup.as_ref() } else { None };
                let params = self.send_params(reply_to, chunk_markup);
                match self.adapter.send_text(&params, chunk).await {
                    Ok(id) => {
                        primary = Some(id);
                        keyboard_sent |= chunk_markup.is_some();
                    }
                    Err(e) => {
                        ulog_warn!(
                            "[telegram] sendMessage to {} failed (chunk {}/{}): {}",
                            self.target.chat_id,
                            i + 1,
                            chunks.len(),
                            e
                        );
                    }
                }
            }
        }

        let mut cache = UploadCache::new();
        for item in &classified.media {
            let item_markup = if keyboard_sent { None } else { markup.as_ref() };
            let params = self.send_params(reply_to, item_markup);
            match self.adapter.send_media(&params, item, &mut cache).await {
                Ok(id) => {
                    if item_markup.is_some() {
                        keyboard_sent = true;
                        primary = Some(id);
                    } else if primary.is_none() {
                        primary = Some(id);
                    }
                }
                Err(e) => {
                    ulog_warn!(
                        "[telegram] {} ({}) failed, skipping: {}",
                        item.kind.method(),
                        item.source.describe(),
                        e
                    );
                }
            }
        }

        if let (Some(m), false) = (markup.as_ref(), keyboard_sent) {
            let params = self.send_params(reply_to, Some(m));
            match self.adapter.send_plain(&params, KEYBOARD_PLACEHOLDER).await {
                Ok(id) => primary = Some(id),
                Err(e) => ulog_warn!("[telegram] Keyboard message failed: {}", e),
            }
        }

        if primary.is_none() && chain.is_empty() {
            ulog_debug!("[telegram] Empty chain, nothing sent to {}", self.target.chat_id);
        }
        primary.map(|id| DeliveryHandle::new(id.to_string()))
    }

    async fn edit(&self, handle: &DeliveryHandle, text: &str, keyboard: Option<&InlineKeyboard>) -> bool {
        let Some(message_id) = Self::parse_handle(handle) else {
            return false;
        };
        let markup = keyboard.filter(|kb| !kb.is_empty()).map(keyboard_markup);
        match self
            .adapter
            .edit_text(&self.target.chat_id, message_id, text, markup.as_ref(), true)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[telegram] editMessageText {} failed: {}", message_id, e);
                false
            }
        }
    }

    async fn delete(&self, handle: &DeliveryHandle) -> bool {
        let Some(message_id) = Self::parse_handle(handle) else {
            return false;
        };
        match self.adapter.delete_message(&self.target.chat_id, message_id).await {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[telegram] deleteMessage {} failed: {}", message_id, e);
                false
            }
        }
    }

    async fn react(&self, handle: &DeliveryHandle, token: &str) -> bool {
        let Some(message_id) = Self::parse_handle(handle) else {
            return false;
        };
        // Reactions may fail on bot permissions; reported, never raised
        match self.adapter.set_reaction(&self.target.chat_id, message_id, token).await {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[telegram] setMessageReaction {} failed: {}", message_id, e);
                false
            }
        }
    }

    async fn send_streaming<F>(&self, fragments: F, use_fallback: bool)
    where
        F: Stream<Item = StreamFragment> + Unpin + Send,
    {
        if use_fallback {
            run_buffered(self, fragments).await;
        } else {
            let policy = self.adapter.policy.clone();
            run_stream(self, fragments, &policy).await;
        }
    }
}

impl DraftSink for TelegramEvent {
    async fn send_draft(&self, text: &str) -> Option<DeliveryHandle> {
        match self.adapter.send_plain(&self.target.params(), text).await {
            Ok(id) => Some(DeliveryHandle::new(id.to_string())),
            Err(e) => {
                ulog_warn!("[telegram] Draft send failed (streaming): {}", e);
                None
            }
        }
    }

    async fn edit_draft(&self, handle: &DeliveryHandle, text: &str) -> bool {
        let Some(message_id) = Self::parse_handle(handle) else {
            return false;
        };
        match self
            .adapter
            .edit_text(&self.target.chat_id, message_id, text, None, false)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[telegram] Draft edit failed (streaming): {}", e);
                false
            }
        }
    }

    async fn finalize_draft(&self, handle: &DeliveryHandle, text: &str) -> bool {
        self.edit(handle, text, None).await
    }

    async fn send_final(&self, text: &str) -> Option<DeliveryHandle> {
        match self.adapter.send_text(&self.target.params(), text).await {
            Ok(id) => Some(DeliveryHandle::new(id.to_string())),
            Err(e) => {
                ulog_warn!("[telegram] sendMessage failed (streaming): {}", e);
                None
            }
        }
    }

    async fn send_chain(&self, chain: &MessageChain) {
        self.send(chain).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::im::types::StreamSettings;
    use futures::stream;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn ok(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": result }))
    }

    fn api_error(code: u16, description: &str) -> ResponseTemplate {
        ResponseTemplate::new(code).set_body_json(json!({
            "ok": false,
            "error_code": code,
            "description": description
        }))
    }

    fn adapter(server: &MockServer, max_len: usize, temp_dir: PathBuf) -> Arc<TelegramAdapter> {
        let config = TelegramConfig {
            bot_token: "T".into(),
            api_base: server.uri(),
            stream: StreamSettings {
                throttle_interval_ms: 600,
                max_message_length: max_len,
            },
        };
        Arc::new(TelegramAdapter::new(&config, None, temp_dir))
    }

    async fn requests_to(server: &MockServer, api_method: &str) -> Vec<Request> {
        let suffix = format!("/{}", api_method);
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.url.path().ends_with(&suffix))
            .collect()
    }

    fn json_body(req: &Request) -> Value {
        serde_json::from_slice(&req.body).unwrap()
    }

    #[test]
    fn test_chat_target_parse() {
        assert_eq!(
            ChatTarget::parse("-1001#42"),
            ChatTarget { chat_id: "-1001".into(), thread_id: Some(42) }
        );
        assert_eq!(ChatTarget::parse("12345").thread_id, None);
        assert_eq!(ChatTarget::parse("-1001#abc").thread_id, None);
    }

    #[test]
    fn test_keyboard_markup_shape() {
        let kb = InlineKeyboard::new(vec![
            vec![Button::url("Docs", "https://d"), Button::callback("OK", "ok:1")],
            vec![],
        ]);
        assert_eq!(
            keyboard_markup(&kb),
            json!({ "inline_keyboard": [[
                { "text": "Docs", "url": "https://d" },
                { "text": "OK", "callback_data": "ok:1" }
            ]] })
        );
    }

    #[test]
    fn test_classify_mentions_and_last_keyboard_wins() {
        let first = InlineKeyboard::new(vec![vec![Button::callback("a", "1")]]);
        let second = InlineKeyboard::new(vec![vec![Button::callback("b", "2")]]);
        let chain = MessageChain::new()
            .with(Segment::Mention { user_id: "1".into(), name: Some("bob".into()) })
            .with(Segment::text("hi"))
            .with(Segment::Keyboard(first))
            .with(Segment::Unsupported { kind: "poke".into() })
            .with(Segment::Keyboard(second.clone()));
        let c = classify(&chain);
        assert_eq!(c.text, "@bob hi");
        assert_eq!(c.keyboard, Some(&second));
        assert!(c.media.is_empty());
    }

    #[tokio::test]
    async fn test_send_short_text_single_markdown_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 42 })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let handle = event.send(&MessageChain::plain("Hello world.")).await;
        assert_eq!(handle, Some(DeliveryHandle::new("42")));

        let reqs = requests_to(&server, "sendMessage").await;
        let body = json_body(&reqs[0]);
        assert_eq!(body["chat_id"], "100");
        assert_eq!(body["text"], "Hello world\\.");
        assert_eq!(body["parse_mode"], "MarkdownV2");
    }

    #[tokio::test]
    async fn test_markdown_failure_falls_back_to_plain_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(api_error(400, "Bad Request: can't parse entities"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 5 })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let handle = event.send(&MessageChain::plain("*broken")).await;
        assert_eq!(handle, Some(DeliveryHandle::new("5")));

        let reqs = requests_to(&server, "sendMessage").await;
        assert_eq!(reqs.len(), 2);
        let plain = json_body(&reqs[1]);
        assert_eq!(plain["text"], "*broken");
        assert!(plain.get("parse_mode").is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({
                    "ok": false,
                    "error_code": 429,
                    "parameters": { "retry_after": 3 }
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        assert_eq!(event.send(&MessageChain::plain("hi")).await, None);
    }

    #[tokio::test]
    async fn test_long_text_split_keyboard_on_last_chunk() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 9 })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 12, dir.path().into()), "100#7");
        let kb = InlineKeyboard::new(vec![vec![Button::callback("Go", "go")]]);
        let chain = MessageChain::plain("hello world again").with(Segment::Keyboard(kb));
        assert!(event.send(&chain).await.is_some());

        let reqs = requests_to(&server, "sendMessage").await;
        assert_eq!(reqs.len(), 2);
        let first = json_body(&reqs[0]);
        let last = json_body(&reqs[1]);
        assert_eq!(first["message_thread_id"], 7);
        assert!(first.get("reply_markup").is_none());
        assert_eq!(last["reply_markup"]["inline_keyboard"][0][0]["callback_data"], "go");
    }

    #[tokio::test]
    async fn test_keyboard_only_chain_sends_placeholder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 3 })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let kb = InlineKeyboard::new(vec![vec![Button::url("Open", "https://x")]]);
        let handle = event.send(&MessageChain::new().with(Segment::Keyboard(kb))).await;
        assert_eq!(handle, Some(DeliveryHandle::new("3")));

        let body = json_body(&requests_to(&server, "sendMessage").await[0]);
        assert_eq!(body["text"], KEYBOARD_PLACEHOLDER);
        assert_eq!(body["reply_markup"]["inline_keyboard"][0][0]["url"], "https://x");
    }

    #[tokio::test]
    async fn test_repeated_image_uploaded_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendPhoto"))
            .respond_with(ok(json!({
                "message_id": 11,
                "photo": [{ "file_id": "small" }, { "file_id": "big" }]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let chain = MessageChain::new()
            .with(Segment::image("base64://aGVsbG8="))
            .with(Segment::image("base64://aGVsbG8="));
        assert_eq!(event.send(&chain).await, Some(DeliveryHandle::new("11")));

        let reqs = requests_to(&server, "sendPhoto").await;
        let content_type = |r: &Request| {
            r.headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        assert!(content_type(&reqs[0]).starts_with("multipart/form-data"));
        assert_eq!(json_body(&reqs[1])["photo"], "big");
        // Temp file from the inline payload is gone
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_same_source_as_photo_and_document_uploads_each() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendPhoto"))
            .respond_with(ok(json!({ "message_id": 1, "photo": [{ "file_id": "PHOTO_ID" }] })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botT/sendDocument"))
            .respond_with(ok(json!({ "message_id": 2, "document": { "file_id": "DOC_ID" } })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let chain = MessageChain::new()
            .with(Segment::image("base64://aGVsbG8="))
            .with(Segment::file("base64://aGVsbG8=", Some("a.txt")));
        assert!(event.send(&chain).await.is_some());

        let doc = &requests_to(&server, "sendDocument").await[0];
        let content_type = doc
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("multipart/form-data"));
        assert!(!String::from_utf8_lossy(&doc.body).contains("PHOTO_ID"));
    }

    #[tokio::test]
    async fn test_caption_markdown_then_plain_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendPhoto"))
            .respond_with(api_error(400, "Bad Request: can't parse entities"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botT/sendPhoto"))
            .respond_with(ok(json!({ "message_id": 5, "photo": [{ "file_id": "AAA" }] })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let chain = MessageChain::new().with(Segment::Image {
            source: BinaryRef::parse("file_id:AAA"),
            caption: Some("Hi.".into()),
        });
        assert_eq!(event.send(&chain).await, Some(DeliveryHandle::new("5")));

        let reqs = requests_to(&server, "sendPhoto").await;
        assert_eq!(reqs.len(), 2);
        let rich = json_body(&reqs[0]);
        assert_eq!(rich["caption"], "Hi\\.");
        assert_eq!(rich["parse_mode"], "MarkdownV2");
        assert_eq!(rich["photo"], "AAA");
        let plain = json_body(&reqs[1]);
        assert_eq!(plain["caption"], "Hi.");
        assert!(plain.get("parse_mode").is_none());
    }

    #[tokio::test]
    async fn test_leading_whitespace_chunk_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 8 })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 10, dir.path().into()), "100");
        let text = format!(" {}", "a".repeat(20));
        assert!(event.send(&MessageChain::plain(text)).await.is_some());

        let reqs = requests_to(&server, "sendMessage").await;
        assert_eq!(reqs.len(), 2);
        for req in &reqs {
            assert_eq!(json_body(req)["text"], "a".repeat(10));
        }
    }

    #[tokio::test]
    async fn test_from_bridge_applies_config() {
        assert!(TelegramAdapter::from_bridge(&BridgeConfig::default()).is_none());

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendPhoto"))
            .respond_with(ok(json!({ "message_id": 4, "photo": [{ "file_id": "P" }] })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let temp_dir = dir.path().join("media");
        let mut telegram = TelegramConfig::new("T");
        telegram.api_base = server.uri();
        telegram.stream.max_message_length = 50;
        let config = BridgeConfig {
            telegram: Some(telegram),
            temp_dir: Some(temp_dir.clone()),
            proxy_settings: Some(ProxySettings::default()),
            ..Default::default()
        };

        let adapter = TelegramAdapter::from_bridge(&config).unwrap();
        assert_eq!(adapter.stream_policy().max_message_len, 50);

        let event = TelegramEvent::new(Arc::new(adapter), "100");
        let chain = MessageChain::new().with(Segment::image("base64://aGVsbG8="));
        assert!(event.send(&chain).await.is_some());
        // Inline payload was staged in the configured temp dir, then removed
        assert!(temp_dir.is_dir());
        assert_eq!(std::fs::read_dir(&temp_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_does_not_block_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 1 })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/botT/sendDocument"))
            .respond_with(ok(json!({ "message_id": 2 })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let chain = MessageChain::plain("caption text")
            .with(Segment::image("/definitely/not/here.png"))
            .with(Segment::file("file_id:DOC1", Some("a.pdf")));

        assert_eq!(event.send(&chain).await, Some(DeliveryHandle::new("1")));
        assert!(requests_to(&server, "sendPhoto").await.is_empty());
        let doc = json_body(&requests_to(&server, "sendDocument").await[0]);
        assert_eq!(doc["document"], "DOC1");
    }

    #[tokio::test]
    async fn test_edit_not_modified_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/editMessageText"))
            .respond_with(api_error(400, "Bad Request: message is not modified"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        assert!(event.edit(&DeliveryHandle::new("8"), "same", None).await);
        assert!(!event.edit(&DeliveryHandle::new("not-a-number"), "x", None).await);
    }

    #[tokio::test]
    async fn test_react_and_clear() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/setMessageReaction"))
            .respond_with(ok(json!(true)))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        let handle = DeliveryHandle::new("8");
        assert!(event.react(&handle, "👍").await);
        assert!(event.react(&handle, "").await);

        let reqs = requests_to(&server, "setMessageReaction").await;
        assert_eq!(json_body(&reqs[0])["reaction"][0]["emoji"], "👍");
        assert_eq!(json_body(&reqs[1])["reaction"], json!([]));
    }

    #[tokio::test]
    async fn test_delete_failure_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/deleteMessage"))
            .respond_with(api_error(400, "Bad Request: message to delete not found"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100");
        assert!(!event.delete(&DeliveryHandle::new("8")).await);
    }

    #[tokio::test]
    async fn test_streaming_plain_draft_then_formatted_final_edit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botT/sendMessage"))
            .respond_with(ok(json!({ "message_id": 77 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/botT/editMessageText"))
            .respond_with(ok(json!({ "message_id": 77 })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let event = TelegramEvent::new(adapter(&server, 4096, dir.path().into()), "100#5");
        let frags = stream::iter(vec![
            StreamFragment::Chain(MessageChain::plain("Hello")),
            StreamFragment::Chain(MessageChain::plain(" world!")),
        ]);
        event.send_streaming(frags, false).await;

        let draft = json_body(&requests_to(&server, "sendMessage").await[0]);
        assert_eq!(draft["text"], "Hello");
        assert_eq!(draft["message_thread_id"], 5);
        assert!(draft.get("parse_mode").is_none());

        let fin = json_body(&requests_to(&server, "editMessageText").await[0]);
        assert_eq!(fin["message_id"], 77);
        assert_eq!(fin["text"], "Hello world\\!");
        assert_eq!(fin["parse_mode"], "MarkdownV2");
    }
}
