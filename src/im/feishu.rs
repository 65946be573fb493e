// Feishu (Lark) outbound adapter
// Handles tenant_access_token management, image/file uploads, post and card
// rendering, message send/reply/edit/delete, reactions and streaming.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::adapter::MessageEvent;
use super::media::{MediaResolver, ResolvedMedia, UploadCache};
use super::stream::{run_buffered, run_stream, DraftSink, StreamPolicy};
use super::types::{
    BinaryRef, BridgeConfig, Button, DeliveryHandle, FeishuConfig, FeishuError, InlineKeyboard,
    MessageChain, Segment, StreamFragment,
};
use super::util::{char_len, file_ext, split_message};
use crate::proxy_config::{self, ProxySettings};
use crate::{ulog_debug, ulog_info, ulog_warn};

/// HTTP timeout for Open API calls (uploads included)
const REQUEST_TIMEOUT_SECS: u64 = 60;
/// Token refresh margin (refresh when < 10 min remaining)
const TOKEN_REFRESH_MARGIN_SECS: u64 = 600;
/// Token validity period (Feishu tokens are valid for 2 hours)
const TOKEN_VALIDITY_SECS: u64 = 7200;
/// Codes meaning the tenant token is invalid or expired
const TOKEN_INVALID_CODES: [i64; 2] = [99991661, 99991663];
/// Codes meaning the message content itself was rejected
const INVALID_CONTENT_CODES: [i64; 3] = [230001, 230025, 230099];
/// Max messages with tracked reactions before forced cleanup
const REACTION_TRACK_MAX_SIZE: usize = 5000;
/// Reaction ids older than this are no longer tracked
const REACTION_TRACK_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cached tenant access token
struct TokenCache {
    access_token: String,
    expires_at: Instant,
}

/// Reaction ids this adapter added to one message
struct TrackedReactions {
    added_at: Instant,
    ids: Vec<String>,
}

/// Keep the reaction map bounded: drop expired entries, then the oldest.
fn prune_reactions(map: &mut HashMap<String, TrackedReactions>, now: Instant, max_size: usize) {
    if map.len() <= max_size {
        return;
    }
    map.retain(|_, t| now.duration_since(t.added_at) < REACTION_TRACK_TTL);
    while map.len() > max_size {
        let oldest = map
            .iter()
            .min_by_key(|(_, t)| t.added_at)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                map.remove(&id);
            }
            None => break,
        }
    }
}

/// Map a file extension to Feishu's upload `file_type`
fn resolve_file_type(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => "pdf",
        "doc" | "docx" => "doc",
        "xls" | "xlsx" => "xls",
        "ppt" | "pptx" => "ppt",
        "opus" | "ogg" => "opus",
        "mp4" => "mp4",
        _ => "stream",
    }
}

fn api_error(code: i64, msg: String) -> FeishuError {
    if INVALID_CONTENT_CODES.contains(&code) {
        FeishuError::InvalidContent(msg)
    } else {
        FeishuError::Api { code, msg }
    }
}

fn media_error(e: impl std::fmt::Display) -> FeishuError {
    FeishuError::Other(format!("media: {}", e))
}

// ── Rendering ─────────────────────────────────────────────────

/// Ordered inline content of a chain (files and voice travel separately)
#[derive(Debug, Clone, PartialEq)]
enum Inline {
    Text(String),
    Mention { user_id: String, name: Option<String> },
    /// Uploaded image_key
    Image(String),
}

/// Platform payload for the primary message
#[derive(Debug, Clone, PartialEq)]
enum RenderedPayload {
    Post(Value),
    Card(Value),
}

impl RenderedPayload {
    fn msg_type(&self) -> &'static str {
        match self {
            RenderedPayload::Post(_) => "post",
            RenderedPayload::Card(_) => "interactive",
        }
    }

    /// `content` field: the payload serialized as a JSON string
    fn content(&self) -> String {
        match self {
            RenderedPayload::Post(v) | RenderedPayload::Card(v) => v.to_string(),
        }
    }
}

fn mention_tag(user_id: &str, name: Option<&str>) -> Value {
    let mut tag = json!({ "tag": "at", "user_id": user_id, "style": [] });
    if let Some(n) = name.filter(|n| !n.is_empty()) {
        tag["user_name"] = json!(n);
    }
    tag
}

/// Post content groups. Text and mentions share a group; each image gets its own.
/// `text_tag` is "md" for rich rendering, "text" for the plain fallback.
fn post_groups(inlines: &[Inline], text_tag: &str) -> Vec<Vec<Value>> {
    let mut groups: Vec<Vec<Value>> = Vec::new();
    let mut stage: Vec<Value> = Vec::new();

    for inline in inlines {
        match inline {
            Inline::Text(t) if t.is_empty() => {}
            Inline::Text(t) => stage.push(json!({ "tag": text_tag, "text": t })),
            Inline::Mention { user_id, name } => stage.push(mention_tag(user_id, name.as_deref())),
            Inline::Image(key) => {
                if !stage.is_empty() {
                    groups.push(std::mem::take(&mut stage));
                }
                groups.push(vec![json!({ "tag": "img", "image_key": key })]);
            }
        }
    }
    if !stage.is_empty() {
        groups.push(stage);
    }

    // Never submit an empty post
    if groups.is_empty() {
        groups.push(vec![json!({ "tag": text_tag, "text": " " })]);
    }
    groups
}

fn wrap_post(groups: Vec<Vec<Value>>) -> Value {
    json!({
        "zh_cn": {
            "title": "",
            "content": groups
        }
    })
}

fn render_post(inlines: &[Inline]) -> Value {
    wrap_post(post_groups(inlines, "md"))
}

fn render_plain_post(inlines: &[Inline]) -> Value {
    wrap_post(post_groups(inlines, "text"))
}

fn render_button(button: &Button) -> Value {
    match button {
        Button::Callback { label, token } => json!({
            "tag": "button",
            "text": { "tag": "plain_text", "content": label },
            "type": "primary",
            "value": { "key": "callback", "value": token }
        }),
        Button::Url { label, url } => json!({
            "tag": "button",
            "text": { "tag": "plain_text", "content": label },
            "type": "default",
            "url": url
        }),
    }
}

/// Interactive card: text → mentions → images → buttons (row-major)
fn render_card(inlines: &[Inline], keyboard: &InlineKeyboard) -> Value {
    let mut elements: Vec<Value> = Vec::new();

    let text: String = inlines
        .iter()
        .filter_map(|i| match i {
            Inline::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    if !text.trim().is_empty() {
        elements.push(json!({ "tag": "markdown", "content": text }));
    }

    // Cards have no native mention element; show display names
    let mentions: Vec<String> = inlines
        .iter()
        .filter_map(|i| match i {
            Inline::Mention { user_id, name } => Some(Segment::mention_display(user_id, name.as_deref())),
            _ => None,
        })
        .collect();
    if !mentions.is_empty() {
        elements.push(json!({
            "tag": "div",
            "text": { "tag": "plain_text", "content": mentions.join(" ") }
        }));
    }

    for inline in inlines {
        if let Inline::Image(key) = inline {
            elements.push(json!({
                "tag": "img",
                "img_key": key,
                "alt": { "tag": "plain_text", "content": "" }
            }));
        }
    }

    for button in keyboard.buttons() {
        elements.push(json!({ "tag": "action", "actions": [render_button(button)] }));
    }

    if elements.is_empty() {
        elements.push(json!({
            "tag": "div",
            "text": { "tag": "plain_text", "content": " " }
        }));
    }

    json!({
        "config": { "wide_screen_mode": true },
        "elements": elements
    })
}

/// A card whenever a keyboard with buttons is present, a post otherwise
fn render_payload(inlines: &[Inline], keyboard: Option<&InlineKeyboard>) -> RenderedPayload {
    match keyboard.filter(|kb| !kb.is_empty()) {
        Some(kb) => RenderedPayload::Card(render_card(inlines, kb)),
        None => RenderedPayload::Post(render_post(inlines)),
    }
}

/// Move text beyond `max_len` into leading text-only chunks. The remainder keeps
/// mentions, the last text chunk and images, in that order.
fn split_oversized(inlines: Vec<Inline>, max_len: usize) -> (Vec<String>, Vec<Inline>) {
    let text: String = inlines
        .iter()
        .filter_map(|i| match i {
            Inline::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    if char_len(&text) <= max_len {
        return (Vec::new(), inlines);
    }

    let mut chunks = split_message(&text, max_len);
    let last = chunks.pop().unwrap_or_default();
    let (mut rest, images): (Vec<Inline>, Vec<Inline>) = inlines
        .into_iter()
        .filter(|i| !matches!(i, Inline::Text(_)))
        .partition(|i| matches!(i, Inline::Mention { .. }));
    rest.push(Inline::Text(last));
    rest.extend(images);
    (chunks, rest)
}

// ── Adapter ───────────────────────────────────────────────────

/// Feishu Open API client (shared by all events of one app)
pub struct FeishuAdapter {
    app_id: String,
    app_secret: String,
    api_base: String,
    client: Client,
    media: MediaResolver,
    token_cache: Arc<RwLock<Option<TokenCache>>>,
    /// Serializes token refresh to prevent concurrent refreshes
    token_refresh_lock: Arc<Mutex<()>>,
    /// message_id → reaction ids this adapter added
    reactions: Arc<Mutex<HashMap<String, TrackedReactions>>>,
    policy: StreamPolicy,
    stream_edit: bool,
}

impl FeishuAdapter {
    pub fn new(config: &FeishuConfig, proxy: Option<&ProxySettings>, temp_dir: PathBuf) -> Self {
        let client_builder = Client::builder().timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));
        let client = proxy_config::build_client_with_proxy(client_builder, proxy)
            .unwrap_or_else(|e| {
                ulog_warn!("[feishu] Failed to build client with proxy: {}, falling back to direct", e);
                Client::new()
            });

        Self {
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            media: MediaResolver::new(client.clone(), temp_dir),
            client,
            token_cache: Arc::new(RwLock::new(None)),
            token_refresh_lock: Arc::new(Mutex::new(())),
            reactions: Arc::new(Mutex::new(HashMap::new())),
            policy: StreamPolicy::from(&config.stream),
            stream_edit: config.stream_edit,
        }
    }

    /// Build from the bridge config (proxy and temp dir applied).
    /// `None` when no feishu section is configured.
    pub fn from_bridge(config: &BridgeConfig) -> Option<Self> {
        let feishu = config.feishu.as_ref()?;
        Some(Self::new(
            feishu,
            config.proxy_settings.as_ref(),
            config.resolved_temp_dir(),
        ))
    }

    pub fn stream_policy(&self) -> &StreamPolicy {
        &self.policy
    }

    // ===== Token management =====

    async fn cached_token(&self) -> Option<String> {
        let cache = self.token_cache.read().await;
        cache
            .as_ref()
            .filter(|tc| Instant::now() < tc.expires_at)
            .map(|tc| tc.access_token.clone())
    }

    /// Get a valid tenant access token, refreshing if expired.
    async fn get_token(&self) -> Result<String, FeishuError> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }
        self.refresh_token().await
    }

    /// Request a new tenant_access_token. Serialized so concurrent callers share one refresh.
    async fn refresh_token(&self) -> Result<String, FeishuError> {
        let _guard = self.token_refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.api_base);
        let body = json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FeishuError::Network(format!("Token request failed: {}", e)))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(FeishuError::Network(format!("Token request HTTP {}: {}", status, text)));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| FeishuError::Other(format!("Token response parse error: {}", e)))?;

        let code = json["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            ulog_warn!(
                "[feishu] Token request rejected, code {}: {}",
                code,
                json["msg"].as_str().unwrap_or("unknown")
            );
            return Err(FeishuError::TokenUnauthorized);
        }

        let token = json["tenant_access_token"]
            .as_str()
            .ok_or_else(|| FeishuError::Other("No tenant_access_token in response".into()))?
            .to_string();

        let expire = json["expire"].as_u64().unwrap_or(TOKEN_VALIDITY_SECS);
        let expires_at = Instant::now() + Duration::from_secs(expire.saturating_sub(TOKEN_REFRESH_MARGIN_SECS));

        *self.token_cache.write().await = Some(TokenCache {
            access_token: token.clone(),
            expires_at,
        });

        ulog_info!("[feishu] Token refreshed, expires in {}s", expire);
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token_cache.write().await = None;
    }

    /// Issue an authenticated request built by `build`, re-issuing it once after a
    /// token refresh on 401 or a token-invalid code.
    async fn authed_call<F>(&self, build: F) -> Result<Value, FeishuError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut refreshed = false;

        loop {
            let token = self.get_token().await?;
            let resp = build(&token)
                .send()
                .await
                .map_err(|e| FeishuError::Network(e.to_string()))?;

            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();

            if status.as_u16() == 401 && !refreshed {
                ulog_warn!("[feishu] Got 401, refreshing token and retrying");
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }

            let json: Value = serde_json::from_str(&text).map_err(|e| {
                FeishuError::Other(format!("API response parse error (HTTP {}): {}", status, e))
            })?;

            let code = json["code"].as_i64().unwrap_or(-1);
            if code == 0 {
                return Ok(json);
            }

            if TOKEN_INVALID_CODES.contains(&code) && !refreshed {
                ulog_warn!("[feishu] Token invalid (code {}), refreshing", code);
                self.invalidate_token().await;
                refreshed = true;
                continue;
            }

            if status.as_u16() == 401 {
                return Err(FeishuError::TokenUnauthorized);
            }
            return Err(api_error(code, json["msg"].as_str().unwrap_or("unknown").to_string()));
        }
    }

    /// JSON API call
    async fn api_call(&self, method: &str, url: &str, body: Option<&Value>) -> Result<Value, FeishuError> {
        self.authed_call(|token| {
            let mut req = match method {
                "GET" => self.client.get(url),
                "PUT" => self.client.put(url),
                "DELETE" => self.client.delete(url),
                "PATCH" => self.client.patch(url),
                _ => self.client.post(url),
            };
            req = req.bearer_auth(token);
            if let Some(b) = body {
                req = req.json(b);
            }
            req
        })
        .await
    }

    // ===== Uploads =====

    /// Upload an image and return its `image_key`.
    async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> Result<String, FeishuError> {
        let url = format!("{}/im/v1/images", self.api_base);
        let resp = self
            .authed_call(|token| {
                let part = Part::bytes(bytes.clone()).file_name(file_name.to_string());
                let form = Form::new().text("image_type", "message").part("image", part);
                self.client.post(&url).bearer_auth(token).multipart(form)
            })
            .await?;
        resp.pointer("/data/image_key")
            .and_then(|k| k.as_str())
            .map(String::from)
            .ok_or_else(|| FeishuError::Other("Missing image_key in upload response".into()))
    }

    /// Upload a file and return its `file_key`.
    async fn upload_file(&self, bytes: Vec<u8>, file_name: &str, file_type: &str) -> Result<String, FeishuError> {
        let url = format!("{}/im/v1/files", self.api_base);
        let resp = self
            .authed_call(|token| {
                let part = Part::bytes(bytes.clone()).file_name(file_name.to_string());
                let form = Form::new()
                    .text("file_type", file_type.to_string())
                    .text("file_name", file_name.to_string())
                    .part("file", part);
                self.client.post(&url).bearer_auth(token).multipart(form)
            })
            .await?;
        resp.pointer("/data/file_key")
            .and_then(|k| k.as_str())
            .map(String::from)
            .ok_or_else(|| FeishuError::Other("Missing file_key in upload response".into()))
    }

    /// Resolve an image reference to an image_key, uploading at most once per send.
    async fn image_key(&self, source: &BinaryRef, cache: &mut UploadCache) -> Result<String, FeishuError> {
        if let Some(key) = cache.get("image", source) {
            return Ok(key.to_string());
        }
        let key = match self.media.resolve(source, None, "jpg").await.map_err(media_error)? {
            ResolvedMedia::Handle(key) => key,
            ResolvedMedia::Local(local) => {
                let bytes = local.read().await.map_err(media_error)?;
                self.upload_image(bytes, local.file_name()).await?
            }
        };
        cache.insert("image", source, key.clone());
        Ok(key)
    }

    /// Resolve a file/voice reference to a file_key. `forced_type` overrides the
    /// extension-derived file_type (voice is always opus).
    async fn file_key(
        &self,
        source: &BinaryRef,
        name: Option<&str>,
        forced_type: Option<&str>,
        cache: &mut UploadCache,
    ) -> Result<String, FeishuError> {
        // A voice key must have been uploaded as opus
        let scope = if forced_type.is_some() { "audio" } else { "file" };
        if let Some(key) = cache.get(scope, source) {
            return Ok(key.to_string());
        }
        let default_ext = if forced_type.is_some() { "opus" } else { "bin" };
        let key = match self.media.resolve(source, name, default_ext).await.map_err(media_error)? {
            ResolvedMedia::Handle(key) => key,
            ResolvedMedia::Local(local) => {
                let bytes = local.read().await.map_err(media_error)?;
                let file_type = forced_type.unwrap_or_else(|| {
                    resolve_file_type(&file_ext(local.file_name()).unwrap_or_default())
                });
                self.upload_file(bytes, local.file_name(), file_type).await?
            }
        };
        cache.insert(scope, source, key.clone());
        Ok(key)
    }

    // ===== Message operations =====

    /// Send a message, as a reply when `reply_to` is set. Returns the message_id.
    pub async fn send_message(
        &self,
        chat_id: &str,
        reply_to: Option<&str>,
        msg_type: &str,
        content: String,
    ) -> Result<String, FeishuError> {
        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let (url, body) = match reply_to {
            Some(message_id) => (
                format!("{}/im/v1/messages/{}/reply", self.api_base, message_id),
                json!({
                    "msg_type": msg_type,
                    "content": content,
                    "uuid": idempotency_key,
                    "reply_in_thread": false,
                }),
            ),
            None => (
                format!("{}/im/v1/messages?receive_id_type=chat_id", self.api_base),
                json!({
                    "receive_id": chat_id,
                    "msg_type": msg_type,
                    "content": content,
                    "uuid": idempotency_key,
                }),
            ),
        };

        let resp = self.api_call("POST", &url, Some(&body)).await?;
        resp["data"]["message_id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| FeishuError::Other("No message_id in response".into()))
    }

    /// Replace a post's content. Uses PUT (PATCH is for message cards only).
    pub async fn update_post(&self, message_id: &str, post: &Value) -> Result<(), FeishuError> {
        let url = format!("{}/im/v1/messages/{}", self.api_base, message_id);
        let body = json!({
            "msg_type": "post",
            "content": post.to_string(),
        });
        self.api_call("PUT", &url, Some(&body)).await?;
        Ok(())
    }

    /// Replace a card's content.
    pub async fn patch_card(&self, message_id: &str, card: &Value) -> Result<(), FeishuError> {
        let url = format!("{}/im/v1/messages/{}", self.api_base, message_id);
        let body = json!({ "content": card.to_string() });
        self.api_call("PATCH", &url, Some(&body)).await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), FeishuError> {
        let url = format!("{}/im/v1/messages/{}", self.api_base, message_id);
        self.api_call("DELETE", &url, None).await?;
        self.reactions.lock().await.remove(message_id);
        Ok(())
    }

    /// Add a reaction and remember its id for a later clear.
    pub async fn add_reaction(&self, message_id: &str, emoji_type: &str) -> Result<(), FeishuError> {
        let url = format!("{}/im/v1/messages/{}/reactions", self.api_base, message_id);
        let body = json!({ "reaction_type": { "emoji_type": emoji_type } });
        let resp = self.api_call("POST", &url, Some(&body)).await?;
        if let Some(reaction_id) = resp.pointer("/data/reaction_id").and_then(|v| v.as_str()) {
            let now = Instant::now();
            let mut reactions = self.reactions.lock().await;
            reactions
                .entry(message_id.to_string())
                .or_insert_with(|| TrackedReactions { added_at: now, ids: Vec::new() })
                .ids
                .push(reaction_id.to_string());
            prune_reactions(&mut reactions, now, REACTION_TRACK_MAX_SIZE);
        }
        Ok(())
    }

    /// Remove every reaction this adapter added to the message.
    pub async fn clear_reactions(&self, message_id: &str) -> Result<(), FeishuError> {
        let ids = self
            .reactions
            .lock()
            .await
            .remove(message_id)
            .map(|t| t.ids)
            .unwrap_or_default();
        let mut first_error = None;
        for reaction_id in ids {
            let url = format!(
                "{}/im/v1/messages/{}/reactions/{}",
                self.api_base, message_id, reaction_id
            );
            if let Err(e) = self.api_call("DELETE", &url, None).await {
                ulog_warn!("[feishu] Failed to delete reaction {}: {}", reaction_id, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Buckets of one chain. Images are already uploaded.
#[derive(Debug, Default)]
struct Classified<'a> {
    inlines: Vec<Inline>,
    /// File and Voice segments, delivered as follow-up messages
    attachments: Vec<&'a Segment>,
    /// Last non-empty keyboard wins
    keyboard: Option<&'a InlineKeyboard>,
    reply_to: Option<&'a str>,
}

/// Outbound event bound to one Feishu chat, optionally replying to a message
pub struct FeishuEvent {
    adapter: Arc<FeishuAdapter>,
    chat_id: String,
    reply_to: Option<String>,
}

impl FeishuEvent {
    pub fn new(adapter: Arc<FeishuAdapter>, chat_id: impl Into<String>) -> Self {
        Self { adapter, chat_id: chat_id.into(), reply_to: None }
    }

    /// Reply to the originating message instead of posting to the chat
    pub fn with_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    async fn classify<'a>(&self, chain: &'a MessageChain) -> Classified<'a> {
        let mut out = Classified::default();
        let mut images = UploadCache::new();

        for segment in &chain.segments {
            match segment {
                Segment::Text(t) => out.inlines.push(Inline::Text(t.clone())),
                Segment::Mention { user_id, name } => out.inlines.push(Inline::Mention {
                    user_id: user_id.clone(),
                    name: name.clone(),
                }),
                Segment::Image { source, caption } => {
                    match self.adapter.image_key(source, &mut images).await {
                        Ok(key) => out.inlines.push(Inline::Image(key)),
                        Err(e) => {
                            ulog_warn!("[feishu] Image upload failed ({}), skipping: {}", source.describe(), e);
                        }
                    }
                    if let Some(c) = caption {
                        out.inlines.push(Inline::Text(c.clone()));
                    }
                }
                Segment::File { .. } | Segment::Voice { .. } => out.attachments.push(segment),
                Segment::Keyboard(kb) if !kb.is_empty() => out.keyboard = Some(kb),
                Segment::Keyboard(_) => {}
                Segment::Reply { message_id } => out.reply_to = Some(message_id.as_str()),
                Segment::Unsupported { kind } => {
                    ulog_warn!("[feishu] Unsupported segment type dropped: {}", kind);
                }
            }
        }
        out
    }

    /// Send the primary payload; on a render failure retry once as a plain post.
    async fn send_primary(
        &self,
        reply_to: Option<&str>,
        payload: &RenderedPayload,
        inlines: &[Inline],
    ) -> Option<String> {
        let result = self
            .adapter
            .send_message(&self.chat_id, reply_to, payload.msg_type(), payload.content())
            .await;
        match result {
            Ok(id) => Some(id),
            Err(e) if e.is_render_failure() => {
                ulog_debug!("[feishu] {} rejected ({}), retrying as plain post", payload.msg_type(), e);
                let plain = render_plain_post(inlines);
                match self
                    .adapter
                    .send_message(&self.chat_id, reply_to, "post", plain.to_string())
                    .await
                {
                    Ok(id) => Some(id),
                    Err(e) => {
                        ulog_warn!("[feishu] Plain post fallback failed: {}", e);
                        None
                    }
                }
            }
            Err(e) => {
                ulog_warn!("[feishu] Send {} to {} failed: {}", payload.msg_type(), self.chat_id, e);
                None
            }
        }
    }

    /// Upload and send one File/Voice segment as its own message
    async fn send_attachment(
        &self,
        reply_to: Option<&str>,
        segment: &Segment,
        cache: &mut UploadCache,
    ) -> Result<String, FeishuError> {
        let (source, name, caption, msg_type, forced_type) = match segment {
            Segment::File { source, name, caption } => {
                (source, name.as_deref(), caption.as_deref(), "file", None)
            }
            Segment::Voice { source } => (source, None, None, "audio", Some("opus")),
            other => return Err(FeishuError::Other(format!("not an attachment: {}", other.kind()))),
        };

        let file_key = self.adapter.file_key(source, name, forced_type, cache).await?;
        let content = json!({ "file_key": file_key }).to_string();
        let message_id = self
            .adapter
            .send_message(&self.chat_id, reply_to, msg_type, content)
            .await?;

        if let Some(c) = caption.filter(|c| !c.trim().is_empty()) {
            let post = render_post(&[Inline::Text(c.to_string())]);
            if let Err(e) = self
                .adapter
                .send_message(&self.chat_id, reply_to, "post", post.to_string())
                .await
            {
                ulog_warn!("[feishu] File caption failed: {}", e);
            }
        }
        Ok(message_id)
    }

    /// Rich post edit with a plain fallback
    async fn edit_post(&self, message_id: &str, text: &str) -> Result<(), FeishuError> {
        let inlines = [Inline::Text(text.to_string())];
        match self.adapter.update_post(message_id, &render_post(&inlines)).await {
            Err(e) if e.is_render_failure() => {
                ulog_debug!("[feishu] Post edit rejected ({}), retrying as plain text", e);
                self.adapter.update_post(message_id, &render_plain_post(&inlines)).await
            }
            other => other,
        }
    }
}

impl MessageEvent for FeishuEvent {
    async fn send(&self, chain: &MessageChain) -> Option<DeliveryHandle> {
        let classified = self.classify(chain).await;
        let reply_to = classified.reply_to.or(self.reply_to.as_deref());
        let keyboard = classified.keyboard;

        let mut primary: Option<String> = None;
        let has_content = keyboard.is_some()
            || classified
                .inlines
                .iter()
                .any(|i| !matches!(i, Inline::Text(t) if t.trim().is_empty()));

        if has_content {
            let (leading, inlines) = split_oversized(classified.inlines, self.adapter.policy.max_message_len);
            for chunk in leading {
                let chunk_inlines = [Inline::Text(chunk)];
                let payload = RenderedPayload::Post(render_post(&chunk_inlines));
                if let Some(id) = self.send_primary(reply_to, &payload, &chunk_inlines).await {
                    primary = Some(id);
                }
            }
            let payload = render_payload(&inlines, keyboard);
            if let Some(id) = self.send_primary(reply_to, &payload, &inlines).await {
                primary = Some(id);
            }
        }

        // Files cannot be embedded in posts or cards
        let mut files = UploadCache::new();
        for segment in &classified.attachments {
            match self.send_attachment(reply_to, segment, &mut files).await {
                Ok(id) => {
                    if primary.is_none() {
                        primary = Some(id);
                    }
                }
                Err(e) => {
                    ulog_warn!("[feishu] {} delivery failed, skipping: {}", segment.kind(), e);
                }
            }
        }

        if !has_content && classified.attachments.is_empty() {
            ulog_debug!("[feishu] Nothing renderable in chain, nothing sent to {}", self.chat_id);
        }
        primary.map(DeliveryHandle::new)
    }

    async fn edit(&self, handle: &DeliveryHandle, text: &str, keyboard: Option<&InlineKeyboard>) -> bool {
        // Feishu cannot switch a message between post and card in one update;
        // a keyboard always means the card path
        let result = match keyboard.filter(|kb| !kb.is_empty()) {
            Some(kb) => {
                let card = render_card(&[Inline::Text(text.to_string())], kb);
                self.adapter.patch_card(handle.as_str(), &card).await
            }
            None => self.edit_post(handle.as_str(), text).await,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[feishu] Edit {} failed: {}", handle, e);
                false
            }
        }
    }

    async fn delete(&self, handle: &DeliveryHandle) -> bool {
        match self.adapter.delete_message(handle.as_str()).await {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[feishu] Delete {} failed: {}", handle, e);
                false
            }
        }
    }

    async fn react(&self, handle: &DeliveryHandle, token: &str) -> bool {
        let result = if token.is_empty() {
            self.adapter.clear_reactions(handle.as_str()).await
        } else {
            self.adapter.add_reaction(handle.as_str(), token).await
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[feishu] Reaction on {} failed: {}", handle, e);
                false
            }
        }
    }

    async fn send_streaming<F>(&self, fragments: F, use_fallback: bool)
    where
        F: Stream<Item = StreamFragment> + Unpin + Send,
    {
        if use_fallback || !self.adapter.stream_edit {
            run_buffered(self, fragments).await;
        } else {
            let policy = self.adapter.policy.clone();
            run_stream(self, fragments, &policy).await;
        }
    }
}

impl DraftSink for FeishuEvent {
    async fn send_draft(&self, text: &str) -> Option<DeliveryHandle> {
        let post = render_plain_post(&[Inline::Text(text.to_string())]);
        match self
            .adapter
            .send_message(&self.chat_id, self.reply_to.as_deref(), "post", post.to_string())
            .await
        {
            Ok(id) => Some(DeliveryHandle::new(id)),
            Err(e) => {
                ulog_warn!("[feishu] Draft send failed (streaming): {}", e);
                None
            }
        }
    }

    async fn edit_draft(&self, handle: &DeliveryHandle, text: &str) -> bool {
        let post = render_plain_post(&[Inline::Text(text.to_string())]);
        match self.adapter.update_post(handle.as_str(), &post).await {
            Ok(()) => true,
            Err(e) => {
                ulog_warn!("[feishu] Draft edit failed (streaming): {}", e);
                false
            }
        }
    }

    async fn finalize_draft(&self, handle: &DeliveryHandle, text: &str) -> bool {
        self.edit(handle, text, None).await
    }

    async fn send_final(&self, text: &str) -> Option<DeliveryHandle> {
        let inlines = [Inline::Text(text.to_string())];
        let payload = RenderedPayload::Post(render_post(&inlines));
        self.send_primary(self.reply_to.as_deref(), &payload, &inlines)
            .await
            .map(DeliveryHandle::new)
    }

    async fn send_chain(&self, chain: &MessageChain) {
        self.send(chain).await;
    }
}
