// imbridge: outbound IM adapters for Telegram and Feishu/Lark
// Renders platform-neutral message chains, uploads attachments and streams replies.

pub mod im;
pub mod logger;
pub mod proxy_config;
