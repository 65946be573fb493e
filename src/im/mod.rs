// IM outbound adapter layer
// Turns platform-neutral message chains into Telegram and Feishu API calls.

pub mod adapter;
pub mod feishu;
pub mod markdown;
pub mod media;
pub mod stream;
pub mod telegram;
pub mod types;
pub mod util;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use adapter::MessageEvent;
pub use feishu::{FeishuAdapter, FeishuEvent};
pub use telegram::{TelegramAdapter, TelegramEvent};
pub use types::{
    BinaryRef, BridgeConfig, Button, DeliveryHandle, InlineKeyboard, MessageChain, Segment,
    StreamFragment,
};

use crate::{ulog_debug, ulog_info};

/// Default config location: `~/.imbridge/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".imbridge").join("config.json"))
}

/// Load the bridge config from an explicit path.
pub fn load_config(path: &Path) -> Result<BridgeConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;
    let config: BridgeConfig = serde_json::from_str(&content)
        .map_err(|e| format!("Failed to parse config {}: {}", path.display(), e))?;

    ulog_info!(
        "[im] Config loaded from {} (telegram: {}, feishu: {})",
        path.display(),
        config.telegram.is_some(),
        config.feishu.is_some()
    );
    Ok(config)
}

/// Read `~/.imbridge/config.json`, falling back to defaults when it is missing.
pub fn read_config_from_disk() -> Result<BridgeConfig, String> {
    let path = default_config_path().ok_or("Cannot determine home directory")?;
    if !path.exists() {
        ulog_debug!("[im] No config at {}, using defaults", path.display());
        return Ok(BridgeConfig::default());
    }
    load_config(&path)
}

/// Adapters for every platform present in one bridge config
pub struct Bridge {
    pub telegram: Option<Arc<TelegramAdapter>>,
    pub feishu: Option<Arc<FeishuAdapter>>,
}

impl Bridge {
    /// Apply the config's logging, then build one adapter per configured platform.
    pub fn from_config(config: &BridgeConfig) -> Self {
        if config.init_logging() {
            ulog_info!("[im] Unified log file enabled");
        }
        let bridge = Self {
            telegram: TelegramAdapter::from_bridge(config).map(Arc::new),
            feishu: FeishuAdapter::from_bridge(config).map(Arc::new),
        };
        if bridge.telegram.is_none() && bridge.feishu.is_none() {
            ulog_info!("[im] No platform configured");
        }
        bridge
    }
}
