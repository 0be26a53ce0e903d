//! 每个角色的输入草稿（仅内存，切换会话时保留，不跨重启）

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct DraftCache {
    drafts: Mutex<HashMap<String, String>>,
}

impl DraftCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, character_id: &str) -> String {
        self.drafts
            .lock()
            .ok()
            .and_then(|d| d.get(character_id).cloned())
            .unwrap_or_default()
    }

    /// 空草稿直接移除
    pub fn set(&self, character_id: &str, text: &str) {
        if let Ok(mut drafts) = self.drafts.lock() {
            if text.is_empty() {
                drafts.remove(character_id);
            } else {
                drafts.insert(character_id.to_string(), text.to_string());
            }
        }
    }

    pub fn clear(&self, character_id: &str) {
        self.set(character_id, "");
    }
}
