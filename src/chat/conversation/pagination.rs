//! 历史分页与滚动锚定
//!
//! 在头部插入更早的消息会让内容变高，视口会“跳”。插入前记录滚动位置和内容高度，
//! 插入并重新布局后把滚动位置加上高度差，整个过程同步完成，中间不允许绘制。

use crate::chat::message::Message;

/// 视图侧的滚动容器
pub trait Viewport {
    fn scroll_offset(&self) -> f64;

    fn content_extent(&self) -> f64;

    /// 消息列表变化后同步重新布局
    fn layout(&mut self, messages: &[Message]);

    fn set_scroll_offset(&mut self, offset: f64);

    fn scroll_to_latest(&mut self);
}

/// 插入前记录的锚点
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    pub prior_offset: f64,
    pub prior_extent: f64,
}

impl ScrollAnchor {
    pub fn new(prior_offset: f64, prior_extent: f64) -> Self {
        Self {
            prior_offset,
            prior_extent,
        }
    }

    pub fn capture<V: Viewport + ?Sized>(viewport: &V) -> Self {
        Self::new(viewport.scroll_offset(), viewport.content_extent())
    }

    /// 插入后的滚动位置：`prior_offset + (new_extent - prior_extent)`
    pub fn restore(&self, new_extent: f64) -> f64 {
        self.prior_offset + (new_extent - self.prior_extent)
    }
}

/// 头部插入消息并保持视口位置
pub(crate) fn apply_anchored<V: Viewport + ?Sized>(
    viewport: &mut V,
    mutate: impl FnOnce() -> Vec<Message>,
) -> f64 {
    let anchor = ScrollAnchor::capture(viewport);
    let messages = mutate();
    viewport.layout(&messages);
    let offset = anchor.restore(viewport.content_extent());
    viewport.set_scroll_offset(offset);
    offset
}

/// 自动滚动到最新消息的判定
///
/// 首次加载，或更新前后最旧一条消息的 ID 没变（说明是追加而不是在头部插入）时才滚动。
#[derive(Debug, Default)]
pub struct AutoScroll {
    oldest_id: Option<String>,
    loaded: bool,
}

impl AutoScroll {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每次消息列表变化时调用，返回是否应滚动到底部
    pub fn on_update(&mut self, messages: &[Message]) -> bool {
        let oldest = messages.first().map(|m| m.id.clone());
        if messages.is_empty() {
            self.oldest_id = None;
            return false;
        }
        let first_load = !self.loaded;
        let appended = self.oldest_id == oldest;
        self.loaded = true;
        self.oldest_id = oldest;
        first_load || appended
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chat::message::Role;

    /// 每条消息固定高度的假视口
    #[derive(Debug, Default)]
    pub(crate) struct FixedRowViewport {
        pub row_height: f64,
        pub offset: f64,
        pub extent: f64,
        pub scrolled_to_latest: usize,
    }

    impl FixedRowViewport {
        pub fn new(row_height: f64) -> Self {
            Self {
                row_height,
                ..Default::default()
            }
        }
    }

    impl Viewport for FixedRowViewport {
        fn scroll_offset(&self) -> f64 {
            self.offset
        }

        fn content_extent(&self) -> f64 {
            self.extent
        }

        fn layout(&mut self, messages: &[Message]) {
            self.extent = messages.len() as f64 * self.row_height;
        }

        fn set_scroll_offset(&mut self, offset: f64) {
            self.offset = offset;
        }

        fn scroll_to_latest(&mut self) {
            self.scrolled_to_latest += 1;
            self.offset = self.extent;
        }
    }

    #[test]
    fn anchor_formula() {
        let anchor = ScrollAnchor::new(500.0, 4000.0);
        assert_eq!(anchor.restore(4600.0), 1100.0);
    }

    #[test]
    fn anchored_prepend_keeps_viewport() {
        let mut viewport = FixedRowViewport::new(100.0);
        let initial: Vec<Message> = (0..40)
            .map(|i| Message::text(i.to_string(), Role::User, "x"))
            .collect();
        viewport.layout(&initial);
        viewport.set_scroll_offset(500.0);

        let offset = apply_anchored(&mut viewport, || {
            let mut all: Vec<Message> = (100..106)
                .map(|i| Message::text(i.to_string(), Role::User, "older"))
                .collect();
            all.extend(initial.clone());
            all
        });
        assert_eq!(offset, 1100.0);
        assert_eq!(viewport.offset, 1100.0);
        assert_eq!(viewport.extent, 4600.0);
    }

    #[test]
    fn auto_scroll_only_for_appends() {
        let mut auto = AutoScroll::new();
        let a = Message::text("a", Role::User, "");
        let b = Message::text("b", Role::User, "");
        let older = Message::text("z", Role::User, "");

        assert!(!auto.on_update(&[]));
        assert!(auto.on_update(&[a.clone()]));
        assert!(auto.on_update(&[a.clone(), b.clone()]));
        assert!(!auto.on_update(&[older, a, b]));
    }
}
