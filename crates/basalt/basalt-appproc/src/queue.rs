use basalt_msg::Message;
use std::collections::VecDeque;
use tracing::warn;

/// FIFO of messages that arrived while the coordinator was waiting for
/// something else. Replayed in arrival order.
///
/// Unbounded. When a non-zero high-water mark is set, crossing it logs a
/// warning once; the warning re-arms after the backlog falls back below it.
#[derive(Debug, Default)]
pub struct MessageQueue {
    items: VecDeque<Message>,
    high_water: usize,
    above_high_water: bool,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_high_water(high_water: usize) -> Self {
        Self {
            high_water,
            ..Self::default()
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.items.push_back(msg);
        if self.high_water > 0 && self.items.len() >= self.high_water && !self.above_high_water {
            self.above_high_water = true;
            warn!(
                backlog = self.items.len(),
                high_water = self.high_water,
                "deferred message backlog reached high-water mark"
            );
        }
    }

    pub fn peek_next(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<Message> {
        let msg = self.items.pop_front();
        if self.above_high_water && self.items.len() < self.high_water {
            self.above_high_water = false;
        }
        msg
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.above_high_water = false;
    }
}
