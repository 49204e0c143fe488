use std::collections::VecDeque;

use chorus_models::notification::Notification;

pub const DEFAULT_BUFFER_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedNotification {
    pub notification: Notification,
    pub read: bool,
}

/// The most recent notifications, newest first. The server keeps no
/// history, so this is all the client has until its next full refresh.
#[derive(Debug, Clone)]
pub struct NotificationBuffer {
    items: VecDeque<BufferedNotification>,
    capacity: usize,
}

impl NotificationBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert at the front, evicting the oldest entry when full. A repeated
    /// id is ignored.
    pub fn push(&mut self, notification: Notification) -> bool {
        if self
            .items
            .iter()
            .any(|item| item.notification.id == notification.id)
        {
            return false;
        }
        self.items.push_front(BufferedNotification {
            notification,
            read: false,
        });
        self.items.truncate(self.capacity);
        true
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self
            .items
            .iter_mut()
            .find(|item| item.notification.id == id)
        {
            Some(item) if !item.read => {
                item.read = true;
                true
            }
            _ => false,
        }
    }

    /// Returns how many entries flipped to read.
    pub fn mark_all_read(&mut self) -> usize {
        let mut flipped = 0;
        for item in self.items.iter_mut().filter(|item| !item.read) {
            item.read = true;
            flipped += 1;
        }
        flipped
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|item| !item.read).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedNotification> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<BufferedNotification> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for NotificationBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
