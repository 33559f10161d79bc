use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::lock;

/// Thread-safe text queue. Any thread may push; the session thread drains
/// the whole queue once per tick.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    queue: Arc<Mutex<VecDeque<String>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, text: impl Into<String>) {
        lock(&self.queue).push_back(text.into());
    }

    /// Takes every queued entry in push order, leaving the queue empty.
    pub fn drain(&self) -> Vec<String> {
        lock(&self.queue).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_takes_everything_in_order() {
        let notifier = Notifier::new();
        let other = notifier.clone();
        notifier.push("one");
        other.push(String::from("two"));

        assert_eq!(notifier.len(), 2);
        assert_eq!(notifier.drain(), vec!["one", "two"]);
        assert!(other.is_empty());
    }

    #[test]
    fn pushes_from_other_threads() {
        let notifier = Notifier::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let notifier = notifier.clone();
                std::thread::spawn(move || notifier.push(format!("from {i}")))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(notifier.drain().len(), 4);
    }
}
