//! Prompt mailbox joining the input reader and whoever is asking.
//!
//! Input lines and prompts meet here: a line offered while someone waits
//! resolves the oldest waiter, otherwise it is buffered for the next
//! [`PromptMailbox::ask`]. At most one of the two queues is non-empty.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct MailboxState {
    waiting: VecDeque<oneshot::Sender<String>>,
    answers: VecDeque<String>,
    closed: bool,
}

/// Two-sided line channel.
#[derive(Debug, Default)]
pub struct PromptMailbox {
    state: Mutex<MailboxState>,
}

impl PromptMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next line, or `None` once the mailbox is closed and drained.
    pub async fn ask(&self) -> Option<String> {
        let rx = {
            let mut state = self.state.lock().ok()?;
            if let Some(answer) = state.answers.pop_front() {
                return Some(answer);
            }
            if state.closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(tx);
            rx
        };
        rx.await.ok()
    }

    /// Hands a line to the oldest live waiter or buffers it.
    pub fn offer(&self, line: impl Into<String>) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state.closed {
            tracing::debug!("input offered to a closed mailbox");
            return;
        }

        let mut line = line.into();
        while let Some(waiter) = state.waiting.pop_front() {
            // A waiter whose future was dropped hands the line back.
            match waiter.send(line) {
                Ok(()) => return,
                Err(returned) => line = returned,
            }
        }
        state.answers.push_back(line);
    }

    /// Input ended. Pending and future asks resolve to `None` once buffered
    /// answers are used up.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.waiting.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffered_answer_is_returned_immediately() {
        let mailbox = PromptMailbox::new();
        mailbox.offer("first");
        mailbox.offer("second");

        assert_eq!(mailbox.ask().await.as_deref(), Some("first"));
        assert_eq!(mailbox.ask().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_waiter_is_resolved_by_offer() {
        let mailbox = Arc::new(PromptMailbox::new());

        let asking = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.ask().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.offer("answer");

        assert_eq!(asking.await.unwrap().as_deref(), Some("answer"));
        assert!(mailbox.state.lock().unwrap().answers.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_waiter_does_not_swallow_line() {
        let mailbox = PromptMailbox::new();

        let abandoned = tokio::time::timeout(Duration::from_millis(10), mailbox.ask()).await;
        assert!(abandoned.is_err());

        mailbox.offer("kept");
        assert_eq!(mailbox.ask().await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_close_resolves_waiters() {
        let mailbox = Arc::new(PromptMailbox::new());

        let asking = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.ask().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mailbox.close();

        assert_eq!(asking.await.unwrap(), None);
        assert_eq!(mailbox.ask().await, None);
        assert!(mailbox.is_closed());
    }

    #[tokio::test]
    async fn test_buffered_lines_survive_close() {
        let mailbox = PromptMailbox::new();
        mailbox.offer("quit");
        mailbox.close();
        mailbox.offer("ignored");

        assert_eq!(mailbox.ask().await.as_deref(), Some("quit"));
        assert_eq!(mailbox.ask().await, None);
    }
}
