//! Recording sender for tests and local runs without SMTP

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Email, EmailSender, MailError};

/// Keeps every message it is asked to send
#[derive(Debug, Clone, Default)]
pub struct MemorySender {
    sent: Arc<Mutex<Vec<Email>>>,
    failures: Arc<AtomicUsize>,
}

impl MemorySender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends with a transport error
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EmailSender for MemorySender {
    async fn send_email(&self, email: &Email) -> Result<(), MailError> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(MailError::Send("connection refused".to_string()));
        }

        tracing::debug!(subject = %email.subject, to = ?email.to, "Recorded outgoing email");
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(())
    }
}
