//! In-memory gateway implementation.
//!
//! Records sends instead of performing them. Used by the test suite, and as
//! the fallback when no gateway endpoint is configured. Outcomes can be
//! scripted: queued failures are returned one per send before successes
//! resume.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use super::{Gateway, ProviderReference, SendError};

/// A send the gateway accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub recipient: String,
    pub body: String,
}

#[derive(Clone, Default)]
pub struct InMemoryGateway {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    script: Arc<Mutex<VecDeque<SendError>>>,
}

impl InMemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next send. Failures are consumed in order;
    /// once the script runs dry, sends succeed again.
    pub fn push_failure(&self, error: SendError) {
        self.script
            .lock()
            .expect("gateway script lock")
            .push_back(error);
    }

    /// Everything successfully "sent" so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("gateway sent lock").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("gateway sent lock").len()
    }
}

impl Gateway for InMemoryGateway {
    fn send(
        &self,
        recipient: &str,
        body: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReference, SendError>> + Send + 'static>> {
        let sent = Arc::clone(&self.sent);
        let script = Arc::clone(&self.script);
        let recipient = recipient.to_owned();
        let body = body.to_owned();

        Box::pin(async move {
            if let Some(error) = script.lock().expect("gateway script lock").pop_front() {
                return Err(error);
            }

            let mut sent = sent.lock().expect("gateway sent lock");
            sent.push(SentMessage { recipient, body });

            Ok(ProviderReference(format!("mem-{}", sent.len())))
        })
    }
}
