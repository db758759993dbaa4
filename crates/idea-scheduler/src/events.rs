//! Job lifecycle events sent by compute nodes (job started, host details, job finished).
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::common::WrappedArcMutex;
use crate::job::Job;

/// Raw message received from an event source.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Handle used to acknowledge (delete) the message.
    pub receipt: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum JobLifecycleEvent {
    JobStarted { job: Job },
    JobStatusUpdate { job: Job },
    JobFinished { job: Job },
}

impl JobLifecycleEvent {
    pub fn decode(body: &str) -> crate::Result<Self> {
        serde_json::from_str(body).map_err(|e| {
            crate::Error::DeserializationError(format!("Invalid job lifecycle event: {e}"))
        })
    }

    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn job(&self) -> &Job {
        match self {
            JobLifecycleEvent::JobStarted { job }
            | JobLifecycleEvent::JobStatusUpdate { job }
            | JobLifecycleEvent::JobFinished { job } => job,
        }
    }
}

pub trait JobEventSource: Send + Sync {
    /// Waits up to `wait` for messages, returns at most `max_messages` of them.
    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> BoxFuture<'_, anyhow::Result<Vec<EventMessage>>>;

    /// Acknowledges processed messages.
    fn delete(&self, receipts: Vec<String>) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Sending half of a [`ChannelEventSource`].
#[derive(Clone)]
pub struct EventSender {
    sender: UnboundedSender<EventMessage>,
    counter: WrappedArcMutex<u64>,
}

impl EventSender {
    pub fn send_raw(&self, body: String) -> bool {
        let receipt = {
            let mut counter = self.counter.get_mut();
            *counter += 1;
            format!("receipt-{counter}")
        };
        self.sender.send(EventMessage { receipt, body }).is_ok()
    }

    pub fn send(&self, event: &JobLifecycleEvent) -> crate::Result<bool> {
        Ok(self.send_raw(event.encode()?))
    }
}

/// In-process event source backed by a tokio channel.
pub struct ChannelEventSource {
    receiver: tokio::sync::Mutex<UnboundedReceiver<EventMessage>>,
    acknowledged: WrappedArcMutex<Vec<String>>,
}

impl ChannelEventSource {
    pub fn new() -> (Self, EventSender) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                receiver: tokio::sync::Mutex::new(receiver),
                acknowledged: Default::default(),
            },
            EventSender {
                sender,
                counter: Default::default(),
            },
        )
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.acknowledged.get_mut().clone()
    }
}

impl JobEventSource for ChannelEventSource {
    fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> BoxFuture<'_, anyhow::Result<Vec<EventMessage>>> {
        Box::pin(async move {
            let mut receiver = self.receiver.lock().await;
            let mut messages = vec![];
            match tokio::time::timeout(wait, receiver.recv()).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) | Err(_) => return Ok(messages),
            }
            while messages.len() < max_messages {
                match receiver.try_recv() {
                    Ok(message) => messages.push(message),
                    Err(_) => break,
                }
            }
            Ok(messages)
        })
    }

    fn delete(&self, receipts: Vec<String>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.acknowledged.get_mut().extend(receipts);
            Ok(())
        })
    }
}
