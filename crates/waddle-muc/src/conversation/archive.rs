//! Conversation metadata persistence seam.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use jid::Jid;
use thiserror::Error;
use uuid::Uuid;

use super::{Conversation, ConversationParticipation};

/// Failure to persist conversation metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArchiveError {
    /// The backing store rejected the write
    #[error("Archive storage error: {0}")]
    Storage(String),

    /// The backing store is not reachable
    #[error("Archive unavailable")]
    Unavailable,
}

/// Persists conversation metadata. Errors are logged by the tracker and
/// never stop the conversation state from advancing.
#[allow(unused_variables)]
pub trait ConversationArchiver: Send + Sync {
    fn conversation_created(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        Ok(())
    }

    /// Message count or last activity changed.
    fn conversation_updated(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        Ok(())
    }

    fn participant_joined(
        &self,
        conversation: &Conversation,
        user: &Jid,
        participation: &ConversationParticipation,
    ) -> Result<(), ArchiveError> {
        Ok(())
    }

    fn participant_left(
        &self,
        conversation: &Conversation,
        user: &Jid,
        participation: &ConversationParticipation,
    ) -> Result<(), ArchiveError> {
        Ok(())
    }

    fn conversation_ended(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        Ok(())
    }
}

/// Archiver that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArchiver;

impl ConversationArchiver for NoopArchiver {}

/// What an [`InMemoryArchiver`] was asked to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveRecord {
    Created(Uuid),
    Updated { id: Uuid, message_count: u64 },
    Joined { id: Uuid, user: Jid },
    Left { id: Uuid, user: Jid },
    Ended(Uuid),
}

/// Archiver that keeps records in memory. Can be switched to failing mode
/// to exercise error paths.
#[derive(Debug, Default)]
pub struct InMemoryArchiver {
    records: Mutex<Vec<ArchiveRecord>>,
    failing: AtomicBool,
}

impl InMemoryArchiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<ArchiveRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ArchiveError::Unavailable);
        }
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

impl ConversationArchiver for InMemoryArchiver {
    fn conversation_created(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        self.store(ArchiveRecord::Created(conversation.id()))
    }

    fn conversation_updated(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        self.store(ArchiveRecord::Updated {
            id: conversation.id(),
            message_count: conversation.message_count(),
        })
    }

    fn participant_joined(
        &self,
        conversation: &Conversation,
        user: &Jid,
        _participation: &ConversationParticipation,
    ) -> Result<(), ArchiveError> {
        self.store(ArchiveRecord::Joined {
            id: conversation.id(),
            user: user.clone(),
        })
    }

    fn participant_left(
        &self,
        conversation: &Conversation,
        user: &Jid,
        _participation: &ConversationParticipation,
    ) -> Result<(), ArchiveError> {
        self.store(ArchiveRecord::Left {
            id: conversation.id(),
            user: user.clone(),
        })
    }

    fn conversation_ended(&self, conversation: &Conversation) -> Result<(), ArchiveError> {
        self.store(ArchiveRecord::Ended(conversation.id()))
    }
}
