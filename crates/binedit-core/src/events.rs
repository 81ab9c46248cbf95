//! Change notifications.
//!
//! Hosts subscribe to a [`crate::Repository`] with [`crate::Repository::subscribe`] and receive a
//! [`RepositoryEvent`] after every document mutation, save and disposal.

use crate::document::DocumentId;

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentChange {
    /// Bytes were inserted.
    Inserted {
        /// Insertion position.
        position: u64,
        /// Number of inserted bytes.
        length: u64,
    },
    /// Bytes were removed.
    Removed {
        /// Start of the removed range.
        position: u64,
        /// Number of removed bytes.
        length: u64,
    },
    /// Bytes were overwritten in place.
    Overwritten {
        /// Start of the overwritten range.
        position: u64,
        /// Number of overwritten bytes.
        length: u64,
    },
    /// All content was dropped.
    Cleared,
    /// Content was replaced from a reader.
    Loaded,
    /// Content was written back to the origin source.
    Saved,
    /// The document was disposed.
    Disposed,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryEvent {
    /// Affected document.
    pub document: DocumentId,
    /// Kind of change.
    pub change: DocumentChange,
    /// Document length after the change.
    pub length: u64,
}

/// Subscriber callback.
pub type RepositoryCallback = Box<dyn FnMut(&RepositoryEvent) + Send>;
