//! Host and service comments

use crate::broker::{Broker, BrokerEvent};
use crate::clock::Timestamp;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Where a comment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommentEntryType {
    User,
    Downtime,
    Acknowledgement,
}

/// A comment attached to a host or service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub host_name: String,
    pub service_description: Option<String>,
    pub entry_type: CommentEntryType,
    pub entry_time: Timestamp,
    pub author: String,
    pub text: String,
    pub persistent: bool,
    /// Expiry time, if any
    pub expires: Option<Timestamp>,
}

impl Comment {
    pub fn new(
        host_name: impl Into<String>,
        service_description: Option<String>,
        entry_type: CommentEntryType,
        author: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            host_name: host_name.into(),
            service_description,
            entry_type,
            entry_time: 0,
            author: author.into(),
            text: text.into(),
            persistent: false,
            expires: None,
        }
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn expiring_at(mut self, expires: Timestamp) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Comment collection
#[derive(Debug)]
pub struct CommentStore {
    comments: BTreeMap<u64, Comment>,
    next_id: u64,
    broker: Broker,
}

impl CommentStore {
    pub fn new(broker: Broker) -> Self {
        Self {
            comments: BTreeMap::new(),
            next_id: 0,
            broker,
        }
    }

    /// Store a comment and return its id
    pub fn add(&mut self, mut comment: Comment, now: Timestamp) -> u64 {
        self.next_id += 1;
        comment.id = self.next_id;
        if comment.entry_time == 0 {
            comment.entry_time = now;
        }
        debug!("Adding comment {} to '{}'", comment.id, comment.host_name);
        self.comments.insert(comment.id, comment);
        self.broker.publish(BrokerEvent::CommentAdded { id: self.next_id });
        self.next_id
    }

    pub fn delete(&mut self, id: u64) -> Result<Comment> {
        let comment = self
            .comments
            .remove(&id)
            .ok_or(EngineError::CommentNotFound(id))?;
        self.broker.publish(BrokerEvent::CommentDeleted { id });
        Ok(comment)
    }

    /// Delete the comment if its expiry time has passed
    pub fn remove_if_expired(&mut self, id: u64, now: Timestamp) -> bool {
        let expired = self
            .comments
            .get(&id)
            .and_then(|c| c.expires)
            .is_some_and(|expires| expires <= now);
        expired && self.delete(id).is_ok()
    }

    /// Delete every comment of a given type on an object
    pub fn delete_matching(
        &mut self,
        host_name: &str,
        service_description: Option<&str>,
        entry_type: CommentEntryType,
    ) -> usize {
        let ids: Vec<u64> = self
            .comments
            .values()
            .filter(|c| {
                c.host_name == host_name
                    && c.service_description.as_deref() == service_description
                    && c.entry_type == entry_type
            })
            .map(|c| c.id)
            .collect();
        ids.iter().filter(|id| self.delete(**id).is_ok()).count()
    }

    /// Delete every comment on an object. A host target also takes the
    /// comments of its services.
    pub fn delete_all_for(&mut self, host_name: &str, service_description: Option<&str>) -> usize {
        let ids: Vec<u64> = self
            .comments
            .values()
            .filter(|c| {
                c.host_name == host_name
                    && (service_description.is_none()
                        || c.service_description.as_deref() == service_description)
            })
            .map(|c| c.id)
            .collect();
        ids.iter().filter(|id| self.delete(**id).is_ok()).count()
    }

    pub fn get(&self, id: u64) -> Option<&Comment> {
        self.comments.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Comment> {
        self.comments.values()
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_delete() {
        let mut store = CommentStore::new(Broker::default());
        let id = store.add(
            Comment::new("web01", None, CommentEntryType::User, "ops", "rebooting"),
            1000,
        );
        assert_eq!(store.get(id).unwrap().entry_time, 1000);
        assert!(store.delete(id).is_ok());
        assert!(store.delete(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_expiry() {
        let mut store = CommentStore::new(Broker::default());
        let id = store.add(
            Comment::new("web01", None, CommentEntryType::User, "ops", "temp").expiring_at(50),
            10,
        );
        assert!(!store.remove_if_expired(id, 49));
        assert!(store.remove_if_expired(id, 50));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_matching() {
        let mut store = CommentStore::new(Broker::default());
        store.add(
            Comment::new("web01", Some("http".into()), CommentEntryType::Acknowledgement, "a", "x"),
            1,
        );
        store.add(Comment::new("web01", None, CommentEntryType::Acknowledgement, "a", "y"), 1);
        assert_eq!(
            store.delete_matching("web01", Some("http"), CommentEntryType::Acknowledgement),
            1
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_all_for_host_includes_services() {
        let mut store = CommentStore::new(Broker::default());
        store.add(Comment::new("web01", Some("http".into()), CommentEntryType::User, "a", "x"), 1);
        store.add(Comment::new("web01", None, CommentEntryType::Downtime, "a", "y"), 1);
        store.add(Comment::new("db01", None, CommentEntryType::User, "a", "z"), 1);

        assert_eq!(store.delete_all_for("web01", Some("ssh")), 0);
        assert_eq!(store.delete_all_for("web01", None), 2);
        assert_eq!(store.len(), 1);
    }
}
