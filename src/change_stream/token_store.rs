//! The Resume Token Store (§4.3): a single atomically-updatable reference to the most recent
//! logical stream position known to the client.

use std::sync::Mutex;

use crate::change_stream::{collaborators::Batch, event::ResumeToken};

/// Holds the current resume token. Writers: the resumable cursor, only on successful batch
/// completion. Readers: the resume path and the `resume_token()` observer.
#[derive(Debug, Default)]
pub(crate) struct ResumeTokenStore {
    token: Mutex<Option<ResumeToken>>,
}

impl ResumeTokenStore {
    pub(crate) fn new(initial: Option<ResumeToken>) -> Self {
        Self {
            token: Mutex::new(initial),
        }
    }

    pub(crate) fn current(&self) -> Option<ResumeToken> {
        self.token.lock().unwrap().clone()
    }

    /// Applies the §4.3 update rule for a batch that has already been validated (every event has
    /// an `_id`). Step 1 (post-batch token) takes precedence over step 2 (last event's `_id`) per
    /// invariant I2; if neither applies, the token is left unchanged.
    pub(crate) fn update_from_batch(&self, batch: &Batch) {
        let next = if let Some(post_batch) = &batch.post_batch_resume_token {
            Some(post_batch.clone())
        } else if let Some(last) = batch.events.last() {
            // Validated by the caller before this is reached; `.id()` cannot fail here.
            last.id().ok()
        } else {
            None
        };

        if let Some(next) = next {
            *self.token.lock().unwrap() = Some(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_stream::event::RawEvent;
    use bson::{doc, RawDocumentBuf};

    fn event(id: i32) -> RawEvent {
        let mut bytes = Vec::new();
        doc! { "_id": { "t": id } }.to_writer(&mut bytes).unwrap();
        RawEvent::new(RawDocumentBuf::from_bytes(bytes).unwrap())
    }

    fn token(t: i32) -> ResumeToken {
        ResumeToken::from_bson(bson::Bson::Document(doc! { "t": t }))
    }

    #[test]
    fn progresses_from_last_event_when_no_post_batch_token() {
        let store = ResumeTokenStore::new(None);
        store.update_from_batch(&Batch {
            events: vec![event(1), event(2)],
            post_batch_resume_token: None,
        });
        assert_eq!(store.current(), Some(token(2)));
    }

    #[test]
    fn post_batch_token_takes_precedence() {
        let store = ResumeTokenStore::new(None);
        store.update_from_batch(&Batch {
            events: vec![event(1)],
            post_batch_resume_token: Some(token(99)),
        });
        assert_eq!(store.current(), Some(token(99)));
    }

    #[test]
    fn empty_batch_with_no_post_batch_token_leaves_token_unchanged() {
        let store = ResumeTokenStore::new(Some(token(5)));
        store.update_from_batch(&Batch {
            events: vec![],
            post_batch_resume_token: None,
        });
        assert_eq!(store.current(), Some(token(5)));
    }
}
