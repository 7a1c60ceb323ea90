//! Contains documents related to a change-stream event, and the undecoded form the cursor
//! works with before a caller's type is known.

use bson::{Bson, RawDocumentBuf};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// An opaque token used for resuming an interrupted [`ChangeStream`](super::ChangeStream).
///
/// See the documentation
/// [here](https://docs.mongodb.com/manual/changeStreams/#change-stream-resume-token) for more
/// information on resume tokens.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ResumeToken(pub(crate) Bson);

impl ResumeToken {
    /// Wraps an arbitrary BSON value as a resume token. Exposed for collaborator fakes and tests;
    /// production tokens always originate from a server-produced `_id` or
    /// `postBatchResumeToken`.
    pub fn from_bson(value: Bson) -> Self {
        Self(value)
    }

    /// Returns the raw BSON backing this token.
    pub fn as_bson(&self) -> &Bson {
        &self.0
    }
}

/// An undecoded change-stream document, preserved byte-exact until the caller consumes it.
#[derive(Debug, Clone)]
pub struct RawEvent(RawDocumentBuf);

impl RawEvent {
    /// Wraps a raw document as a `RawEvent`.
    pub fn new(doc: RawDocumentBuf) -> Self {
        Self(doc)
    }

    /// Returns the raw bytes of the underlying document.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Extracts this event's resume token from its `_id` field.
    ///
    /// Returns [`ErrorKind::MissingResumeToken`] if the field is absent, per invariant I5: a
    /// `RawEvent` with no `_id` is malformed and cannot be used to advance the resume token.
    pub fn id(&self) -> Result<ResumeToken> {
        match self
            .0
            .get("_id")
            .map_err(|e| Error::new(ErrorKind::Decode { message: e.to_string() }))?
        {
            Some(raw) => {
                let bson = raw
                    .try_into()
                    .map_err(|e: bson::raw::Error| Error::new(ErrorKind::Decode { message: e.to_string() }))?;
                Ok(ResumeToken(bson))
            }
            None => Err(Error::new(ErrorKind::MissingResumeToken)),
        }
    }

    /// Decodes this event into the caller's type via `serde`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_slice(self.0.as_bytes()).map_err(Error::from)
    }
}

/// A decoded change notification, generic over the shape of `full_document`.
///
/// Supplements the distilled event shape with the fields the reference driver's
/// `ChangeStreamEvent<T>` carries, since the original spec scoped only `_id` as load-bearing for
/// the resume protocol.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent<T> {
    /// An opaque token for use when resuming an interrupted [`ChangeStream`](super::ChangeStream).
    #[serde(rename = "_id")]
    pub id: ResumeToken,

    /// Describes the type of operation represented in this change notification.
    pub operation_type: OperationType,

    /// Identifies which collection or database where the event occurred.
    pub ns: Option<ChangeStreamEventSource>,

    /// The new name for the namespace. Only present for `OperationType::Rename`.
    pub to: Option<ChangeStreamEventSource>,

    /// The id (or full shard key) of the document that was affected.
    pub document_key: Option<bson::Document>,

    /// Describes updated and removed fields for update operations.
    pub update_description: Option<UpdateDescription>,

    /// The document affected, when available (insert/replace always; update only when
    /// `full_document` is configured to look it up).
    pub full_document: Option<T>,
}

/// Describes which fields have been updated or removed from a document.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// Field names mapped to their new values.
    pub updated_fields: bson::Document,
    /// Field names that were removed.
    pub removed_fields: Vec<String>,
}

/// The operation type represented in a given change notification.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// See [insert-event](https://docs.mongodb.com/manual/reference/change-events/#insert-event).
    Insert,
    /// See [update-event](https://docs.mongodb.com/manual/reference/change-events/#update-event).
    Update,
    /// See [replace-event](https://docs.mongodb.com/manual/reference/change-events/#replace-event).
    Replace,
    /// See [delete-event](https://docs.mongodb.com/manual/reference/change-events/#delete-event).
    Delete,
    /// See [drop-event](https://docs.mongodb.com/manual/reference/change-events/#drop-event).
    Drop,
    /// See [rename-event](https://docs.mongodb.com/manual/reference/change-events/#rename-event).
    Rename,
    /// See [dropdatabase-event](https://docs.mongodb.com/manual/reference/change-events/#dropdatabase-event).
    DropDatabase,
    /// See [invalidate-event](https://docs.mongodb.com/manual/reference/change-events/#invalidate-event).
    Invalidate,
}

/// Identifies which collection or database where an event occurred.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChangeStreamEventSource {
    /// A specific database and collection.
    Namespace {
        /// The database name.
        db: String,
        /// The collection name.
        coll: String,
    },
    /// A database only (e.g. for `dropDatabase` events).
    Database(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn raw(doc: bson::Document) -> RawEvent {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        RawEvent::new(RawDocumentBuf::from_bytes(bytes).unwrap())
    }

    #[test]
    fn id_extracted_when_present() {
        let event = raw(doc! { "_id": { "token": 1 }, "operationType": "insert" });
        let token = event.id().unwrap();
        assert_eq!(token.as_bson(), &Bson::Document(doc! { "token": 1 }));
    }

    #[test]
    fn id_missing_is_stream_invariant_violation() {
        let event = raw(doc! { "operationType": "insert" });
        let err = event.id().unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::MissingResumeToken));
    }
}
