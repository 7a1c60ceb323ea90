//! Options controlling how a change stream is opened (§1, §4.2), grounded on the reference
//! driver's `ChangeStreamOptions`.

use bson::Timestamp;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::change_stream::event::ResumeToken;

/// Options for creating a [`ChangeStream`](super::ChangeStream).
///
/// `resume_after`, `start_after`, and `start_at_operation_time` are mutually exclusive; setting
/// more than one is a caller error the operation executor is expected to reject before the first
/// `execute()` (this crate does not itself validate the combination, since it has no opinion on
/// wire-level option encoding).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct ChangeStreamOptions {
    /// Controls whether change notifications include a copy of the full document.
    pub full_document: Option<FullDocumentType>,

    /// Controls whether delete notifications include a copy of the document as it was just
    /// before it was deleted.
    pub full_document_before_change: Option<FullDocumentBeforeChangeType>,

    /// The resume token produced by a previously consumed change, used to resume the stream from
    /// that point on.
    pub resume_after: Option<ResumeToken>,

    /// Similar to `resume_after`, but also allows resuming after an invalidate event.
    pub start_after: Option<ResumeToken>,

    /// The logical time at which to start the stream; mutually exclusive with `resume_after` and
    /// `start_after`.
    pub start_at_operation_time: Option<Timestamp>,

    /// The maximum amount of time the server should wait for new results before returning an
    /// empty batch.
    pub max_await_time: Option<std::time::Duration>,

    /// The number of events to return per batch.
    pub batch_size: Option<u32>,

    /// The collation to use for the aggregation. Opaque to this crate; forwarded verbatim to the
    /// out-of-scope command executor (§1).
    pub collation: Option<Collation>,

    /// The read concern to use for the aggregation. Opaque to this crate for the same reason as
    /// `collation`.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for this operation. Opaque to this crate for the same
    /// reason as `collation`.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// Describes whether change notification documents include a copy of the full document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentType {
    /// The default, no pre-/post-image lookup.
    Default,
    /// Always include the post-image when available.
    UpdateLookup,
    /// Require a post-image, erroring if one is unavailable.
    Required,
    /// Include the post-image when available, without error if unavailable.
    WhenAvailable,
}

/// Describes whether delete/update notification documents include a copy of the document as it
/// was before the operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum FullDocumentBeforeChangeType {
    /// The default, no pre-image lookup.
    Off,
    /// Require a pre-image, erroring if one is unavailable.
    Required,
    /// Include the pre-image when available, without error if unavailable.
    WhenAvailable,
}

/// A placeholder stand-in for the out-of-scope collation value object (§1). This crate never
/// interprets its contents; it only stores and forwards whatever the caller provides.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    /// The opaque collation document, forwarded to the command executor unmodified.
    pub locale: String,
}

/// A placeholder stand-in for the out-of-scope read concern value object (§1).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    /// The read concern level (e.g. `"majority"`), forwarded unmodified.
    pub level: String,
}

/// A placeholder stand-in for the out-of-scope server-selection criteria value object (§1).
#[derive(Clone, Debug, Default)]
pub struct SelectionCriteria {
    /// An opaque description of the selection criteria, forwarded unmodified.
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_leaves_unset_fields_none() {
        let opts = ChangeStreamOptions::builder().batch_size(50).build();
        assert_eq!(opts.batch_size, Some(50));
        assert_eq!(opts.resume_after, None);
        assert_eq!(opts.full_document, None);
    }
}
