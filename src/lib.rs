#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

//! Resumable change-stream cursor core for an async document-store driver.
//!
//! This crate implements the client-side component that presents a continuous,
//! ordered stream of change events over an underlying server-side aggregation
//! cursor, transparently re-establishing the stream after certain transient
//! failures. The underlying cursor, the operation executor, and the connection
//! pool are treated as external collaborators and are only described as traits
//! in [`change_stream::collaborators`]; this crate orchestrates them.

pub use ::bson;

pub mod change_stream;
pub mod error;

pub use crate::change_stream::{
    cursor::ResumableCursor,
    event::{ChangeStreamEvent, OperationType, RawEvent, ResumeToken},
    ChangeStream,
};
