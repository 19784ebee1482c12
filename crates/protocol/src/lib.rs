//! Courier wire protocol: the RPC reply envelope and subject naming.
//!
//! Everything in this crate is pure: no I/O, no runtime.  Both the calling
//! side and the serving side agree on these definitions, so a caller and a
//! service built from different releases keep understanding each other as
//! long as the envelope shape is stable.
//!
//! # Wire shape
//!
//! ```text
//! request  : [arg0, arg1, ...]                      (JSON array)
//! success  : {"status":"ok","result":<value>}
//! failure  : {"status":"error","message":"...","kind":"...","detail":<value>}
//! ```
//!
//! A reply without a recognised `status` discriminant is a raw value and is
//! handed to the caller untouched.

pub mod envelope;
pub mod subject;

pub use envelope::{decode, decode_args, encode, encode_args, Decoded, Envelope, EnvelopeError};
pub use subject::{durable_name_for, stream_name_for, subject_for, Subject, SubjectError};
