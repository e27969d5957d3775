//! Envelope model and wire codec.
//!
//! An envelope is a header plus an ordered list of typed binary items. It is
//! the unit that gets queued on disk and handed to the transport.
//!
//! # Wire Format
//!
//! ```text
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc","sdk":{...}}\n
//! {"type":"event","length":2,"content_type":"application/json"}\n
//! {}\n
//! {"type":"attachment","length":5,"filename":"a.txt"}\n
//! hello
//! ```
//!
//! The header and every item header are single-line JSON objects. Payloads
//! are raw bytes of exactly `length` bytes, so they may contain line breaks.
//! The line break after the last payload is optional.

pub mod category;
pub mod codec;
pub mod error;
pub mod model;

pub use category::DataCategory;
pub use codec::{check_id_policy, decode, decode_with, encode, IdPolicy};
pub use error::{DecodeError, WireError, WireResult};
pub use model::{Envelope, EnvelopeHeader, EnvelopeItem, ItemHeader, SdkInfo, SdkPackage};
