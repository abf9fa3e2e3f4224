//! # tidings-protocol
//!
//! Subscriber-facing wire events for the Tidings notification broker.
//!
//! Subscribers never see the broker's internal types; they receive a stream of
//! [`Event`]s encoded as JSON lines, SSE frames or length-prefixed MessagePack.
//!
//! ## Example
//!
//! ```rust
//! use tidings_protocol::{codec, Event};
//!
//! let event = Event::message(42, "alerts", 1_700_000_000_000, "disk full");
//! let line = codec::encode_json_line(&event).unwrap();
//! assert!(line.ends_with(b"\n"));
//!
//! let frame = codec::encode(&event).unwrap();
//! assert_eq!(codec::decode(&frame).unwrap(), event);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{AttachmentInfo, Event, EventKind};
