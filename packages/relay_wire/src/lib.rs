//! # Relay Wire
//!
//! The text event stream contract between the chat relay and the browser.
//!
//! ## Wire format
//!
//! Every event is a single frame:
//!
//! ```text
//! data: {"content":"<text>"}\n\n
//! ```
//!
//! A fragment carries a UTF-8 text delta. The terminator carries the reserved
//! value `[DONE]` and is sent exactly once, last, on a successful stream. A
//! stream that stops without it was aborted.
//!
//! ## Quick Start
//!
//! ```rust
//! use relay_wire::{Event, EventDecoder, Transcript};
//!
//! let wire: String = [Event::fragment("Hello"), Event::fragment(", world"), Event::Terminator]
//!     .iter()
//!     .map(Event::encode)
//!     .collect();
//!
//! let mut decoder = EventDecoder::default();
//! let mut transcript = Transcript::default();
//! for event in decoder.push(wire.as_bytes()).unwrap() {
//!     transcript.apply(&event).unwrap();
//! }
//! assert!(transcript.is_complete());
//! assert_eq!(transcript.text(), "Hello, world");
//! ```

pub mod consumer;
pub mod decoder;
pub mod error;
pub mod event;
pub mod framing;
pub mod transcript;

pub use consumer::{FALLBACK_MESSAGE, TurnOutcome, consume};
pub use decoder::EventDecoder;
pub use error::WireError;
pub use event::{Event, Fragment, TERMINATOR_CONTENT};
pub use framing::{Frame, FrameDecoder};
pub use transcript::Transcript;
