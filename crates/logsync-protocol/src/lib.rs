//! logsync protocol - wire vocabulary for segment replication
//!
//! One connection multiplexes every topic of a client/service pair. The
//! client streams segment bytes with PUBLISH packets, one outstanding PUBLISH
//! per topic; the service answers each with PUBACK, PUBNAK/RESET or
//! PUBNAK/FAILURE.
//!
//! ```text
//! ┌──────────────┐  PUBLISH(offset, topic, data)  ┌──────────────┐
//! │  SyncClient  │ ─────────────────────────────► │ SyncService  │
//! │              │ ◄───────────────────────────── │              │
//! └──────────────┘   PUBACK | RESET(off) | FAIL   └──────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod int;
pub mod packet;
pub mod varint;

pub use codec::{MAX_FRAME_SIZE, PacketCodec};
pub use error::{Error, Result};
pub use packet::Packet;
