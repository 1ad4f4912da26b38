//! Post office - mailbox-multiplexed transport over one duplex stream
//!
//! Layers, bottom up:
//! - **wire**: fixed 36-byte fragment header, CRC32C, fragmentation
//! - **scanner**: resilient recovery of valid fragments from a noisy stream
//! - **mailbox**: per-channel FIFO plus fragment reassembly
//! - **carpool**: single-flight gate for sharing read passes without a reader task
//! - **office**: the `PostOffice` itself

pub mod carpool;
pub mod mailbox;
pub mod office;
pub mod scanner;
pub mod wire;

pub use mailbox::{Mailbox, MailboxError, MailboxId, MailboxMessage, MAX_TRANSIENT};
pub use office::{PostOffice, PostOfficeError, PostOfficeOptions, PostOfficeStats};
pub use scanner::{FrameScanner, ScanStats};
pub use wire::{WireError, WireFrame, HEADER_LEN, MAX_FRAGMENT_PAYLOAD};

#[cfg(test)]
mod integration_tests;
