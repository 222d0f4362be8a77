//! A fast message queue (`fmq`) over shared memory, for inter-process
//! messaging where the fast path must not enter the kernel.
//!
//! # Overview
//! The queue is a fixed-size element ring in a shared memory segment,
//! governed by two monotonic 64-bit counters. Cooperating processes attach
//! to the same segment and exchange elements with nothing but atomic loads,
//! stores and memcpy; only the optional blocking mode sleeps, on a
//! futex-backed event flag.
//!
//! Key components:
//! - [`MessageQueue`](queue::MessageQueue): the ring endpoint, generic over
//!   the element type and the synchronization
//!   [`Flavor`](queue::Flavor).
//! - [`GrantorDescriptor`](descriptor::GrantorDescriptor): the serializable
//!   handle a creator sends to peers so they can attach.
//! - [`EventFlag`](flag::EventFlag): a shared 32-bit word with bit-masked
//!   futex wait/wake, embedded in the queue or supplied externally.
//! - [`QueueConfig`](core::QueueConfig): creation parameters, built with
//!   [`QueueConfig::builder()`](core::QueueConfig::builder).
//! - [`FmqError`](errors::FmqError): error type for construction and
//!   descriptor handling.
//!
//! # Concurrency model and safety
//!
//! Two flavors share the API surface but differ in who owns the read
//! position:
//!
//! - **[`SynchronizedReadWrite`](queue::SynchronizedReadWrite)**: one
//!   producer, one consumer. The read counter is shared; writers check it
//!   before copying, so published elements are never overwritten and the
//!   consumer never observes a partially-written slot; the producer's
//!   release store of the write counter is the publication point.
//! - **[`UnsynchronizedWrite`](queue::UnsynchronizedWrite)**: one producer,
//!   any number of readers. The writer never waits and never fails for lack
//!   of space; each reader tracks its position privately and detects when it
//!   has been lapped. A lapped reader loses data (it resynchronizes at the
//!   write head) and, because the writer takes no notice of readers, a read
//!   racing the writer across a full lap can observe torn elements; the
//!   counter check on the *next* read reports the overrun. Use the
//!   Synchronized flavor when that is unacceptable.
//!
//! Data-path calls never suspend; the blocking variants suspend only inside
//! the event-flag wait. All counter publishes are release stores and the
//! counter observations gating a copy are acquire loads, on every
//! architecture.
//!
//! Endpoints own their mappings and release them on drop. There is no
//! teardown handshake: when the last mapping disappears the backing pages
//! are reclaimed, and any peer still blocking times out.

pub mod core;
pub mod descriptor;
pub mod errors;
pub mod flag;
pub mod queue;


pub use crate::core::QueueConfig;
pub use descriptor::{Grantor, GrantorDescriptor};
pub use errors::FmqError;
pub use flag::{EventFlag, NOT_EMPTY, NOT_FULL};
pub use queue::{Flavor, MessageQueue, Quantum, SynchronizedReadWrite, UnsynchronizedWrite};
