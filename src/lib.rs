//! Demo Broker Library
//!
//! Single-concurrency session broker: gates browser clients through a
//! FIFO waitlist and grants one exclusive, time-boxed terminal session at
//! a time, backed by a spawned sandbox container.

pub mod auth;
pub mod client;
pub mod config;
pub mod credential;
pub mod gateway;
pub mod invite;
pub mod kv;
pub mod protocol;
pub mod pty;
pub mod queue;
pub mod ratelimit;
pub mod session;
pub mod token;
pub mod tokenmap;

pub use client::{ClientRegistry, ClientState};
pub use config::Config;
pub use credential::{CredentialError, CredentialHandle, Credentials};
pub use gateway::Gateway;
pub use invite::{InviteError, InviteRecord, InviteStatus, InviteStore};
pub use kv::{InMemoryKv, KvError, KvStore};
pub use protocol::{ClientMessage, ServerMessage, SessionEndReason};
pub use queue::QueueManager;
pub use ratelimit::SlidingWindowLimiter;
pub use session::{PromoteError, ReconnectError, SessionSupervisor};
pub use tokenmap::SessionTokenMap;
