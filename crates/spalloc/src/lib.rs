//! Client side of the remote board allocation protocol.
//!
//! The allocation service speaks newline-delimited JSON over a single TCP connection.
//! Correlated commands are answered with `{"return": ..}` or `{"exception": ..}`, while
//! `{"jobs_changed": [..]}` notifications may arrive at any time.
//!
//! The term `session` is used for a remote allocation (the service itself calls it a "job"),
//! to distinguish it from the computational jobs that are being scheduled onto the boards.
mod error;

pub mod client;
pub mod messages;
pub mod transport;


pub use client::{AllocatorClient, ClientConfig, Notifications, create_allocator_client};
pub use error::SpallocError;
pub use messages::{
    ChipLocation, Connection, JobMachineInfo, Machine, Request, Response, SessionId,
    SessionState, SessionStatus, WhereIs,
};

pub type Error = SpallocError;
pub type Result<T> = std::result::Result<T, Error>;
