//! Host-local publish-subscribe over named pipes.
//!
//! A server publishes a typed record stream at an endpoint directory; any
//! number of clients attach and detach dynamically, each over its own FIFO
//! with its own kernel buffer, so one slow reader never stalls the server or
//! its peers.

pub mod client;
pub mod errors;
pub mod framing;
pub mod info;
pub mod lifecycle;
pub mod paths;
pub mod server;

mod callbacks;
mod sys;

pub use client::{Client, ClientOptions, HelperMode};
pub use errors::{PipeError, Result};
pub use framing::{
    classify_encoded_frame, validate_stream, CameraMeta, EncodedFrameKind, FixedRecord,
    PointCloudFormat, PointCloudMeta, MAGIC_NUMBER,
};
pub use info::{
    endpoint_exists, endpoint_is_type, read_info, read_info_json, stop_server_process,
    EndpointInfo, StopOutcome,
};
pub use lifecycle::{kill_existing_process, KillOutcome, ShutdownFlag};
pub use server::{ClientState, Server, ServerOptions};
