//! SSH-backed implementation of [`crate::transport::Transport`].

pub mod client;
pub mod handler;

pub use client::SshTransport;
pub use handler::ClientHandler;
