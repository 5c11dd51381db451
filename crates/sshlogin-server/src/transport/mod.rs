//! Wire transports for the sign-in listener.

pub mod ssh;

pub use ssh::SshTransport;
