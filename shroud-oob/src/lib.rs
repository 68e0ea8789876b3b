//! OOB peer of the shroud split proxy: accepts session-keyed JSON requests,
//! opens target connections on behalf of clients, buffers target responses,
//! and reports target metadata for the client's direct reconnection.

pub mod service;
pub mod upstream;
