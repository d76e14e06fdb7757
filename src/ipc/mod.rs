//! Host ↔ sandbox IPC: the message contract and its line-framed transport.

pub mod channel;
pub mod protocol;

pub use channel::{IPC_FD_ENV, MessageReader, MessageWriter, RESOURCE_FD_ENV};
pub use protocol::{
    CompleteMessage, Decoded, GrantedPermissions, InitMessage, IpcMessage, Request, ResourceCall,
    Response, decode,
};
