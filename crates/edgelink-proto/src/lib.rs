#![warn(missing_docs)]

//! EdgeLink wire protocol: message catalog, frame codec, and the bidirectional
//! session link between the platform and a remote edge gateway.

pub mod codec;
pub mod link;
pub mod msg;
