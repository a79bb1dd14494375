pub mod protocol;
pub mod codec;
pub mod connection;
pub mod server;

// Re-exports
pub use server::StratumServer;
pub use connection::{PoolContext, Session, SessionState};
pub use codec::{CodecError, Frame, StratumCodec};
pub use protocol::{
    Message, Method, Notification, Request, Response, StratumError,
    AuthorizeParams, ConfigureParams, SubmitParams, SubscribeParams,
};
