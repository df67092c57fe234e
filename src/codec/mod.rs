//! Codec module - payload serialization.
//!
//! Request, response and status payloads are all MessagePack, encoded by
//! [`MsgPackCodec`]. Framing lives in [`crate::protocol`]; this module never
//! sees headers.
//!
//! # Example
//!
//! ```
//! use coordinator_rpc::codec::MsgPackCodec;
//! use coordinator_rpc::messages::CloseSessionRequest;
//!
//! let req = CloseSessionRequest { session_handle: "abc".to_string() };
//! let encoded = MsgPackCodec::encode(&req).unwrap();
//! let decoded: CloseSessionRequest = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, req);
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
