//! Event content types the client core needs to speak.

pub mod room_key_request;

pub use room_key_request::{
    Action, EventEncryptionAlgorithm, RequestedKeyInfo, RoomKeyRequestContent,
};
