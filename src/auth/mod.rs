//! Request authentication: HMAC signature verification under key rotation,
//! batch abuse heuristics, and secret-at-rest handling.

pub mod abuse;
pub mod hmac;
pub mod secrets;

pub use hmac::{HmacErrorCode, SecretSlot, SignatureInput, VerifyOutcome};
pub use secrets::SecretCipher;
