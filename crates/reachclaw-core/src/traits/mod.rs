//! Seams to external collaborators.

pub mod notify;
pub mod platform;

pub use notify::NotifySink;
pub use platform::{
    ChatPlatform, InboundMessage, InboundStream, PlatformFailure, ProviderError, SendOutcome,
    SessionHandle,
};
