pub mod messenger;
pub mod traits;
pub mod types;

pub use messenger::MessengerClient;
pub use traits::PlatformClient;
pub use types::{
    ChannelId, ConversationRef, InboundEvent, InboundPayload, MessageId, OutboundMessage,
    PlatformMessage, UserId,
};
