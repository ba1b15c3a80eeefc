mod message;
mod notification;
mod room;

pub use message::{
    validate_body, Attachment, ChatMessage, EditRecord, MessageKind, NewMessage,
    DEFAULT_MAX_BODY_LEN,
};
pub use notification::{Notification, NotificationEvent};
pub use room::RoomKey;
