pub mod manager;
pub mod notification;
pub mod room;

pub use manager::RoomManager;
pub use notification::{NotificationQueue, RoomNotification};
pub use room::Room;
