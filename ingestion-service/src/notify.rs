//! Upload status notifications.
//!
//! Worker threads push [`StatusUpdate`]s through a [`NotificationSender`];
//! a [`NotificationDispatcher`] task drains them into a
//! [`NotificationChannel`](crate::collaborators::NotificationChannel) such as
//! the in-process [`SubscriberHub`].

mod dispatcher;
mod hub;
mod messages;

pub use dispatcher::{NotificationDispatcher, NotificationSender};
pub use hub::{SubscriberHub, Subscription};
pub use messages::{ServerMessage, StatusUpdate};
