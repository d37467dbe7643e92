pub mod availability;
pub mod booking;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod lifecycle;
pub mod notification;
pub mod quota;
pub mod sweeper;
pub mod validator;
