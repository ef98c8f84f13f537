pub mod dns;
pub mod history;
pub mod logger;
pub mod outbound;
pub mod router;
