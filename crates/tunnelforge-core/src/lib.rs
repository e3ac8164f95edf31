pub mod auth;
pub mod error;
pub mod events;
pub mod protocol;
pub mod subdomain;
