pub mod account_reference;
pub mod error;
pub mod phone;
pub mod response;
pub mod secret;
pub mod time;
