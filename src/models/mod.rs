pub mod auth;
pub mod otp;
pub mod token;
pub mod user;
