pub mod action_tokens;
pub mod alert_scheduler;
pub mod auth;
pub mod credentials;
pub mod email;
pub mod lockout;
pub mod metrics;
pub mod otp;
pub mod session;
pub mod users;

#[cfg(test)]
pub(crate) mod testing;
