use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec};

lazy_static! {
    // ── Event counters (increment on each event) ────────────────────────────
    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "auth_logins_total",
        "Login attempts by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref LOCKOUTS_COUNTER: Counter = register_counter!(
        "auth_lockouts_total",
        "Accounts locked after repeated failed logins"
    ).unwrap();

    pub static ref OTP_COUNTER: CounterVec = register_counter_vec!(
        "auth_otp_total",
        "OTP challenges issued and verified, by purpose and result",
        &["purpose", "result"]
    ).unwrap();

    pub static ref ACTION_TOKENS_COUNTER: CounterVec = register_counter_vec!(
        "auth_action_tokens_total",
        "Invite/reset token events by purpose",
        &["purpose", "event"]
    ).unwrap();

    pub static ref REFRESH_COUNTER: CounterVec = register_counter_vec!(
        "auth_refresh_total",
        "Access token refreshes by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref SECURITY_ALERTS_COUNTER: Counter = register_counter!(
        "auth_security_alerts_total",
        "Security alerts sent for unconfirmed sign-ins"
    ).unwrap();
}
