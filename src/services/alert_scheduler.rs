use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::models::otp::OtpPurpose;
use crate::models::token::{JobKind, OtpAlertPayload, ScheduledJob};
use crate::services::metrics::SECURITY_ALERTS_COUNTER;
use crate::AppState;

/// Jobs claimed per poll.
const CLAIM_BATCH: i64 = 50;

/// Spawn a background task that wakes up every `poll_seconds` and runs the
/// scheduled jobs that came due. Failures are logged and never retried.
pub fn start(state: AppState, poll_seconds: u64) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(poll_seconds)).await;

            match dispatch_due(&state, Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("Alert scheduler: {} security alert(s) sent", n),
                Err(e) => warn!("Alert scheduler: failed to claim due jobs: {}", e),
            }
        }
    });
}

/// Claims every job due at `now` and runs it. Returns how many alerts went
/// out. A claimed job is gone from the schedule whether or not it succeeds.
pub async fn dispatch_due(state: &AppState, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let mut sent = 0;
    loop {
        let jobs = state.jobs.claim_due(now, CLAIM_BATCH).await?;
        let batch = jobs.len();

        for job in jobs {
            match job.kind {
                JobKind::OtpAlert => match send_otp_alert(state, &job).await {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "OTP alert failed"),
                },
            }
        }

        if batch < CLAIM_BATCH as usize {
            return Ok(sent);
        }
    }
}

/// Alerts only if the login challenge is still waiting to be confirmed.
async fn send_otp_alert(state: &AppState, job: &ScheduledJob) -> anyhow::Result<bool> {
    let payload: OtpAlertPayload = serde_json::from_value(job.payload.clone())?;

    let pending = state
        .otps
        .find(&payload.email, OtpPurpose::Login, &payload.code_digest)
        .await?;
    if pending.is_none() {
        return Ok(false);
    }

    state
        .notifier
        .send_security_alert(&payload.email, &payload.origin, payload.requested_at)
        .await?;
    SECURITY_ALERTS_COUNTER.inc();
    info!(ip = %payload.origin.ip_address, "security alert sent for unconfirmed login");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::auth::ClientOrigin;
    use crate::services::auth::AuthService;
    use crate::services::testing;

    const EMAIL: &str = "ops@example.com";
    const PASSWORD: &str = "password123";

    #[tokio::test]
    async fn alert_fires_when_otp_left_pending() {
        let h = testing::harness();
        testing::active_user(&h.store, EMAIL, PASSWORD).await;
        let now = Utc::now();

        AuthService::login(&h.state, EMAIL, PASSWORD, &testing::origin(), now)
            .await
            .unwrap();

        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(3)).await.unwrap(), 0);
        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(4)).await.unwrap(), 1);

        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, EMAIL);
        assert_eq!(alerts[0].1, testing::origin());

        // Claimed jobs do not fire twice.
        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn no_alert_once_otp_confirmed() {
        let h = testing::harness();
        testing::active_user(&h.store, EMAIL, PASSWORD).await;
        let now = Utc::now();

        AuthService::login(&h.state, EMAIL, PASSWORD, &testing::origin(), now)
            .await
            .unwrap();
        let code = h.notifier.last_code(EMAIL).unwrap();
        AuthService::verify_login_otp(&h.state, EMAIL, &code, now + Duration::minutes(1))
            .await
            .unwrap();

        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(4)).await.unwrap(), 0);
        assert!(h.notifier.alerts().is_empty());
    }

    #[tokio::test]
    async fn confirming_one_login_keeps_alert_for_another() {
        let h = testing::harness();
        testing::active_user(&h.store, EMAIL, PASSWORD).await;
        let stranger = ClientOrigin {
            ip_address: "203.0.113.66".into(),
            user_agent: "curl/8.0".into(),
        };
        let now = Utc::now();

        AuthService::login(&h.state, EMAIL, PASSWORD, &stranger, now)
            .await
            .unwrap();
        let later = now + Duration::minutes(1);
        AuthService::login(&h.state, EMAIL, PASSWORD, &testing::origin(), later)
            .await
            .unwrap();
        let owner_code = h.notifier.last_code(EMAIL).unwrap();
        AuthService::verify_login_otp(&h.state, EMAIL, &owner_code, later)
            .await
            .unwrap();
        assert_eq!(h.store.pending_jobs().unwrap().len(), 1);

        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(6)).await.unwrap(), 1);
        let alerts = h.notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].1, stranger);
    }

    #[tokio::test]
    async fn consumed_challenge_suppresses_alert_even_if_job_remains() {
        let h = testing::harness();
        testing::active_user(&h.store, EMAIL, PASSWORD).await;
        let now = Utc::now();

        AuthService::login(&h.state, EMAIL, PASSWORD, &testing::origin(), now)
            .await
            .unwrap();
        let code = h.notifier.last_code(EMAIL).unwrap();
        // Consume the challenge without going through the login step that
        // cancels the job.
        h.state
            .otp_manager()
            .verify(EMAIL, &code, OtpPurpose::Login, now)
            .await
            .unwrap();

        assert_eq!(h.store.pending_jobs().unwrap().len(), 1);
        assert_eq!(dispatch_due(&h.state, now + Duration::minutes(4)).await.unwrap(), 0);
        assert!(h.store.pending_jobs().unwrap().is_empty());
    }
}
