#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use backoffice_auth::{
    config::{Config, StoreBackend},
    db::memory::MemoryStore,
    models::{
        auth::ClientOrigin,
        otp::OtpPurpose,
        user::{AccountStatus, Permissions, User, UserRole},
    },
    routes,
    services::email::SecurityNotifier,
    AppState,
};

pub const PASSWORD: &str = "password123";

/// Captures outgoing codes and links so a test can play the user's inbox.
#[derive(Default)]
pub struct Inbox {
    otps: Mutex<Vec<(String, String, OtpPurpose)>>,
    links: Mutex<Vec<(String, String)>>,
    alerts: Mutex<Vec<String>>,
}

impl Inbox {
    pub fn last_code(&self, email: &str) -> String {
        self.otps
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _, _)| to == email)
            .map(|(_, code, _)| code.clone())
            .expect("no code delivered")
    }

    pub fn last_purpose(&self, email: &str) -> OtpPurpose {
        self.otps
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _, _)| to == email)
            .map(|(_, _, purpose)| *purpose)
            .expect("no code delivered")
    }

    /// Token parameter of the last invitation or reset link.
    pub fn last_token(&self, email: &str) -> String {
        let link = self
            .links
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, link)| link.clone())
            .expect("no link delivered");
        link.split_once("token=").unwrap().1.to_string()
    }

    pub fn alert_count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }
}

#[async_trait]
impl SecurityNotifier for Inbox {
    async fn send_otp(&self, to: &str, code: &str, purpose: OtpPurpose) -> anyhow::Result<()> {
        self.otps.lock().unwrap().push((to.into(), code.into(), purpose));
        Ok(())
    }

    async fn send_invitation(&self, to: &str, _name: &str, link: &str) -> anyhow::Result<()> {
        self.links.lock().unwrap().push((to.into(), link.into()));
        Ok(())
    }

    async fn send_password_reset(&self, to: &str, link: &str) -> anyhow::Result<()> {
        self.links.lock().unwrap().push((to.into(), link.into()));
        Ok(())
    }

    async fn send_security_alert(
        &self,
        to: &str,
        _origin: &ClientOrigin,
        _requested_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(to.into());
        Ok(())
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub inbox: Arc<Inbox>,
}

pub fn config() -> Config {
    Config {
        store_backend: StoreBackend::Memory,
        database_url: None,
        redis_url: "redis://127.0.0.1:6379".into(),
        jwt_secret: "it-access-secret".into(),
        jwt_refresh_secret: "it-refresh-secret".into(),
        action_token_secret: "it-action-secret".into(),
        otp_secret: "it-otp-secret".into(),
        bcrypt_cost: 4,
        cookie_secure: false,
        alert_poll_seconds: 15,
        host: "127.0.0.1".into(),
        port: 0,
        app_base_url: "http://localhost:3000".into(),
        smtp_host: None,
        smtp_port: None,
        smtp_username: None,
        smtp_password: None,
        smtp_from: None,
    }
}

pub fn app() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let inbox = Arc::new(Inbox::default());
    let state = AppState::in_memory(Arc::new(config()), store.clone(), inbox.clone());
    TestApp {
        router: routes::router(state.clone()),
        state,
        store,
        inbox,
    }
}

pub fn seed_user(store: &MemoryStore, email: &str, role: UserRole, permissions: Permissions) -> User {
    let now = Utc::now();
    let user = User {
        id: Uuid::new_v4(),
        email: email.into(),
        name: "Seeded".into(),
        password_hash: Some(bcrypt::hash(PASSWORD, 4).unwrap()),
        status: AccountStatus::Active,
        role,
        permissions,
        failed_login_attempts: 0,
        login_blocked_until: None,
        token_version: 0,
        created_at: now,
        updated_at: now,
    };
    store.put_user(user.clone()).unwrap();
    user
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    /// Value of the refresh cookie set by this response, if any.
    pub fn refresh_cookie(&self) -> Option<String> {
        self.headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|c| c.strip_prefix(&format!("{}=", routes::REFRESH_COOKIE)))
            .and_then(|rest| rest.split(';').next())
            .map(str::to_string)
    }
}

pub struct Call<'a> {
    method: &'static str,
    uri: &'a str,
    body: Option<Value>,
    bearer: Option<&'a str>,
    cookie: Option<&'a str>,
}

pub fn post<'a>(uri: &'a str, body: Value) -> Call<'a> {
    Call {
        method: "POST",
        uri,
        body: Some(body),
        bearer: None,
        cookie: None,
    }
}

pub fn get(uri: &str) -> Call<'_> {
    Call {
        method: "GET",
        uri,
        body: None,
        bearer: None,
        cookie: None,
    }
}

impl<'a> Call<'a> {
    pub fn bearer(mut self, token: &'a str) -> Self {
        self.bearer = Some(token);
        self
    }

    pub fn cookie(mut self, refresh_token: &'a str) -> Self {
        self.cookie = Some(refresh_token);
        self
    }

    pub async fn send(self, router: &Router) -> Reply {
        let mut builder = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .header(header::USER_AGENT, "integration-test")
            .header("x-real-ip", "198.51.100.20");
        if let Some(token) = self.bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(token) = self.cookie {
            builder = builder.header(header::COOKIE, format!("{}={token}", routes::REFRESH_COOKIE));
        }
        let request = match self.body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Reply {
            status,
            headers,
            body,
        }
    }
}

/// Password + OTP sign-in. Returns (access token, refresh cookie value).
pub async fn sign_in(app: &TestApp, email: &str, password: &str) -> (String, String) {
    let step1 = post("/auth/login", serde_json::json!({ "email": email, "password": password }))
        .send(&app.router)
        .await;
    assert_eq!(step1.status, StatusCode::OK, "{}", step1.body);

    let code = app.inbox.last_code(email);
    let step2 = post("/auth/verify-otp", serde_json::json!({ "email": email, "otp": code }))
        .send(&app.router)
        .await;
    assert_eq!(step2.status, StatusCode::OK, "{}", step2.body);

    let refresh = step2.refresh_cookie().expect("refresh cookie set");
    let access = step2.body["accessToken"].as_str().unwrap().to_string();
    (access, refresh)
}
