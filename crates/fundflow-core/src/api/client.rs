//! API client for the fundflow backend.
//!
//! Every operation is a thin call through the `RequestPipeline`. Sign-in
//! operations additionally record the returned credentials in the session,
//! and `logout` always clears it.

use std::sync::Arc;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use super::pipeline::{RequestOptions, RequestPipeline};
use super::transport::ReqwestTransport;
use super::ApiError;
use crate::auth::SessionState;
use crate::config::Config;
use crate::models::{
    AiGenerateRequest, EmailRequest, LoginRequest, LoginResponse, PasswordResetConfirm,
    RegisterRequest, TestEmailRequest, TokenRequest, TwoFactorCode, UserSummary,
};
use crate::storage::{KeyValueStore, AI_SESSION_ID_KEY};

/// Page size for public project listings
pub const DEFAULT_PROJECT_PAGE: u32 = 20;

/// Page size for admin listings
pub const DEFAULT_ADMIN_PAGE: u32 = 100;

/// Append `params` to `path` as a query string, skipping unset values
fn with_query(path: &str, params: &[(&str, Option<String>)]) -> String {
    let query: Vec<String> = params
        .iter()
        .filter_map(|(key, value)| {
            value
                .as_ref()
                .map(|v| format!("{}={}", key, urlencoding::encode(v)))
        })
        .collect();
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, query.join("&"))
    }
}

/// Random RFC 4122 version 4 UUID in canonical hyphenated form
fn random_uuid_v4() -> String {
    let mut bytes: [u8; 16] = rand::thread_rng().gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Clears the session when dropped, so a cancelled logout still signs out
struct ClearOnDrop<'a>(&'a SessionState);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Clone is cheap - the pipeline shares its transport and session.
#[derive(Clone)]
pub struct ApiClient {
    pipeline: RequestPipeline,
}

impl ApiClient {
    pub fn new(pipeline: RequestPipeline) -> Self {
        Self { pipeline }
    }

    /// Build a client talking to `config.api_url` over reqwest, with the
    /// session loaded from `store`
    pub fn connect(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(config.request_timeout())?;
        let session = SessionState::load(store);
        Ok(Self::new(RequestPipeline::new(
            config.api_url.as_str(),
            Arc::new(transport),
            session,
        )))
    }

    pub fn session(&self) -> &SessionState {
        self.pipeline.session()
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    /// Record a successful sign-in
    fn establish_session(&self, response: &LoginResponse) -> Result<(), ApiError> {
        let session = self.session();
        session.set_user(response.user.clone(), &response.access_token)?;
        // A session token left over from an earlier sign-in belongs to
        // another user and must not be used for refresh
        match response.session_token {
            Some(ref session_token) => session.set_session_token(session_token)?,
            None => session.clear_session_token()?,
        }
        info!(user_id = response.user.id, "Signed in");
        Ok(())
    }

    // ===== Authentication =====

    pub async fn register(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<Value, ApiError> {
        let body = RegisterRequest {
            email,
            password,
            full_name,
        };
        self.pipeline
            .send_value("/api/auth/register", RequestOptions::post().json(&body)?)
            .await
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        two_factor_code: Option<&str>,
    ) -> Result<LoginResponse, ApiError> {
        let body = LoginRequest {
            email,
            password,
            two_factor_code,
        };
        let response: LoginResponse = self
            .pipeline
            .send_as("/api/auth/login", RequestOptions::post().json(&body)?)
            .await?;
        self.establish_session(&response)?;
        Ok(response)
    }

    /// Sign out remotely, then clear local credentials whatever the outcome
    pub async fn logout(&self) -> Result<(), ApiError> {
        let guard = ClearOnDrop(self.session());
        let result = self
            .pipeline
            .send("/api/auth/logout", RequestOptions::post())
            .await;
        drop(guard);
        if let Err(ref e) = result {
            warn!(error = %e, "Remote logout failed, local session cleared");
        }
        result.map(|_| ())
    }

    pub async fn current_user(&self) -> Result<UserSummary, ApiError> {
        self.pipeline.send_as("/api/auth/me", RequestOptions::get()).await
    }

    pub async fn update_profile<T: Serialize + ?Sized>(&self, data: &T) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/users/profile", RequestOptions::put().json(data)?)
            .await
    }

    pub async fn request_password_reset(&self, email: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                "/api/auth/password-reset-request",
                RequestOptions::post().json(&EmailRequest { email })?,
            )
            .await
    }

    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<Value, ApiError> {
        let body = PasswordResetConfirm {
            token,
            new_password,
        };
        self.pipeline
            .send_value("/api/auth/password-reset-confirm", RequestOptions::post().json(&body)?)
            .await
    }

    pub async fn request_magic_link(&self, email: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                "/api/auth/magic-link/request",
                RequestOptions::post().json(&EmailRequest { email })?,
            )
            .await
    }

    pub async fn verify_magic_link(&self, token: &str) -> Result<LoginResponse, ApiError> {
        let response: LoginResponse = self
            .pipeline
            .send_as(
                "/api/auth/magic-link/verify",
                RequestOptions::post().json(&TokenRequest { token })?,
            )
            .await?;
        self.establish_session(&response)?;
        Ok(response)
    }

    // ===== Two-factor authentication =====

    pub async fn setup_2fa(&self) -> Result<Value, ApiError> {
        self.pipeline.send_value("/api/2fa/setup", RequestOptions::post()).await
    }

    pub async fn verify_2fa(&self, code: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/2fa/verify", RequestOptions::post().json(&TwoFactorCode { code })?)
            .await
    }

    pub async fn disable_2fa(&self, code: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/2fa/disable", RequestOptions::post().json(&TwoFactorCode { code })?)
            .await
    }

    // ===== Admin: users =====

    pub async fn list_users(&self, skip: u32, limit: u32) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/admin/users",
            &[("skip", Some(skip.to_string())), ("limit", Some(limit.to_string()))],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/admin/users/{}", user_id), RequestOptions::get())
            .await
    }

    pub async fn update_user<T: Serialize + ?Sized>(
        &self,
        user_id: i64,
        data: &T,
    ) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/admin/users/{}", user_id),
                RequestOptions::patch().json(data)?,
            )
            .await
    }

    pub async fn delete_user(&self, user_id: i64) -> Result<Option<Value>, ApiError> {
        self.pipeline
            .send(&format!("/api/admin/users/{}", user_id), RequestOptions::delete())
            .await
    }

    pub async fn send_test_email(
        &self,
        email: &str,
        email_type: &str,
        user_name: Option<&str>,
    ) -> Result<Value, ApiError> {
        let body = TestEmailRequest {
            email,
            email_type,
            user_name,
        };
        self.pipeline
            .send_value("/api/admin/test-email", RequestOptions::post().json(&body)?)
            .await
    }

    // ===== Admin: projects =====

    pub async fn admin_list_projects(
        &self,
        status: Option<&str>,
        project_type: Option<&str>,
        skip: u32,
        limit: u32,
    ) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/admin/projects",
            &[
                ("skip", Some(skip.to_string())),
                ("limit", Some(limit.to_string())),
                ("status", status.map(str::to_string)),
                ("project_type", project_type.map(str::to_string)),
            ],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn admin_get_project(&self, project_id: i64) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/admin/projects/{}", project_id), RequestOptions::get())
            .await
    }

    pub async fn admin_update_project<T: Serialize + ?Sized>(
        &self,
        project_id: i64,
        data: &T,
    ) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/admin/projects/{}", project_id),
                RequestOptions::patch().json(data)?,
            )
            .await
    }

    pub async fn admin_delete_project(&self, project_id: i64) -> Result<Option<Value>, ApiError> {
        self.pipeline
            .send(&format!("/api/admin/projects/{}", project_id), RequestOptions::delete())
            .await
    }

    // ===== Projects =====

    pub async fn suggest_slug(&self, title: &str) -> Result<Value, ApiError> {
        let url = with_query("/api/projects/suggest-slug", &[("title", Some(title.to_string()))]);
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn create_project<T: Serialize + ?Sized>(&self, data: &T) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/projects", RequestOptions::post().json(data)?)
            .await
    }

    pub async fn list_projects(
        &self,
        status: Option<&str>,
        skip: u32,
        limit: u32,
    ) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/projects",
            &[
                ("skip", Some(skip.to_string())),
                ("limit", Some(limit.to_string())),
                ("status", status.map(str::to_string)),
            ],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn list_my_projects(&self) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/projects/my-projects", RequestOptions::get())
            .await
    }

    pub async fn get_project(&self, slug: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/projects/{}", slug), RequestOptions::get())
            .await
    }

    pub async fn update_project<T: Serialize + ?Sized>(
        &self,
        slug: &str,
        data: &T,
    ) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/projects/{}", slug), RequestOptions::put().json(data)?)
            .await
    }

    /// Returns `None`: the backend answers 204
    pub async fn delete_project(&self, slug: &str) -> Result<Option<Value>, ApiError> {
        self.pipeline
            .send(&format!("/api/projects/{}", slug), RequestOptions::delete())
            .await
    }

    pub async fn submit_project(&self, slug: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/projects/{}/submit", slug), RequestOptions::post())
            .await
    }

    pub async fn duplicate_project(&self, slug: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/projects/{}/duplicate", slug), RequestOptions::post())
            .await
    }

    pub async fn list_featured_projects(&self, limit: u32) -> Result<Value, ApiError> {
        let url = with_query("/api/projects/featured", &[("limit", Some(limit.to_string()))]);
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn list_near_goal_projects(
        &self,
        min_percentage: u32,
        limit: u32,
    ) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/projects/near-goal",
            &[
                ("min_percentage", Some(min_percentage.to_string())),
                ("limit", Some(limit.to_string())),
            ],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    // ===== Public profiles =====

    pub async fn get_public_profile(&self, profile_slug: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/profiles/{}", profile_slug), RequestOptions::get())
            .await
    }

    pub async fn successful_starters(&self, limit: u32) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/profiles/starters/successful",
            &[("limit", Some(limit.to_string()))],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    pub async fn all_starters(&self, skip: u32, limit: u32) -> Result<Value, ApiError> {
        let url = with_query(
            "/api/profiles/starters/all",
            &[("skip", Some(skip.to_string())), ("limit", Some(limit.to_string()))],
        );
        self.pipeline.send_value(&url, RequestOptions::get()).await
    }

    // ===== AI coach =====

    pub async fn ai_settings(&self) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/ai-coach/settings", RequestOptions::get())
            .await
    }

    pub async fn ai_generate(
        &self,
        message: &str,
        thread_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Value, ApiError> {
        let body = AiGenerateRequest {
            message,
            thread_id,
            session_id,
        };
        self.pipeline
            .send_value("/api/ai-coach/generate", RequestOptions::post().json(&body)?)
            .await
    }

    pub async fn ai_thread(&self, thread_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/ai-coach/threads/{}", thread_id), RequestOptions::get())
            .await
    }

    pub async fn ai_threads(&self) -> Result<Value, ApiError> {
        self.pipeline
            .send_value("/api/ai-coach/threads", RequestOptions::get())
            .await
    }

    /// Attach an anonymous thread to the signed-in user
    pub async fn claim_ai_thread(&self, thread_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/ai-coach/threads/{}/claim", thread_id),
                RequestOptions::post(),
            )
            .await
    }

    pub async fn ai_draft(&self, thread_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(&format!("/api/ai-coach/drafts/{}", thread_id), RequestOptions::get())
            .await
    }

    pub async fn generate_ai_draft(&self, thread_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/ai-coach/drafts/generate/{}", thread_id),
                RequestOptions::post(),
            )
            .await
    }

    pub async fn update_ai_draft<T: Serialize + ?Sized>(
        &self,
        thread_id: &str,
        data: &T,
    ) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/ai-coach/drafts/{}", thread_id),
                RequestOptions::patch().json(data)?,
            )
            .await
    }

    pub async fn convert_ai_draft(&self, thread_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send_value(
                &format!("/api/ai-coach/drafts/{}/convert", thread_id),
                RequestOptions::post(),
            )
            .await
    }

    /// Identifier for anonymous AI-coach conversations, created on first use
    pub fn ai_session_id(&self) -> Result<String, ApiError> {
        let store = self.session().store();
        if let Some(existing) = store.get(AI_SESSION_ID_KEY) {
            return Ok(existing);
        }
        let id = format!("session-{}", random_uuid_v4());
        store.set(AI_SESSION_ID_KEY, &id)?;
        Ok(id)
    }

    // ===== Stored state =====

    pub fn stored_user(&self) -> Option<UserSummary> {
        self.session().user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_authenticated()
    }

    pub fn is_admin(&self) -> bool {
        self.session().is_admin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, SESSION_TOKEN_KEY, TOKEN_KEY, USER_KEY};
    use crate::testutil::{pipeline_over, request_path, respond, signed_in_store, FakeTransport};
    use reqwest::Method;
    use serde_json::json;

    fn client_over(store: Arc<MemoryStore>, transport: Arc<FakeTransport>) -> ApiClient {
        let (_, pipeline) = pipeline_over(store, transport);
        ApiClient::new(pipeline)
    }

    #[test]
    fn test_with_query_encodes_and_skips() {
        assert_eq!(with_query("/api/projects", &[]), "/api/projects");
        assert_eq!(
            with_query(
                "/api/projects",
                &[("skip", Some("0".into())), ("status", None), ("limit", Some("20".into()))]
            ),
            "/api/projects?skip=0&limit=20"
        );
        assert_eq!(
            with_query("/api/projects/suggest-slug", &[("title", Some("Café & Co".into()))]),
            "/api/projects/suggest-slug?title=Caf%C3%A9%20%26%20Co"
        );
    }

    #[tokio::test]
    async fn test_login_establishes_session() {
        let store = Arc::new(MemoryStore::new());
        let transport = FakeTransport::new(|_| {
            respond(200, r#"{"access_token":"abc","user":{"id":1,"is_admin":false}}"#)
        });
        let client = client_over(store.clone(), transport.clone());

        let response = client.login("ada@example.org", "hunter22", None).await.unwrap();

        assert_eq!(response.access_token, "abc");
        let record = client.session().snapshot();
        assert!(record.is_authenticated);
        assert!(!record.is_admin());
        assert_eq!(record.user.map(|u| u.id), Some(1));
        assert_eq!(store.get(TOKEN_KEY).as_deref(), Some("abc"));
        assert!(store.get(SESSION_TOKEN_KEY).is_none());

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, Method::POST);
        let body: Value = serde_json::from_str(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(
            body,
            json!({"email": "ada@example.org", "password": "hunter22", "two_factor_code": null})
        );
    }

    #[tokio::test]
    async fn test_login_stores_session_token_when_present() {
        let store = Arc::new(MemoryStore::new());
        let transport = FakeTransport::new(|_| {
            respond(
                200,
                r#"{"access_token":"abc","session_token":"sess","user":{"id":2,"is_admin":true}}"#,
            )
        });
        let client = client_over(store.clone(), transport);

        client.login("root@example.org", "pw", Some("123456")).await.unwrap();

        assert_eq!(store.get(SESSION_TOKEN_KEY).as_deref(), Some("sess"));
        assert!(client.is_admin());
    }

    #[tokio::test]
    async fn test_login_without_session_token_drops_previous_one() {
        let store = signed_in_store("old");
        let transport = FakeTransport::new(|_| {
            respond(200, r#"{"access_token":"abc","user":{"id":2,"is_admin":false}}"#)
        });
        let client = client_over(store.clone(), transport);

        client.login("grace@example.org", "pw", None).await.unwrap();

        assert_eq!(client.stored_user().map(|u| u.id), Some(2));
        assert_eq!(store.get(TOKEN_KEY).as_deref(), Some("abc"));
        assert!(store.get(SESSION_TOKEN_KEY).is_none());
    }

    #[test]
    fn test_random_uuid_v4_is_unique() {
        assert_ne!(random_uuid_v4(), random_uuid_v4());
    }

    #[tokio::test]
    async fn test_login_needing_two_factor_code() {
        let transport = FakeTransport::new(|_| {
            respond(403, r#"{"detail":"Two-factor authentication code required"}"#)
        });
        let client = client_over(Arc::new(MemoryStore::new()), transport);

        let err = client.login("ada@example.org", "pw", None).await.unwrap_err();

        assert_eq!(err.status(), Some(403));
        assert_eq!(err.to_string(), "Two-factor authentication code required");
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_verify_magic_link_establishes_session() {
        let store = Arc::new(MemoryStore::new());
        let transport = FakeTransport::new(|_| {
            respond(200, r#"{"access_token":"link","user":{"id":3}}"#)
        });
        let client = client_over(store.clone(), transport.clone());

        client.verify_magic_link("tok123").await.unwrap();

        assert!(client.is_authenticated());
        assert_eq!(store.get(TOKEN_KEY).as_deref(), Some("link"));
        assert_eq!(
            request_path(&transport.requests()[0]),
            "/api/auth/magic-link/verify"
        );
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_remote_fails() {
        let store = signed_in_store("abc");
        let transport = FakeTransport::new(|_| Err(ApiError::NetworkError("offline".into())));
        let client = client_over(store.clone(), transport);
        assert!(client.is_authenticated());

        let result = client.logout().await;

        assert!(matches!(result, Err(ApiError::NetworkError(_))));
        assert!(!client.is_authenticated());
        assert!(store.get(TOKEN_KEY).is_none());
        assert!(store.get(USER_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_logout_still_clears() {
        let store = signed_in_store("abc");
        let transport = FakeTransport::with_delay(std::time::Duration::from_secs(30), |_| {
            respond(200, "{}")
        });
        let client = client_over(store.clone(), transport);

        let outcome =
            tokio::time::timeout(std::time::Duration::from_secs(1), client.logout()).await;

        assert!(outcome.is_err());
        assert!(!client.is_authenticated());
        assert!(store.get(TOKEN_KEY).is_none());
    }

    #[tokio::test]
    async fn test_logout_success() {
        let store = signed_in_store("abc");
        let transport = FakeTransport::new(|_| respond(200, r#"{"message":"Successfully logged out"}"#));
        let client = client_over(store.clone(), transport);

        client.logout().await.unwrap();

        assert!(!client.is_authenticated());
        assert!(store.get(SESSION_TOKEN_KEY).is_none());
    }

    #[tokio::test]
    async fn test_delete_project_returns_none() {
        let transport = FakeTransport::new(|_| respond(204, ""));
        let client = client_over(signed_in_store("abc"), transport.clone());

        assert!(client.delete_project("solar-roof").await.unwrap().is_none());

        let sent = &transport.requests()[0];
        assert_eq!(sent.method, Method::DELETE);
        assert_eq!(request_path(sent), "/api/projects/solar-roof");
    }

    #[tokio::test]
    async fn test_admin_list_projects_query() {
        let transport = FakeTransport::new(|_| respond(200, "[]"));
        let client = client_over(signed_in_store("abc"), transport.clone());

        client
            .admin_list_projects(Some("pending"), None, 0, DEFAULT_ADMIN_PAGE)
            .await
            .unwrap();

        assert_eq!(
            transport.requests()[0].url,
            "http://fundflow.test/api/admin/projects?skip=0&limit=100&status=pending"
        );
    }

    #[test]
    fn test_ai_session_id_is_stable() {
        let transport = FakeTransport::new(|_| respond(200, "{}"));
        let store = Arc::new(MemoryStore::new());
        let client = client_over(store.clone(), transport);

        let first = client.ai_session_id().unwrap();
        let second = client.ai_session_id().unwrap();

        let uuid = first.strip_prefix("session-").unwrap();
        let groups: Vec<&str> = uuid.split('-').collect();
        assert_eq!(
            groups.iter().map(|g| g.len()).collect::<Vec<_>>(),
            vec![8, 4, 4, 4, 12]
        );
        assert!(groups[2].starts_with('4'));
        assert!(matches!(groups[3].chars().next(), Some('8' | '9' | 'a' | 'b')));
        assert_eq!(first, second);
        assert_eq!(store.get(AI_SESSION_ID_KEY), Some(first));
    }
}
