use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use signoff_core::approvals::{DirectoryError, IdentityDirectory};
use signoff_core::config::IdentityConfig;

/// Role lookups against the tenant's identity service:
/// `GET {base_url}/tenants/{tenant}/roles/{role}/members`.
pub struct HttpIdentityDirectory {
    client: Client,
    base_url: String,
    api_token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MembersPayload {
    Wrapped { members: Vec<Member> },
    Bare(Vec<Member>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Member {
    Email(String),
    Record { email: String },
}

impl Member {
    fn into_email(self) -> String {
        match self {
            Self::Email(email) | Self::Record { email } => email,
        }
    }
}

impl HttpIdentityDirectory {
    pub fn new(
        base_url: &str,
        api_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DirectoryError::Unavailable(format!("http client setup: {error}")))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), api_token })
    }

    /// `None` when no directory is configured.
    pub fn from_config(config: &IdentityConfig) -> Result<Option<Self>, DirectoryError> {
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(None);
        };
        Self::new(base_url, config.api_token.clone(), Duration::from_secs(config.timeout_secs))
            .map(Some)
    }

    fn members_url(&self, tenant_id: &str, role: &str) -> String {
        format!(
            "{}/tenants/{}/roles/{}/members",
            self.base_url,
            path_segment(tenant_id),
            path_segment(role)
        )
    }
}

fn path_segment(raw: &str) -> String {
    raw.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' | '@' => ch.to_string(),
            other => {
                let mut buffer = [0_u8; 4];
                other
                    .encode_utf8(&mut buffer)
                    .bytes()
                    .map(|byte| format!("%{byte:02X}"))
                    .collect::<String>()
            }
        })
        .collect()
}

#[async_trait]
impl IdentityDirectory for HttpIdentityDirectory {
    async fn role_members(
        &self,
        tenant_id: &str,
        role: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        let url = self.members_url(tenant_id, role);
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await.map_err(|error| {
            warn!(
                event_name = "identity.lookup.unreachable",
                tenant_id = %tenant_id,
                role = %role,
                error = %error,
                "identity directory request failed"
            );
            DirectoryError::Unavailable(error.to_string())
        })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(tenant_id = %tenant_id, role = %role, "role unknown to identity directory");
            return Ok(Vec::new());
        }
        if status.is_server_error() {
            return Err(DirectoryError::Unavailable(format!("directory returned {status}")));
        }
        if !status.is_success() {
            return Err(DirectoryError::Rejected {
                role: role.to_string(),
                reason: format!("directory returned {status}"),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|error| DirectoryError::Unavailable(format!("invalid response body: {error}")))?;
        let members = match serde_json::from_value::<MembersPayload>(payload) {
            Ok(MembersPayload::Wrapped { members }) | Ok(MembersPayload::Bare(members)) => members,
            Err(error) => {
                return Err(DirectoryError::Rejected {
                    role: role.to_string(),
                    reason: format!("unexpected members payload: {error}"),
                })
            }
        };

        Ok(members.into_iter().map(Member::into_email).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use signoff_core::approvals::{DirectoryError, IdentityDirectory};

    use super::{path_segment, HttpIdentityDirectory};

    async fn members(
        Path((tenant, role)): Path<(String, String)>,
        headers: HeaderMap,
    ) -> (StatusCode, Json<Value>) {
        let authorized = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == "Bearer directory-token");
        if !authorized {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing token"})));
        }
        match (tenant.as_str(), role.as_str()) {
            ("tenant-a", "manager") => {
                (StatusCode::OK, Json(json!({"members": ["mgr@example.com", "lead@example.com"]})))
            }
            ("tenant-a", "ciso") => (StatusCode::OK, Json(json!([{"email": "ciso@example.com"}]))),
            ("tenant-a", "broken") => (StatusCode::BAD_GATEWAY, Json(json!({}))),
            _ => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown role"}))),
        }
    }

    async fn directory(token: Option<&str>) -> HttpIdentityDirectory {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address");
        let app = Router::new().route("/tenants/{tenant}/roles/{role}/members", get(members));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        HttpIdentityDirectory::new(
            &format!("http://{address}/"),
            token.map(|token| token.to_string().into()),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn reads_wrapped_and_bare_member_lists() {
        let directory = directory(Some("directory-token")).await;

        let managers = directory.role_members("tenant-a", "manager").await.expect("managers");
        assert_eq!(managers, vec!["mgr@example.com", "lead@example.com"]);

        let cisos = directory.role_members("tenant-a", "ciso").await.expect("cisos");
        assert_eq!(cisos, vec!["ciso@example.com"]);
    }

    #[tokio::test]
    async fn unknown_role_has_no_members() {
        let directory = directory(Some("directory-token")).await;

        let members = directory.role_members("tenant-a", "auditor").await.expect("lookup");

        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn auth_and_upstream_failures_are_reported() {
        let directory_without_token = directory(None).await;
        let error = directory_without_token
            .role_members("tenant-a", "manager")
            .await
            .expect_err("unauthorized");
        assert!(matches!(error, DirectoryError::Rejected { .. }));

        let directory = directory(Some("directory-token")).await;
        let error = directory.role_members("tenant-a", "broken").await.expect_err("bad gateway");
        assert!(matches!(error, DirectoryError::Unavailable(_)));
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(path_segment("finance team/eu"), "finance%20team%2Feu");
        assert_eq!(path_segment("ops-lead"), "ops-lead");
    }
}
