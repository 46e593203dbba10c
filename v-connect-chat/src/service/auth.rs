use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AuthConfigLite;
use crate::error::AuthError;

/// 鉴权通过的用户 / Authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthenticatedUser {
    #[serde(alias = "uid", alias = "id")]
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// 鉴权中心客户端 / Auth center client
///
/// `GET {center_url}/v1/sso/auth?token=...`
pub struct AuthCenterClient {
    http: reqwest::Client,
    center_url: String,
}

impl AuthCenterClient {
    pub fn new(cfg: &AuthConfigLite) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()?;
        Ok(Self {
            http,
            center_url: cfg.center_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Authenticator for AuthCenterClient {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let resp = self
            .http
            .get(format!("{}/v1/sso/auth", self.center_url))
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return resp.json::<AuthenticatedUser>().await.map_err(|e| {
                warn!("⚠️ auth center returned an unreadable body: {}", e);
                AuthError::Invalid
            });
        }
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!("auth center status {}", status)));
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(%status, "🔐 token rejected by auth center");
        if status == reqwest::StatusCode::UNAUTHORIZED && body.to_ascii_lowercase().contains("expired") {
            Err(AuthError::Expired)
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// 开发模式鉴权：令牌为 `uid` 或 `uid:username` / Dev mode, the token is `uid` or `uid:username`
#[derive(Debug, Default, Clone)]
pub struct DevAuthenticator;

#[async_trait]
impl Authenticator for DevAuthenticator {
    async fn validate(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let (user_id, username) = match token.split_once(':') {
            Some((uid, name)) => (uid.trim(), Some(name.trim().to_string())),
            None => (token, None),
        };
        if user_id.is_empty() {
            return Err(AuthError::Invalid);
        }
        Ok(AuthenticatedUser {
            user_id: user_id.to_string(),
            email: None,
            username: username.filter(|n| !n.is_empty()),
        })
    }
}

/// 从升级请求中取令牌：查询参数 `token` 优先，其次 Cookie `access_token`
/// Token from the upgrade request: `token` query parameter first, then the `access_token` cookie
pub fn extract_token(query: Option<&str>, cookie_header: Option<&str>) -> Option<String> {
    let from_query = query.and_then(|q| {
        reqwest::Url::parse(&format!("ws://localhost/?{}", q))
            .ok()?
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
    });
    from_query.filter(|t| !t.is_empty()).or_else(|| {
        cookie_header?
            .split(';')
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == "access_token")
            .map(|(_, value)| value.to_string())
            .filter(|t| !t.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dev_authenticator() {
        let auth = DevAuthenticator;
        let user = auth.validate("alice:Alice").await.unwrap();
        assert_eq!(user.user_id, "alice");
        assert_eq!(user.username.as_deref(), Some("Alice"));
        assert_eq!(auth.validate("bob").await.unwrap().username, None);
        assert_eq!(auth.validate("  ").await, Err(AuthError::Missing));
        assert_eq!(auth.validate(":x").await, Err(AuthError::Invalid));
    }

    #[test]
    fn test_extract_token() {
        assert_eq!(extract_token(Some("token=a%20b&x=1"), None).as_deref(), Some("a b"));
        assert_eq!(
            extract_token(None, Some("theme=dark; access_token=xyz")).as_deref(),
            Some("xyz")
        );
        assert_eq!(
            extract_token(Some("token="), Some("access_token=fallback")).as_deref(),
            Some("fallback")
        );
        assert_eq!(extract_token(Some("x=1"), None), None);
    }

    /// 单次响应的 HTTP 桩 / One-shot HTTP stub
    async fn stub(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{}", addr)
    }

    fn client(url: String) -> AuthCenterClient {
        AuthCenterClient::new(&AuthConfigLite {
            enabled: true,
            center_url: url,
            timeout_ms: 2000,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_auth_center_success_and_expiry() {
        let url = stub("200 OK", r#"{"uid":"u1","email":"u1@example.com","username":"one"}"#).await;
        let user = client(url).validate("tok").await.unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.email.as_deref(), Some("u1@example.com"));

        let url = stub("401 Unauthorized", r#"{"error":"token expired"}"#).await;
        assert_eq!(client(url).validate("tok").await, Err(AuthError::Expired));

        let url = stub("403 Forbidden", r#"{"error":"nope"}"#).await;
        assert_eq!(client(url).validate("tok").await, Err(AuthError::Invalid));
    }

    #[tokio::test]
    async fn test_auth_center_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = client(format!("http://{}", addr)).validate("tok").await;
        assert!(matches!(result, Err(AuthError::Unavailable(_))));
    }
}
