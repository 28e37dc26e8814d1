use axum::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

/// Subjects issued by the identity service may be numeric or opaque strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum Subject {
    Text(String),
    Number(i64),
}

impl Subject {
    fn into_owner_id(self) -> String {
        match self {
            Subject::Text(value) => value,
            Subject::Number(value) => value.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: Subject,
    #[serde(default = "default_role")]
    role: String,
    #[allow(dead_code)]
    exp: usize,
}

fn default_role() -> String {
    "user".to_string()
}

/// The JWT subject is the billing owner reference.
pub struct AuthUser {
    pub owner_id: String,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, String);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token_opt = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("auth_token=").map(|s| s.to_string())
            })
        } else if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        } else {
            None
        };
        let token = token_opt.ok_or((StatusCode::UNAUTHORIZED, "Missing token".into()))?;
        let secret = crate::config::JWT_SECRET.as_str();
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| (StatusCode::UNAUTHORIZED, "Invalid token".into()))?;
        let owner_id = decoded.claims.sub.into_owner_id();
        if owner_id.trim().is_empty() {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".into()));
        }
        Ok(AuthUser {
            owner_id,
            role: decoded.claims.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(claims: serde_json::Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"secret")).unwrap()
    }

    #[tokio::test]
    async fn owner_parsed_from_bearer_header() {
        std::env::set_var("JWT_SECRET", "secret");
        let token = token(serde_json::json!({"sub": "org_42", "role": "admin", "exp": 9999999999u64}));
        let request = Request::builder()
            .header("Authorization", format!("Bearer {}", token))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.owner_id, "org_42");
        assert!(user.is_admin());
    }

    #[tokio::test]
    async fn numeric_subject_and_cookie() {
        std::env::set_var("JWT_SECRET", "secret");
        let token = token(serde_json::json!({"sub": 7, "exp": 9999999999u64}));
        let request = Request::builder()
            .header("Cookie", format!("theme=dark; auth_token={}", token))
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let user = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(user.owner_id, "7");
        assert_eq!(user.role, "user");
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        std::env::set_var("JWT_SECRET", "secret");
        let request = Request::builder()
            .header("Authorization", "Bearer invalid")
            .body(axum::body::Body::empty())
            .unwrap();
        let mut parts = request.into_parts().0;
        let res = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(res.is_err());
    }
}
