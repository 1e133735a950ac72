//! Operator login: static credential check, HS256 bearer tokens.

use banfleet_api::orch::v1::auth::auth_service_server::AuthService;
use banfleet_api::orch::v1::auth::*;
use chrono::{Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};

const TOKEN_LIFETIME_MINUTES: i64 = 300;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user: String,
    nbf: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
pub struct OperatorCredentials {
    pub username: String,
    pub password: String,
    pub jwt_secret: String,
}

pub struct AuthGrpc {
    credentials: OperatorCredentials,
}

impl AuthGrpc {
    pub fn new(credentials: OperatorCredentials) -> Self {
        Self { credentials }
    }

    fn issue_token(&self, user: &str) -> Result<String, Status> {
        let now = Utc::now();
        let claims = Claims {
            user: user.to_string(),
            nbf: now.timestamp(),
            exp: (now + Duration::minutes(TOKEN_LIFETIME_MINUTES)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.credentials.jwt_secret.as_bytes()),
        )
        .map_err(|_| Status::internal("token generation failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};

    fn service() -> AuthGrpc {
        AuthGrpc::new(OperatorCredentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            jwt_secret: "secret".to_string(),
        })
    }

    #[test]
    fn issued_tokens_decode_and_carry_the_user() {
        let token = service().issue_token("admin").unwrap();
        let data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(data.claims.user, "admin");
        assert!(data.claims.exp > data.claims.nbf);
    }

    #[tokio::test]
    async fn login_rejects_bad_credentials() {
        let svc = service();
        let status = svc
            .login(Request::new(LoginRequest {
                username: "admin".to_string(),
                password: "wrong".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn login_requires_both_fields() {
        let svc = service();
        for (user, pass) in [("", "x"), ("x", "")] {
            let status = svc
                .login(Request::new(LoginRequest {
                    username: user.to_string(),
                    password: pass.to_string(),
                }))
                .await
                .unwrap_err();
            assert_eq!(status.code(), tonic::Code::InvalidArgument);
        }
    }
}

#[tonic::async_trait]
impl AuthService for AuthGrpc {
    async fn login(&self, request: Request<LoginRequest>) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        if req.username.is_empty() {
            return Err(Status::invalid_argument("username is required"));
        }
        if req.password.is_empty() {
            return Err(Status::invalid_argument("password is required"));
        }
        if req.username != self.credentials.username || req.password != self.credentials.password {
            return Err(Status::invalid_argument("bad username or password"));
        }

        let access_token = self.issue_token(&req.username)?;
        Ok(Response::new(LoginResponse { access_token }))
    }

    async fn me(&self, _request: Request<MeRequest>) -> Result<Response<MeResponse>, Status> {
        Ok(Response::new(MeResponse {
            id: "operator".to_string(),
            display_name: self.credentials.username.clone(),
            email: self.credentials.username.clone(),
            role: "admin".to_string(),
        }))
    }
}
