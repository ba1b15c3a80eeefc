use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

use actix_web::{
    body::{BoxBody, MessageBody},
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http, web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use chrono::{DateTime, Duration, Utc};
use futures::future::{ok, ready, Ready};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};

use crate::clock::from_millis;
use crate::error::{AuthError, ChatError};

/// Response header telling a rejected client why its handshake failed.
pub const AUTH_ERROR_HEADER: &str = "x-auth-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Manager,
    #[serde(other)]
    Member,
}

impl Role {
    /// Whether the role receives tenant-wide admin notifications.
    pub fn is_admin_capable(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: String,
    pub role: Role,
    pub exp: usize,
}

/// Who a verified bearer token speaks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        JwtVerifier {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;
        let claims = data.claims;
        let expires_at = from_millis(claims.exp as i64 * 1000)
            .ok_or_else(|| AuthError::Invalid("exp out of range".into()))?;
        Ok(Identity {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            role: claims.role,
            expires_at,
        })
    }
}

/// Mints an HS256 token. Issuance belongs to the auth service; this exists
/// for local tooling and tests.
pub fn issue_token(
    user_id: &str,
    tenant_id: &str,
    role: Role,
    ttl: Duration,
    secret: &str,
) -> Result<String, AuthError> {
    let expiration = Utc::now() + ttl;
    let claims = Claims {
        sub: user_id.to_string(),
        tenant_id: tenant_id.to_string(),
        role,
        exp: expiration.timestamp().max(0) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

/// Pulls the token from `Authorization: Bearer ...`, falling back to a
/// `token` query parameter (browsers cannot set headers on a WebSocket
/// upgrade).
pub fn bearer_token(req: &HttpRequest) -> Option<String> {
    if let Some(value) = req.headers().get(http::header::AUTHORIZATION) {
        if let Ok(auth_str) = value.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    web::Query::<TokenQuery>::from_query(req.query_string())
        .ok()
        .map(|q| q.into_inner().token)
}

impl FromRequest for Identity {
    type Error = ChatError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Identity>()
                .cloned()
                .ok_or(ChatError::Unauthorized(AuthError::Missing)),
        )
    }
}

/// A 401 carrying the failure code both in the JSON body and in the
/// [`AUTH_ERROR_HEADER`] header, so clients can tell expiry from other
/// rejections before parsing anything.
pub fn unauthorized(err: &AuthError) -> HttpResponse {
    let mut resp = ChatError::Unauthorized(err.clone()).error_response();
    resp.headers_mut().insert(
        http::header::HeaderName::from_static(AUTH_ERROR_HEADER),
        http::header::HeaderValue::from_static(err.code()),
    );
    resp
}

/// Verifies `Authorization: Bearer` headers and stores the [`Identity`] in
/// request extensions. Requests without the header pass through; handlers
/// that need an identity reject them when extracting it.
#[derive(Clone)]
pub struct Authentication {
    verifier: Arc<dyn TokenVerifier>,
}

impl Authentication {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Authentication { verifier }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Transform = AuthMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddleware {
            service: Rc::new(service),
            verifier: self.verifier.clone(),
        })
    }
}

pub struct AuthMiddleware<S> {
    service: Rc<S>,
    verifier: Arc<dyn TokenVerifier>,
}

impl<S, B> Service<ServiceRequest> for AuthMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<BoxBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let header_token = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string());

        if let Some(token) = header_token {
            match self.verifier.verify(&token) {
                Ok(identity) => {
                    req.extensions_mut().insert(identity);
                }
                Err(e) => {
                    log::debug!("rejecting request to {}: {}", req.path(), e);
                    let (req_parts, _payload) = req.into_parts();
                    let srv_resp = ServiceResponse::new(req_parts, unauthorized(&e));
                    return Box::pin(async move { Ok(srv_resp) });
                }
            }
        }

        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map_into_boxed_body())
        })
    }
}
