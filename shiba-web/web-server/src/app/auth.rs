use std::env;

use actix_web::{
    FromRequest, HttpRequest,
    dev::Payload,
    http::header::{AUTHORIZATION, HeaderValue},
    web::Data,
};
use common::config::AuthConfig;
use futures::future::{Ready, ready};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::{App, AppError};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no jwt secret is configured, set auth.jwt_secret or JWT_SECRET")]
    MissingSecret,
    #[error("the request carries no token")]
    MissingToken,
    #[error("the authorization header is not a bearer")]
    AuthorizationNotBearer,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: u64,
}

/// Validates tokens issued by the account service, which shares the secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    cookie_name: String,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let secret = if config.jwt_secret.is_empty() {
            env::var("JWT_SECRET").unwrap_or_default()
        } else {
            config.jwt_secret.clone()
        };
        if secret.is_empty() {
            return Err(AuthError::MissingSecret);
        }

        Ok(Self::with_secret(config, secret.as_bytes()))
    }

    pub fn with_secret(config: &AuthConfig, secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_audience(&[&config.audience]);

        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            cookie_name: config.cookie_name.clone(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Returns the user id carried in the token's subject
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;

        Ok(data.claims.sub)
    }

    pub fn authenticate(&self, request: &HttpRequest) -> Result<String, AuthError> {
        let token = match request.cookie(&self.cookie_name) {
            Some(cookie) => cookie.value().to_string(),
            None => bearer_token(request.headers().get(AUTHORIZATION))?,
        };

        self.verify(&token)
    }
}

fn bearer_token(header: Option<&HeaderValue>) -> Result<String, AuthError> {
    let header = header.ok_or(AuthError::MissingToken)?;

    header
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or(AuthError::AuthorizationNotBearer)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let Some(app) = request.app_data::<Data<App>>() else {
            return ready(Err(AppError::AppDestroyed));
        };

        let result = match app.verifier().authenticate(request) {
            Ok(user_id) => Ok(Self { user_id }),
            Err(err) => {
                debug!("[Auth]: rejected {}: {err}", request.path());
                Err(AppError::Unauthorized(err))
            }
        };

        ready(result)
    }
}
