//! Authentication and priority classification

use crate::ApiError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use linkstream_core::PriorityClass;
use linkstream_upstream::Authorizer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time
    pub exp: i64,
    /// Issued at
    pub iat: Option<i64>,
    /// Issuer
    pub iss: Option<String>,
    /// Name
    pub name: Option<String>,
}

/// Who is asking; inserted into request extensions by the identity middleware
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// `sub` of a valid token, or `ip:<addr>` for anonymous requests
    pub user_id: String,
    pub authenticated: bool,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            authenticated: true,
        }
    }

    /// Anonymous identity keyed by the peer address
    pub fn anonymous(peer: Option<SocketAddr>) -> Self {
        let user_id = match peer {
            Some(addr) => format!("ip:{}", addr.ip()),
            None => "anonymous".to_string(),
        };
        Self {
            user_id,
            authenticated: false,
        }
    }
}

/// Validate a JWT token and extract claims
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::debug!("Token validation failed: {}", e);
            ApiError::unauthorized("Invalid or expired token")
        })
}

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .or_else(|| auth_header.strip_prefix("bearer "))
}

/// Maps identities to admission priority classes
pub struct Classifier {
    owners: HashSet<String>,
}

impl Classifier {
    pub fn new<I, S>(owner_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            owners: owner_ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Owners first, then the authorized list; anonymous requests and
    /// authorizer failures are `regular`
    pub async fn classify(&self, identity: &Identity, authorizer: &dyn Authorizer) -> PriorityClass {
        if !identity.authenticated {
            return PriorityClass::Regular;
        }
        if self.owners.contains(&identity.user_id) {
            return PriorityClass::Owner;
        }
        match authorizer.is_authorized(&identity.user_id).await {
            Ok(true) => PriorityClass::Authorized,
            Ok(false) => PriorityClass::Regular,
            Err(e) => {
                tracing::warn!(user_id = %identity.user_id, error = %e, "authorizer failed, treating user as regular");
                PriorityClass::Regular
            }
        }
    }
}
