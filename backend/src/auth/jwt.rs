use super::models::Claims;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
#[cfg(test)]
use {
    super::models::AuthUser,
    chrono::Duration,
    jsonwebtoken::{EncodingKey, Header, encode},
};

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[cfg(test)]
    #[error("JWT encoding error: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("JWT decoding error: {0}")]
    Decoding(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Token expired")]
    TokenExpired,
}

#[derive(Clone)]
/// Verifies tokens issued by the identity service. Issuing is only needed
/// by tests.
pub struct JwtService {
    #[cfg(test)]
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        Self {
            #[cfg(test)]
            encoding_key: EncodingKey::from_secret(secret.as_ref()),
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    #[cfg(test)]
    pub fn generate_token(&self, user: &AuthUser) -> Result<String, JwtError> {
        self.generate_token_valid_for(user, Duration::hours(24))
    }

    #[cfg(test)]
    fn generate_token_valid_for(&self, user: &AuthUser, lifetime: Duration) -> Result<String, JwtError> {
        let now = Utc::now();
        let expiration = now + lifetime;

        let claims = Claims {
            sub: user.id.clone(),
            name: user.name.clone(),
            role: user.role,
            exp: expiration.timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
        };

        let header = Header::new(Algorithm::HS256);
        encode(&header, &claims, &self.encoding_key).map_err(JwtError::Encoding)
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, JwtError> {
        if token.is_empty() {
            return Err(JwtError::InvalidToken);
        }

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(JwtError::InvalidToken);
        }

        let validation = Validation::new(Algorithm::HS256);

        match decode::<Claims>(token, &self.decoding_key, &validation) {
            Ok(token_data) => {
                let now = Utc::now().timestamp().max(0) as usize;
                log::debug!(
                    "JWT token decoded successfully. User: {}, Role: {}, Exp: {}, Now: {}",
                    token_data.claims.sub,
                    token_data.claims.role,
                    token_data.claims.exp,
                    now
                );

                if token_data.claims.exp < now {
                    log::warn!(
                        "JWT token expired. Exp: {}, Now: {}",
                        token_data.claims.exp,
                        now
                    );
                    return Err(JwtError::TokenExpired);
                }
                if token_data.claims.sub.trim().is_empty() {
                    return Err(JwtError::InvalidToken);
                }
                Ok(token_data.claims)
            }
            Err(err) => {
                log::warn!("JWT token decode error: {:?}", err);
                match err.kind() {
                    jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                        Err(JwtError::TokenExpired)
                    }
                    jsonwebtoken::errors::ErrorKind::InvalidToken => Err(JwtError::InvalidToken),
                    jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                        Err(JwtError::InvalidToken)
                    }
                    _ => Err(JwtError::Decoding(err.to_string())),
                }
            }
        }
    }
}
