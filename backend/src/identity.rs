use axum::http::HeaderMap;
use draw_core::Identity;
use thiserror::Error;

use crate::config::Config;

pub const ADMIN_PASSWORD_HEADER: &str = "x-admin-password";
pub const AGENT_NAME_HEADER: &str = "x-agent-name";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid admin password")]
    NotAdmin,
}

pub fn identify(headers: &HeaderMap, config: &Config) -> Identity {
    let password = header(headers, ADMIN_PASSWORD_HEADER);
    if password == Some(config.admin_password.as_str()) {
        return Identity::admin();
    }

    let name = header(headers, AGENT_NAME_HEADER).map(str::trim).unwrap_or_default();
    Identity::participant(name)
}

pub fn require_admin(headers: &HeaderMap, config: &Config) -> Result<Identity, AuthError> {
    let identity = identify(headers, config);
    if identity.is_admin() {
        Ok(identity)
    } else {
        Err(AuthError::NotAdmin)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
