//! Demo broker - Admin authentication and connection parameter parsing
//!
//! Security invariant: the admin token and session tokens are never logged.

use tracing::warn;

/// Result of checking a bearer token against the configured admin token.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminAuthResult {
    Authenticated,
    /// Admin surface is disabled entirely (no token configured).
    NotConfigured,
    Failed(AdminAuthError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminAuthError {
    MissingToken,
    InvalidToken,
}

/// Authenticate an admin HTTP request's `Authorization: Bearer <token>` header.
pub fn authenticate_admin(configured_token: &Option<String>, auth_header: Option<&str>) -> AdminAuthResult {
    let expected = match configured_token {
        Some(t) => t,
        None => return AdminAuthResult::NotConfigured,
    };

    let provided = match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) => token.trim(),
            None => {
                warn!("admin auth failed: malformed Authorization header");
                return AdminAuthResult::Failed(AdminAuthError::InvalidToken);
            }
        },
        None => {
            warn!("admin auth failed: missing Authorization header");
            return AdminAuthResult::Failed(AdminAuthError::MissingToken);
        }
    };

    if provided == expected {
        AdminAuthResult::Authenticated
    } else {
        warn!("admin auth failed: invalid token");
        AdminAuthResult::Failed(AdminAuthError::InvalidToken)
    }
}

/// Extract a `token` query parameter presented at WS upgrade time, used by
/// a reconnecting client to rebind to its existing session.
pub fn parse_session_token_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "token" {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Extract the caller's remote address from a forwarded-for header, per
/// spec §4.1: "first forwarded-for header token, else socket peer".
pub fn remote_address_from_forwarded_for(header: Option<&str>) -> Option<std::net::IpAddr> {
    header?.split(',').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_auth_not_configured_when_no_token_set() {
        assert_eq!(authenticate_admin(&None, None), AdminAuthResult::NotConfigured);
    }

    #[test]
    fn admin_auth_succeeds_with_matching_bearer() {
        let configured = Some("opstoken".to_string());
        assert_eq!(authenticate_admin(&configured, Some("Bearer opstoken")), AdminAuthResult::Authenticated);
    }

    #[test]
    fn admin_auth_fails_on_missing_header() {
        let configured = Some("opstoken".to_string());
        assert_eq!(authenticate_admin(&configured, None), AdminAuthResult::Failed(AdminAuthError::MissingToken));
    }

    #[test]
    fn admin_auth_fails_on_wrong_token() {
        let configured = Some("opstoken".to_string());
        assert_eq!(
            authenticate_admin(&configured, Some("Bearer wrong")),
            AdminAuthResult::Failed(AdminAuthError::InvalidToken)
        );
    }

    #[test]
    fn parse_session_token_param_finds_token() {
        assert_eq!(parse_session_token_param(Some("token=abc123")), Some("abc123".to_string()));
    }

    #[test]
    fn parse_session_token_param_absent_returns_none() {
        assert_eq!(parse_session_token_param(Some("other=1")), None);
        assert_eq!(parse_session_token_param(None), None);
    }

    #[test]
    fn remote_address_uses_first_forwarded_for_token() {
        let addr = remote_address_from_forwarded_for(Some("203.0.113.5, 10.0.0.1"));
        assert_eq!(addr, Some("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn remote_address_falls_back_to_none_when_absent() {
        assert_eq!(remote_address_from_forwarded_for(None), None);
    }
}
