use axum::{
    extract::{Request, State},
    http::HeaderName,
    middleware::Next,
    response::Response,
};
use serde::Deserialize;
use tracing::debug;

/// Identity established upstream of the socket handler. Only middleware
/// inserts it; clients never set it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedIdentity(pub String);

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub user: Option<String>,
}

/// Header set by an authenticating proxy in front of the hub.
#[derive(Debug, Clone)]
pub struct TrustedHeader(pub Option<HeaderName>);

pub async fn trust_identity_header(
    State(header): State<TrustedHeader>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(name) = header.0.as_ref() {
        let identity = request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        if let Some(identity) = identity {
            debug!(event = "identity_header", header = %name, identity = %identity);
            request
                .extensions_mut()
                .insert(AuthenticatedIdentity(identity));
        }
    }
    next.run(request).await
}

/// Upstream identity first; the query parameter only in development mode;
/// otherwise anonymous.
pub fn resolve_identity(
    authenticated: Option<&AuthenticatedIdentity>,
    query_user: Option<&str>,
    dev_identity: bool,
) -> String {
    if let Some(AuthenticatedIdentity(identity)) = authenticated {
        return identity.clone();
    }
    if dev_identity {
        if let Some(user) = query_user.map(str::trim).filter(|user| !user.is_empty()) {
            return user.to_string();
        }
    }
    String::new()
}

/// Requests without an `Origin` are non-browser clients. With no configured
/// origins only same-host browser origins pass.
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin.map(str::trim).filter(|value| !value.is_empty()) else {
        return true;
    };
    let origin = origin.trim_end_matches('/');
    if allowed.iter().any(|entry| entry == "*") {
        return true;
    }
    if allowed
        .iter()
        .any(|entry| entry.trim_end_matches('/').eq_ignore_ascii_case(origin))
    {
        return true;
    }
    match host {
        Some(host) if allowed.is_empty() => origin_authority(origin).eq_ignore_ascii_case(host.trim()),
        _ => false,
    }
}

fn origin_authority(origin: &str) -> &str {
    origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
}
