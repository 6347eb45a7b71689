//! Errors returned by the external service adapters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid upstream response: {0}")]
    Invalid(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Build an [`GatewayError::Upstream`] from a non-success response,
    /// keeping at most 500 characters of the body.
    pub async fn from_response(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        GatewayError::Upstream {
            status,
            body: body.chars().take(500).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_resource() {
        let e = GatewayError::NotFound("blob 'a.txt'".into());
        assert_eq!(e.to_string(), "not found: blob 'a.txt'");
    }

    #[test]
    fn upstream_display_includes_status() {
        let e = GatewayError::Upstream {
            status: 503,
            body: "busy".into(),
        };
        assert!(e.to_string().contains("503"));
        assert!(e.to_string().contains("busy"));
    }
}
