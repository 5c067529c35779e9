//! Response types for the image server

use hybrid_cache::CacheStats;
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub caching: bool,
    pub cache: CacheStats,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "ok".to_string(),
            uptime_secs: 3600,
            caching: true,
            cache: CacheStats {
                entries: 100,
                total_size: 50_000_000,
                hits: 500,
                misses: 50,
                ..CacheStats::default()
            },
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("3600"));
        assert!(json.contains("50000000"));
        assert!(json.contains("\"caching\":true"));
    }

    #[test]
    fn test_error_response_serialization() {
        let json = serde_json::to_string(&ErrorResponse {
            error: "Not found: /missing.png".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"error":"Not found: /missing.png"}"#);
    }
}
