use thiserror::Error;

/// Errors from the exchange REST adapter
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Binance API error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("API credentials missing (set BINANCE_API_KEY and BINANCE_API_SECRET)")]
    MissingCredentials,

    #[error("Failed to sign request: {0}")]
    Signing(String),
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ExchangeError::Timeout
        } else {
            ExchangeError::Http(e)
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(e: serde_json::Error) -> Self {
        ExchangeError::Parse(e.to_string())
    }
}

impl ExchangeError {
    /// Build an error from a non-2xx response
    ///
    /// Binance reports failures as `{"code": -1121, "msg": "Invalid symbol."}`.
    pub fn from_response(status: u16, body: &str) -> Self {
        #[derive(serde::Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(err) => ExchangeError::Api {
                code: err.code,
                message: err.msg,
            },
            Err(_) => ExchangeError::Status {
                status,
                body: body.to_string(),
            },
        }
    }

    /// Transient faults are worth retrying; everything else is final
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout => true,
            ExchangeError::Http(e) => e.is_connect() || e.is_request(),
            ExchangeError::Status { status, .. } => *status == 429 || *status >= 500,
            // -1000 unknown, -1001 disconnected, -1003 too many requests
            ExchangeError::Api { code, .. } => matches!(code, -1000 | -1001 | -1003 | -1015),
            _ => false,
        }
    }
}
