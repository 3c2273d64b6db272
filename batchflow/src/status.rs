//! HTTP status code families.

/// Server-error code returned to callers that must not retry the request.
///
/// BigQuery retries 408, 429, 500, 503 and 504 on its own, so a permanent
/// proxy failure is reported with a code outside that set.
pub const STATUS_INTERNAL_SERVER_ERROR_PERMANENT: u16 = 599;

/// 1xx
pub fn is_informational(status: u16) -> bool {
    (100..200).contains(&status)
}

/// 2xx
pub fn is_successful(status: u16) -> bool {
    (200..300).contains(&status)
}

/// 3xx
pub fn is_redirection(status: u16) -> bool {
    (300..400).contains(&status)
}

/// 4xx
pub fn is_client_error(status: u16) -> bool {
    (400..500).contains(&status)
}

/// 5xx, including the permanent sentinel.
pub fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}
