use once_cell::sync::Lazy;

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: billing-config -> scheduled billing run cadence
pub static BILLING_RUN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("BILLING_RUN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: billing-config -> default grace window for tenants without settings
pub static BILLING_GRACE_PERIOD_DAYS: Lazy<i32> = Lazy::new(|| {
    std::env::var("BILLING_GRACE_PERIOD_DAYS")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(7)
});

/// key: billing-config -> default failed-payment attempts before suspension
pub static BILLING_MAX_RETRIES: Lazy<i32> = Lazy::new(|| {
    std::env::var("BILLING_MAX_RETRIES")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(4)
});

/// Public base URL members are redirected back to after hosted checkout.
pub static PUBLIC_BASE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("PUBLIC_BASE_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://localhost:3000".to_string())
});

/// Optional delivery endpoint for member notifications; unset means every
/// send reports `skipped`.
pub static NOTIFY_ENDPOINT: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("NOTIFY_ENDPOINT"));

pub static NORTHPAY_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("NORTHPAY_API_BASE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "https://api.northpay.io".to_string())
});

pub static ORBIPAY_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("ORBIPAY_API_BASE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "https://api.orbipay.com".to_string())
});

pub static FINCHPAY_API_BASE: Lazy<String> = Lazy::new(|| {
    std::env::var("FINCHPAY_API_BASE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "https://connect.finchpay.dev".to_string())
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
