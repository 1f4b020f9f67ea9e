//! Shared AWS SDK configuration and error mapping

use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_fis::error::{DisplayErrorContext, ProvideErrorMetadata};

use fis_common::Error;

/// Error codes that will fail the same way on every retry
const PERMANENT_ERROR_CODES: &[&str] = &[
    "ValidationException",
    "InvalidInput",
    "InvalidParameterException",
    "MalformedPolicyDocument",
    "AccessDeniedException",
    "AccessDenied",
];

/// Settings for building the shared [`SdkConfig`]
#[derive(Clone, Debug)]
pub struct AwsSettings {
    /// Explicit region; falls back to the default provider chain
    pub region: Option<String>,
    /// SDK-level attempts per call (standard retry mode)
    pub max_attempts: u32,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: None,
            max_attempts: 3,
        }
    }
}

/// Load credentials and region once at startup
pub async fn load_sdk_config(settings: &AwsSettings) -> SdkConfig {
    let region = RegionProviderChain::first_try(settings.region.clone().map(Region::new))
        .or_default_provider();

    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(RetryConfig::standard().with_max_attempts(settings.max_attempts))
        .load()
        .await
}

/// Map any SDK error to a provider error, keeping the full error chain in the message
pub(crate) fn sdk_error<E>(service: &str, operation: &str, err: E) -> Error
where
    E: std::error::Error + ProvideErrorMetadata + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.code() {
        Some(code) if PERMANENT_ERROR_CODES.contains(&code) => {
            Error::provider_permanent(service, operation, message)
        }
        _ => Error::provider(service, operation, message),
    }
}

/// Map a request builder error (missing required field)
pub(crate) fn build_error(service: &str, operation: &str, err: impl std::fmt::Display) -> Error {
    Error::provider_permanent(service, operation, format!("invalid request: {}", err))
}
