use anyhow::{Context, Result};
use reqwest::Certificate;
use std::env;
use std::fs;
use std::time::Duration;

const EXTRA_CA_CERT_ENV: &str = "COPILOT_EXTRA_CA_CERT";
const USER_AGENT: &str = concat!("copilot/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn load_extra_ca_certificate() -> Result<Option<Certificate>> {
    let Some(path) = env::var(EXTRA_CA_CERT_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    else {
        return Ok(None);
    };
    let pem =
        fs::read(&path).with_context(|| format!("failed to read CA certificate from {}", path))?;
    let certificate = Certificate::from_pem(&pem)
        .with_context(|| format!("failed to parse CA certificate from {}", path))?;
    Ok(Some(certificate))
}

/// Shared client for market data and strategy webhooks. There is no overall
/// timeout here; each caller sets its own per request.
pub fn build_async_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT);
    // Self-hosted strategy webhooks are often behind a private CA.
    if let Some(certificate) = load_extra_ca_certificate()? {
        builder = builder.add_root_certificate(certificate);
    }
    builder.build().context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreadable_extra_ca_fails_the_build() {
        env::set_var(EXTRA_CA_CERT_ENV, "/nonexistent/copilot-ca.pem");
        let err = build_async_client().unwrap_err();
        assert!(format!("{:#}", err).contains("copilot-ca.pem"));

        env::set_var(EXTRA_CA_CERT_ENV, "  ");
        assert!(build_async_client().is_ok());
        env::remove_var(EXTRA_CA_CERT_ENV);
        assert!(build_async_client().is_ok());
    }
}
