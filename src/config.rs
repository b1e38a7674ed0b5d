//! Process configuration read from the environment at startup.

use std::env;

use anyhow::{bail, Context};
use serde::Serialize;
use utoipa::ToSchema;

use crate::rate_limit::RateLimitConfig;

pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Branding of the admin area, shown by `GET /api/v1/admin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SiteConfig {
    pub site_header: String,
    pub site_title: String,
    pub index_title: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            site_header: "This or That Admin".into(),
            site_title: "This or That".into(),
            index_title: "Welcome to This or That Administration".into(),
        }
    }
}

impl SiteConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            site_header: env::var("SITE_HEADER").unwrap_or(d.site_header),
            site_title: env::var("SITE_TITLE").unwrap_or(d.site_title),
            index_title: env::var("SITE_INDEX_TITLE").unwrap_or(d.index_title),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub frontend_url: Option<String>,
    pub cookie_secure: bool,
    pub site: SiteConfig,
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Fails when `JWT_SECRET` is missing or shorter than 32 bytes, or `PORT` is not a port.
    pub fn from_env() -> anyhow::Result<Self> {
        let secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.len() < MIN_JWT_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters long");
        }
        let port = match env::var("PORT") {
            Ok(p) => p.parse().with_context(|| format!("invalid PORT {p:?}"))?,
            Err(_) => 8080,
        };
        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            frontend_url: env::var("FRONTEND_URL").ok(),
            cookie_secure: env::var("SESSION_COOKIE_SECURE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            site: SiteConfig::from_env(),
            rate_limit: RateLimitConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_defaults() {
        let s = SiteConfig::default();
        assert_eq!(s.site_header, "This or That Admin");
        assert_eq!(s.site_title, "This or That");
        assert_eq!(s.index_title, "Welcome to This or That Administration");
    }
}
