//! Request identity.
//!
//! The bus does no authentication of its own. An [`IdentityLookup`] turns
//! request headers into the site, user and groups used for targeting, and
//! decides who may use the admin endpoints.

use crate::config::IdentityConfig;
use axum::http::HeaderMap;
use postbus_core::channel::validate_site_id;
use postbus_core::Identity;
use thiserror::Error;
use tracing::debug;

/// Identity lookup errors.
#[derive(Debug, Error)]
pub enum LookupError {
    /// A header value could not be interpreted.
    #[error("Invalid {header} header: {reason}")]
    InvalidHeader {
        /// Header name.
        header: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Resolves who is making a request.
pub trait IdentityLookup: Send + Sync {
    /// The targeting identity of the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the request carries a malformed identity.
    fn identity(&self, headers: &HeaderMap) -> Result<Identity, LookupError>;

    /// Whether the caller may use diagnostics and HTTP publish.
    fn is_admin(&self, headers: &HeaderMap) -> bool;
}

/// Trusts headers set by a fronting application.
#[derive(Debug, Clone)]
pub struct HeaderLookup {
    config: IdentityConfig,
}

impl HeaderLookup {
    /// Create a lookup reading the configured headers.
    #[must_use]
    pub fn new(config: IdentityConfig) -> Self {
        Self { config }
    }

    fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, LookupError> {
        match headers.get(name) {
            None => Ok(None),
            Some(value) => value
                .to_str()
                .map(|v| Some(v.trim()).filter(|v| !v.is_empty()))
                .map_err(|_| invalid(name, "not visible ASCII")),
        }
    }
}

fn invalid(header: &str, reason: impl Into<String>) -> LookupError {
    LookupError::InvalidHeader {
        header: header.to_string(),
        reason: reason.into(),
    }
}

impl IdentityLookup for HeaderLookup {
    fn identity(&self, headers: &HeaderMap) -> Result<Identity, LookupError> {
        let mut identity = Identity::anonymous();

        if let Some(site) = Self::header(headers, &self.config.site_header)? {
            validate_site_id(site).map_err(|reason| invalid(&self.config.site_header, reason))?;
            identity = identity.with_site(site);
        }

        if let Some(user) = Self::header(headers, &self.config.user_header)? {
            let user_id = user
                .parse()
                .map_err(|_| invalid(&self.config.user_header, "not an integer"))?;
            identity = identity.with_user(user_id);
        }

        if let Some(groups) = Self::header(headers, &self.config.groups_header)? {
            let group_ids = groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::parse::<i64>)
                .collect::<Result<Vec<i64>, _>>()
                .map_err(|_| invalid(&self.config.groups_header, "not a list of integers"))?;
            identity = identity.with_groups(group_ids);
        }

        debug!(
            site = ?identity.site_id,
            user = ?identity.user_id,
            groups = identity.group_ids.len(),
            "Resolved identity"
        );
        Ok(identity)
    }

    fn is_admin(&self, headers: &HeaderMap) -> bool {
        matches!(
            Self::header(headers, &self.config.admin_header),
            Ok(Some("1" | "t" | "true"))
        )
    }
}
