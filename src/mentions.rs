//! Cross-platform user-mention resolver.
//!
//! Maps a source-platform user token (id or email) to a destination-platform
//! user id. Exact workspace-scoped lookup first, case-insensitive email
//! fallback second, graceful degradation otherwise: the caller renders the
//! raw handle and moves on; an identity is never fabricated.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{MappingType, UserMapping};
use crate::store::Store;

/// Outcome of a mention lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A destination user was found.
    Resolved {
        dest_user_id: String,
        confidence: f32,
    },
    /// No mapping exists. The caller must degrade gracefully.
    Unresolved,
}

/// Resolves source-platform mentions against the mapping store.
pub struct MentionResolver {
    store: Arc<dyn Store>,
    email_re: Regex,
}

impl MentionResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            // Loose on purpose: the goal is "could this be an email", not
            // RFC validation.
            email_re: Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap(),
        }
    }

    /// Resolve one mentioned-user token within a workspace scope.
    ///
    /// Email-matched lookups are persisted as `auto_matched` so the next
    /// resolution hits the exact path. Unresolved tokens are persisted as
    /// `discovered_unmapped` placeholders for the admin UI to complete;
    /// persistence failures there are logged, never propagated.
    pub async fn resolve(
        &self,
        platform: &str,
        workspace_id: &str,
        token: &str,
    ) -> Result<Resolution, StoreError> {
        // (1) Exact match on (platform, workspace, source user id).
        if let Some(mapping) = self
            .store
            .find_user_mapping(platform, workspace_id, token)
            .await?
        {
            if let Some(dest) = mapping.dest_user_id {
                debug!(platform, workspace_id, token, dest = %dest, "Mention resolved exactly");
                return Ok(Resolution::Resolved {
                    dest_user_id: dest,
                    confidence: mapping.confidence,
                });
            }
            // A discovered-unmapped placeholder already exists; nothing to
            // add, and nothing to resolve.
            debug!(platform, workspace_id, token, "Mention known but unmapped");
            return Ok(Resolution::Unresolved);
        }

        // (2) Email fallback within the same workspace scope.
        if self.email_re.is_match(token) {
            if let Some(mapping) = self
                .store
                .find_user_mapping_by_email(platform, workspace_id, token)
                .await?
            {
                if let Some(dest) = mapping.dest_user_id.clone() {
                    let auto = UserMapping {
                        platform: platform.to_string(),
                        workspace_id: workspace_id.to_string(),
                        source_user_id: token.to_string(),
                        dest_user_id: Some(dest.clone()),
                        email: Some(token.to_string()),
                        confidence: 1.0,
                        mapping_type: MappingType::AutoMatched,
                    };
                    self.store.persist_user_mapping(&auto).await?;
                    debug!(
                        platform,
                        workspace_id,
                        token,
                        dest = %dest,
                        "Mention auto-matched by email"
                    );
                    return Ok(Resolution::Resolved {
                        dest_user_id: dest,
                        confidence: 1.0,
                    });
                }
            }
        }

        // (3) Unresolved. Record a placeholder so the admin UI can complete
        // it later; never block on that write.
        warn!(platform, workspace_id, token, "Unresolved mention, rendering as plain text");
        let placeholder = UserMapping {
            platform: platform.to_string(),
            workspace_id: workspace_id.to_string(),
            source_user_id: token.to_string(),
            dest_user_id: None,
            email: self.email_re.is_match(token).then(|| token.to_string()),
            confidence: 0.0,
            mapping_type: MappingType::DiscoveredUnmapped,
        };
        if let Err(e) = self.store.persist_user_mapping(&placeholder).await {
            warn!(error = %e, "Failed to persist discovered-unmapped placeholder");
        }
        Ok(Resolution::Unresolved)
    }
}
