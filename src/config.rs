//! Service configuration

/// Knobs for [`crate::service::ApprovalService`]. `Default` gives the
/// production values; setters follow the builder style used for drafts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// bech32 human readable part of generated request ids
    pub request_id_hrp: String,
    /// flush the database to disk after every committed operation
    pub flush_on_commit: bool,
    pub requests_tree: String,
    pub steps_tree: String,
    pub subjects_tree: String,
    pub subject_index_tree: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            request_id_hrp: "req".to_string(),
            flush_on_commit: false,
            requests_tree: "approval_requests".to_string(),
            steps_tree: "approval_steps".to_string(),
            subjects_tree: "subjects".to_string(),
            subject_index_tree: "subject_requests".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_request_id_hrp(mut self, hrp: &str) -> Self {
        self.request_id_hrp = hrp.to_string();
        self
    }
    pub fn set_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }
    /// Prefix every tree name, so several engines can share one database.
    pub fn set_tree_prefix(mut self, prefix: &str) -> Self {
        let defaults = Self::default();
        self.requests_tree = format!("{prefix}{}", defaults.requests_tree);
        self.steps_tree = format!("{prefix}{}", defaults.steps_tree);
        self.subjects_tree = format!("{prefix}{}", defaults.subjects_tree);
        self.subject_index_tree = format!("{prefix}{}", defaults.subject_index_tree);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_prefix_applies_to_every_tree() {
        let config = ServiceConfig::new().set_tree_prefix("campus_a/");
        assert_eq!(config.requests_tree, "campus_a/approval_requests");
        assert_eq!(config.steps_tree, "campus_a/approval_steps");
        assert_eq!(config.subjects_tree, "campus_a/subjects");
        assert_eq!(config.subject_index_tree, "campus_a/subject_requests");
        assert_eq!(config.request_id_hrp, "req");
    }
}
