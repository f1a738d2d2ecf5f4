//! Comment reconciliation.
//!
//! Keeps exactly one live surveyor comment per PR: find the comment carrying
//! the hidden report marker and update it, or create it if absent. A stale
//! guard drops the write when the PR head has moved past the run's commit,
//! so a slow run can never clobber a newer run's report.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::GitHubConfig;
use crate::errors::RunError;
use crate::models::RunIdentity;
use crate::report::REPORT_MARKER;
use crate::store::StoreHandle;

/// One comment on a PR, reduced to the fields reconciliation needs.
#[derive(Debug, Clone, Deserialize)]
pub struct PrComment {
    pub id: i64,
    pub body: Option<String>,
}

/// Abstraction over the PR comment surface for testability.
/// Real implementation: `GitHubCommentSink`. Test double: `RecordingSink`
/// in the reconciler tests.
#[async_trait]
pub trait CommentSink: Send + Sync {
    /// First comment on the PR whose body contains `marker`, if any.
    async fn find_marked(
        &self,
        owner_repo: &str,
        pr_number: i64,
        marker: &str,
    ) -> anyhow::Result<Option<i64>>;

    async fn create(&self, owner_repo: &str, pr_number: i64, body: &str) -> anyhow::Result<i64>;

    async fn update(&self, owner_repo: &str, comment_id: i64, body: &str) -> anyhow::Result<()>;
}

/// Posts comments through the GitHub issues API.
pub struct GitHubCommentSink {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

impl GitHubCommentSink {
    pub fn new(config: &GitHubConfig) -> anyhow::Result<Self> {
        let token = config.resolve_token().with_context(|| {
            format!("GitHub token not found in environment variable {}", config.token_env)
        })?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl CommentSink for GitHubCommentSink {
    async fn find_marked(
        &self,
        owner_repo: &str,
        pr_number: i64,
        marker: &str,
    ) -> anyhow::Result<Option<i64>> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, owner_repo, pr_number
        );
        let mut page = 1u32;

        loop {
            let page_param = page.to_string();
            let comments: Vec<PrComment> = self
                .client
                .get(&url)
                .header("Authorization", format!("Bearer {}", self.token))
                .header("User-Agent", "surveyor")
                .query(&[("per_page", "100"), ("page", page_param.as_str())])
                .send()
                .await
                .context("Failed to send comment list request to GitHub")?
                .error_for_status()
                .context("GitHub comment list API returned error status")?
                .json()
                .await
                .context("Failed to parse comment list response from GitHub")?;

            let count = comments.len();
            if let Some(comment) = comments
                .into_iter()
                .find(|c| c.body.as_deref().is_some_and(|b| b.contains(marker)))
            {
                return Ok(Some(comment.id));
            }

            if count < 100 {
                return Ok(None);
            }
            page += 1;
        }
    }

    async fn create(&self, owner_repo: &str, pr_number: i64, body: &str) -> anyhow::Result<i64> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.api_base, owner_repo, pr_number
        );
        let created: PrComment = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "surveyor")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to send comment create request to GitHub")?
            .error_for_status()
            .context("GitHub comment create API returned error status")?
            .json()
            .await
            .context("Failed to parse comment create response from GitHub")?;
        Ok(created.id)
    }

    async fn update(&self, owner_repo: &str, comment_id: i64, body: &str) -> anyhow::Result<()> {
        let url = format!(
            "{}/repos/{}/issues/comments/{}",
            self.api_base, owner_repo, comment_id
        );
        self.client
            .patch(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "surveyor")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .context("Failed to send comment update request to GitHub")?
            .error_for_status()
            .context("GitHub comment update API returned error status")?;
        Ok(())
    }
}

/// Update-or-create with the stale guard in front.
pub struct CommentReconciler {
    store: StoreHandle,
    sink: Arc<dyn CommentSink>,
}

impl CommentReconciler {
    pub fn new(store: StoreHandle, sink: Arc<dyn CommentSink>) -> Self {
        Self { store, sink }
    }

    /// Posts `body` as the PR's live surveyor comment and returns the
    /// comment id. Fails with `ReconcileStale` when the stored PR head no
    /// longer matches the run's commit; the newer run owns the comment.
    pub async fn reconcile(&self, identity: &RunIdentity, body: &str) -> Result<i64, RunError> {
        let owner_repo = identity.owner_repo.clone();
        let pr_number = identity.pr_number;
        let head = self
            .store
            .call(move |db| db.pr_head(&owner_repo, pr_number))
            .await?;

        if let Some(head_sha) = head {
            if head_sha != identity.commit_sha {
                return Err(RunError::ReconcileStale {
                    identity: identity.clone(),
                    head_sha,
                });
            }
        }

        let existing = self
            .sink
            .find_marked(&identity.owner_repo, identity.pr_number, REPORT_MARKER)
            .await?;

        match existing {
            Some(comment_id) => {
                self.sink
                    .update(&identity.owner_repo, comment_id, body)
                    .await?;
                debug!(run = %identity, comment_id, "Updated existing report comment");
                Ok(comment_id)
            }
            None => {
                let comment_id = self
                    .sink
                    .create(&identity.owner_repo, identity.pr_number, body)
                    .await?;
                info!(run = %identity, comment_id, "Created report comment");
                Ok(comment_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    use super::*;
    use crate::store::RunDb;

    #[derive(Default)]
    struct RecordingSink {
        comments: Mutex<Vec<(i64, String)>>,
        next_id: AtomicI64,
    }

    impl RecordingSink {
        fn seeded(comments: Vec<(i64, &str)>) -> Self {
            let max = comments.iter().map(|(id, _)| *id).max().unwrap_or(0);
            Self {
                comments: Mutex::new(
                    comments
                        .into_iter()
                        .map(|(id, body)| (id, body.to_string()))
                        .collect(),
                ),
                next_id: AtomicI64::new(max),
            }
        }

        fn bodies(&self) -> Vec<(i64, String)> {
            self.comments.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommentSink for RecordingSink {
        async fn find_marked(
            &self,
            _owner_repo: &str,
            _pr_number: i64,
            marker: &str,
        ) -> anyhow::Result<Option<i64>> {
            Ok(self
                .comments
                .lock()
                .unwrap()
                .iter()
                .find(|(_, body)| body.contains(marker))
                .map(|(id, _)| *id))
        }

        async fn create(
            &self,
            _owner_repo: &str,
            _pr_number: i64,
            body: &str,
        ) -> anyhow::Result<i64> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.comments.lock().unwrap().push((id, body.to_string()));
            Ok(id)
        }

        async fn update(
            &self,
            _owner_repo: &str,
            comment_id: i64,
            body: &str,
        ) -> anyhow::Result<()> {
            let mut comments = self.comments.lock().unwrap();
            let slot = comments
                .iter_mut()
                .find(|(id, _)| *id == comment_id)
                .ok_or_else(|| anyhow::anyhow!("No comment {}", comment_id))?;
            slot.1 = body.to_string();
            Ok(())
        }
    }

    fn store() -> StoreHandle {
        StoreHandle::new(RunDb::new_in_memory().unwrap())
    }

    fn marked_body(text: &str) -> String {
        format!("{}\n{}", REPORT_MARKER, text)
    }

    #[tokio::test]
    async fn test_creates_comment_when_none_exists() {
        let store = store();
        store
            .call(|db| db.record_pr_head("acme/payments", 42, "aaa"))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let reconciler = CommentReconciler::new(store, sink.clone());

        let identity = RunIdentity::new("acme/payments", 42, "aaa");
        let id = reconciler
            .reconcile(&identity, &marked_body("report v1"))
            .await
            .unwrap();

        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].0, id);
        assert!(bodies[0].1.contains("report v1"));
    }

    #[tokio::test]
    async fn test_updates_existing_marked_comment() {
        let store = store();
        store
            .call(|db| db.record_pr_head("acme/payments", 42, "bbb"))
            .await
            .unwrap();
        let old = marked_body("old report");
        let sink = Arc::new(RecordingSink::seeded(vec![(7, old.as_str())]));
        let reconciler = CommentReconciler::new(store, sink.clone());

        let identity = RunIdentity::new("acme/payments", 42, "bbb");
        let id = reconciler
            .reconcile(&identity, &marked_body("new report"))
            .await
            .unwrap();

        assert_eq!(id, 7);
        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].1.contains("new report"));
    }

    #[tokio::test]
    async fn test_unmarked_comments_are_left_alone() {
        let store = store();
        store
            .call(|db| db.record_pr_head("acme/payments", 42, "aaa"))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::seeded(vec![(3, "human discussion")]));
        let reconciler = CommentReconciler::new(store, sink.clone());

        let identity = RunIdentity::new("acme/payments", 42, "aaa");
        reconciler
            .reconcile(&identity, &marked_body("report"))
            .await
            .unwrap();

        let bodies = sink.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].1, "human discussion");
    }

    #[tokio::test]
    async fn test_stale_run_does_not_write() {
        let store = store();
        // Run B's event already moved the head past Run A's commit.
        store
            .call(|db| db.record_pr_head("acme/payments", 42, "bbb"))
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let reconciler = CommentReconciler::new(store, sink.clone());

        let stale = RunIdentity::new("acme/payments", 42, "aaa");
        let err = reconciler
            .reconcile(&stale, &marked_body("stale report"))
            .await
            .unwrap_err();

        match err {
            RunError::ReconcileStale { head_sha, .. } => assert_eq!(head_sha, "bbb"),
            other => panic!("Expected ReconcileStale, got {}", other),
        }
        assert!(sink.bodies().is_empty());
    }

    #[tokio::test]
    async fn test_missing_head_row_still_posts() {
        let store = store();
        let sink = Arc::new(RecordingSink::default());
        let reconciler = CommentReconciler::new(store, sink.clone());

        let identity = RunIdentity::new("acme/payments", 42, "aaa");
        reconciler
            .reconcile(&identity, &marked_body("report"))
            .await
            .unwrap();
        assert_eq!(sink.bodies().len(), 1);
    }
}
