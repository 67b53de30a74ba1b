//! Quota-gated, retried remote calls
//!
//! Every path to the remote service goes through [`CallExecutor::call`]:
//! the operation's cost is reserved with the quota manager, the call runs
//! under the retry policy, and the reservation is then recorded on success
//! or released on failure. A call is charged once however many attempts the
//! retry layer makes.

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::quota::QuotaManager;
use crate::remote::{Operation, RemoteService, Response};
use crate::retry::{retry_observed, RetryEvent, RetryPolicy};

/// Progress of one executed call
#[derive(Debug)]
pub enum CallEvent<'a> {
    /// Quota admitted `units` for the call
    Admitted { units: i64 },
    Retry(&'a RetryEvent<'a>),
}

/// Runs operations against a remote service under quota and retry control
#[derive(Clone)]
pub struct CallExecutor {
    remote: Arc<dyn RemoteService>,
    quota: QuotaManager,
    retry: Arc<RetryPolicy>,
}

impl CallExecutor {
    pub fn new(remote: Arc<dyn RemoteService>, quota: QuotaManager, retry: RetryPolicy) -> Self {
        Self {
            remote,
            quota,
            retry: Arc::new(retry),
        }
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execute `operation` on behalf of `account`
    pub async fn call(&self, account: &str, operation: &Operation) -> Result<Response> {
        self.call_observed(account, operation, |_| {}).await
    }

    /// [`call`](Self::call), reporting admission and retry progress
    pub async fn call_observed<O>(
        &self,
        account: &str,
        operation: &Operation,
        mut observer: O,
    ) -> Result<Response>
    where
        O: FnMut(CallEvent<'_>),
    {
        let kind = operation.kind();
        let units = kind.cost();

        self.quota.wait_for_quota(account, units).await?;
        observer(CallEvent::Admitted { units });

        let result = retry_observed(
            kind.as_str(),
            &self.retry,
            || self.remote.invoke(operation),
            |event| observer(CallEvent::Retry(event)),
        )
        .await;

        let target = operation.message_id().unwrap_or("-");
        match &result {
            Ok(_) => {
                self.quota.record_usage(account, units).await?;
                debug!(message_id = target, "{} for {} completed ({} units)", kind, account, units);
            }
            Err(e) => {
                self.quota.release(account, units).await;
                debug!(message_id = target, "{} for {} failed: {}", kind, account, e);
            }
        }

        result
    }
}

impl std::fmt::Debug for CallExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallExecutor")
            .field("quota", &self.quota)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
