//! Job kind registry

use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{JobError, JobProvider, JobResult, ProviderFailure};
use crate::storage::JobStore;

/// Providers keyed by job kind name
#[derive(Default, Clone)]
pub struct RegisteredJobs {
    providers: HashMap<String, Arc<dyn JobProvider>>,
}

impl RegisteredJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its kind name; a later registration wins
    pub fn register<P>(&mut self, provider: P)
    where
        P: JobProvider + 'static,
    {
        self.register_arc(Arc::new(provider));
    }

    /// Register an already shared provider
    pub fn register_arc(&mut self, provider: Arc<dyn JobProvider>) {
        let name = provider.job_name().to_string();
        if self.providers.insert(name.clone(), provider).is_some() {
            debug!(job_name = %name, "Replaced job provider");
        }
    }

    /// Provider for a kind name
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn JobProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered kind names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run every provider's self-heal check concurrently
    ///
    /// All checks run to completion; every failure is collected into
    /// [`JobError::CheckFailed`].
    pub async fn check_all(&self, store: &JobStore) -> JobResult<()> {
        let checks = self.providers.iter().map(|(name, provider)| async move {
            let result = provider.check_jobs_table(store).await;
            (name.clone(), result)
        });

        let failures: Vec<ProviderFailure> = join_all(checks)
            .await
            .into_iter()
            .filter_map(|(job_name, result)| match result {
                Ok(()) => {
                    debug!(job_name = %job_name, "Job table check passed");
                    None
                }
                Err(error) => {
                    error!(job_name = %job_name, error = %error, "Job table check failed");
                    Some(ProviderFailure { job_name, error })
                }
            })
            .collect();

        if failures.is_empty() {
            info!(kinds = self.providers.len(), "Checked job kinds");
            Ok(())
        } else {
            Err(JobError::CheckFailed(failures))
        }
    }
}

impl fmt::Debug for RegisteredJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJobs")
            .field("kinds", &self.names())
            .finish()
    }
}
