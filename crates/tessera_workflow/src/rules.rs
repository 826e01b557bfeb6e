//! Versioned rule sets per dataset.

use std::sync::Arc;
use tracing::info;

use tessera_protocol::{DatasetId, ProjectId, Rule, RuleSet, UserId};
use tessera_validation::CompiledRuleSet;

use crate::authz::{Action, Authorizer};
use crate::error::{Result, WorkflowError};
use crate::store::MetadataStore;

pub struct RuleRegistry {
    store: Arc<dyn MetadataStore>,
    authorizer: Arc<dyn Authorizer>,
}

impl RuleRegistry {
    pub fn new(store: Arc<dyn MetadataStore>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { store, authorizer }
    }

    /// Attach a new rule-set version to a dataset.
    ///
    /// Rules are compiled before anything is stored, so an invalid regex or
    /// range never becomes the current version.
    pub async fn attach(
        &self,
        project_id: &ProjectId,
        dataset_id: &DatasetId,
        rules: Vec<Rule>,
        actor: &UserId,
    ) -> Result<RuleSet> {
        if !self
            .authorizer
            .can_perform(actor, project_id, Action::AttachRules)
            .await
        {
            return Err(WorkflowError::Forbidden {
                user: actor.clone(),
                project: project_id.clone(),
                action: Action::AttachRules,
            });
        }

        let mut candidate = RuleSet::empty(dataset_id.clone());
        candidate.rules = rules;
        CompiledRuleSet::compile(&candidate)?;

        let stored = self
            .store
            .attach_rules(dataset_id, candidate.rules, Some(actor))
            .await?;
        info!(
            dataset_id = %dataset_id,
            version = stored.version,
            rules = stored.rules.len(),
            "Rule set attached"
        );
        Ok(stored)
    }

    /// Current rules, compiled. An empty version-0 set when none are attached.
    pub async fn current(&self, dataset_id: &DatasetId) -> Result<CompiledRuleSet> {
        let set = self.store.current_rules(dataset_id).await?;
        Ok(CompiledRuleSet::compile(&set)?)
    }
}
