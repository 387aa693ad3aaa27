//! 来源授权规则：按调用方 `origin` 做黑白名单判定。

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Rule, RuleSet, validate_all};
use crate::error::{BlockError, BlockKind, BlockReason, RuleError};
use crate::slot::{ProcessorSlot, SlotContext};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStrategy {
    #[default]
    White,
    Black,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorityRule {
    pub resource: String,
    /// 逗号分隔的来源列表。
    pub limit_app: String,
    #[serde(default)]
    pub strategy: AuthorityStrategy,
}

impl AuthorityRule {
    pub fn new(
        resource: impl Into<String>,
        limit_app: impl Into<String>,
        strategy: AuthorityStrategy,
    ) -> Self {
        Self {
            resource: resource.into(),
            limit_app: limit_app.into(),
            strategy,
        }
    }

    fn contains(&self, origin: &str) -> bool {
        self.limit_app
            .split(',')
            .map(str::trim)
            .any(|app| app == origin)
    }

    /// 空来源永远放行。
    pub fn pass(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return true;
        }
        match self.strategy {
            AuthorityStrategy::White => self.contains(origin),
            AuthorityStrategy::Black => !self.contains(origin),
        }
    }
}

impl Rule for AuthorityRule {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn validate(&self) -> Result<(), RuleError> {
        if self.resource.is_empty() {
            return Err(RuleError::new(
                BlockKind::AUTHORITY,
                &self.resource,
                "resource must not be empty",
            ));
        }
        if self.limit_app.trim().is_empty() {
            return Err(RuleError::new(
                BlockKind::AUTHORITY,
                &self.resource,
                "limit_app must list at least one origin",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AuthorityBlocked {
    pub rule: AuthorityRule,
    pub origin: String,
}

impl fmt::Display for AuthorityBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "origin `{}` rejected by {:?} list [{}]",
            self.origin, self.rule.strategy, self.rule.limit_app
        )
    }
}

impl BlockReason for AuthorityBlocked {
    fn kind(&self) -> BlockKind {
        BlockKind::AUTHORITY
    }

    fn code(&self) -> &'static str {
        "spark.guard.block.authority"
    }

    fn rule_description(&self) -> Option<String> {
        Some(format!("{:?}", self.rule))
    }
}

#[derive(Debug, Default)]
pub struct AuthorityRuleManager {
    rules: RuleSet<AuthorityRule>,
}

impl AuthorityRuleManager {
    pub fn load_rules(&self, rules: Vec<AuthorityRule>) -> Result<(), RuleError> {
        validate_all(&rules)?;
        let count = rules.len();
        self.rules.replace(
            rules
                .into_iter()
                .map(|rule| (Arc::from(rule.resource.as_str()), rule)),
        );
        debug!(target: "spark.guard.core", rules = count, "authority rules loaded");
        Ok(())
    }

    pub fn get_rules(&self) -> Vec<AuthorityRule> {
        self.rules.all().iter().map(|rule| (**rule).clone()).collect()
    }

    pub fn rules_for(&self, resource: &str) -> Vec<AuthorityRule> {
        self.rules
            .rules_for(resource)
            .map(|items| items.iter().map(|rule| (**rule).clone()).collect())
            .unwrap_or_default()
    }
}

static MANAGER: OnceLock<AuthorityRuleManager> = OnceLock::new();

pub fn manager() -> &'static AuthorityRuleManager {
    MANAGER.get_or_init(AuthorityRuleManager::default)
}

pub fn load_rules(rules: Vec<AuthorityRule>) -> Result<(), RuleError> {
    manager().load_rules(rules)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AuthoritySlot;

impl AuthoritySlot {
    pub const ORDER: i32 = -6_000;
}

impl ProcessorSlot for AuthoritySlot {
    fn name(&self) -> &'static str {
        "authority"
    }

    fn order(&self) -> i32 {
        Self::ORDER
    }

    fn entry(&self, ctx: &SlotContext<'_>) -> Result<(), BlockError> {
        let Some(rules) = manager().rules.rules_for(ctx.resource().name()) else {
            return Ok(());
        };
        let origin = ctx.origin();
        match rules.iter().find(|rule| !rule.pass(origin)) {
            Some(rule) => Err(BlockError::new(
                Arc::clone(ctx.resource().name_arc()),
                AuthorityBlocked {
                    rule: (**rule).clone(),
                    origin: origin.to_owned(),
                },
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn white_list_admits_only_listed_origins() {
        let rule = AuthorityRule::new("auth", "app-a, app-b", AuthorityStrategy::White);
        assert!(rule.pass("app-a"));
        assert!(rule.pass("app-b"));
        assert!(!rule.pass("app-c"));
        assert!(rule.pass(""), "空来源不受授权规则约束");
    }

    #[test]
    fn black_list_rejects_exact_matches_only() {
        let rule = AuthorityRule::new("auth", "app-a", AuthorityStrategy::Black);
        assert!(!rule.pass("app-a"));
        assert!(rule.pass("app-ab"));
    }
}
