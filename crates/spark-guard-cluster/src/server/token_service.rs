//! 服务端令牌服务：直接读写本进程内的配额状态。
//!
//! # 教案式注释
//! - **意图 (Why)**：TCP 处理器与嵌入式部署（令牌服务与业务同进程）共用同一份判定逻辑，
//!   因此判定实现为核心 crate 的 [`TokenService`]，嵌入式部署可以直接
//!   [`token::install`](spark_guard_core::token::install) 它；
//! - **契约 (What)**：
//!   - 找不到规则返回 `NO_RULE_EXISTS`；申请数为 0 或批量列表为空返回 `BAD_REQUEST`；
//!   - 批量申请按顺序逐条判定，遇到首个非 `OK` 结果立即返回，并在附件
//!     [`ATTACHMENT_BLOCK_ID`] 中写明失败的 `flow_id`；之前已通过的规则不回退；
//!   - 并发租约以调用方地址登记，连接断开时可按地址批量释放。

use std::sync::Arc;

use spark_guard_core::token::ATTACHMENT_BLOCK_ID;
use spark_guard_core::{ParamValue, RuleError, TokenResult, TokenResultStatus, TokenService};

use super::concurrent::LeaseManager;
use super::config::{NamespacedFlowRule, NamespacedParamRule, QuotaConfig, ServerConfig};
use super::connection::ConnectionManager;
use super::flow::FlowQuota;
use super::param::ParamQuota;
use super::rules::{ClusterRules, global_threshold};

#[derive(Debug)]
pub struct DefaultTokenService {
    rules: ClusterRules,
    connections: ConnectionManager,
    flow: FlowQuota,
    param: ParamQuota,
    leases: Arc<LeaseManager>,
}

impl DefaultTokenService {
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            rules: ClusterRules::new(),
            connections: ConnectionManager::new(),
            flow: FlowQuota::new(quota),
            param: ParamQuota::new(quota),
            leases: Arc::new(LeaseManager::new()),
        }
    }

    /// 按服务端配置构造：登记命名空间并加载内联规则。
    pub fn from_config(config: &ServerConfig) -> Result<Self, RuleError> {
        let service = Self::new(config.quota);
        for namespace in &config.namespaces {
            service.connections.register_namespace(namespace);
        }
        service.load_flow_rules(config.flow_rules.clone())?;
        service.load_param_rules(config.param_rules.clone())?;
        Ok(service)
    }

    pub fn load_flow_rules(&self, rules: Vec<NamespacedFlowRule>) -> Result<(), RuleError> {
        self.rules.load_flow_rules(rules)?;
        self.flow.metrics().retain(&self.rules.flow_ids());
        Ok(())
    }

    pub fn load_param_rules(&self, rules: Vec<NamespacedParamRule>) -> Result<(), RuleError> {
        self.rules.load_param_rules(rules)?;
        self.param.retain(&self.rules);
        Ok(())
    }

    pub fn rules(&self) -> &ClusterRules {
        &self.rules
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn flow_quota(&self) -> &FlowQuota {
        &self.flow
    }

    /// 客户端断开：注销命名空间成员并释放其全部租约。
    pub fn disconnect(&self, client_address: &str) {
        self.connections.remove(client_address);
        self.leases.release_client(client_address);
    }
}

impl TokenService for DefaultTokenService {
    fn request_token(&self, flow_id: i64, acquire_count: u32, prioritized: bool) -> TokenResult {
        if acquire_count == 0 {
            return TokenResult::new(TokenResultStatus::BadRequest);
        }
        let Some(rule) = self.rules.flow_rule(flow_id) else {
            return TokenResult::new(TokenResultStatus::NoRuleExists);
        };
        let connected = self.connections.connected_count(&rule.namespace);
        self.flow.acquire(&rule, connected, acquire_count, prioritized)
    }

    fn batch_request_token(
        &self,
        flow_ids: &[i64],
        acquire_count: u32,
        prioritized: bool,
    ) -> TokenResult {
        if flow_ids.is_empty() {
            return TokenResult::new(TokenResultStatus::BadRequest);
        }
        let mut remaining = i32::MAX;
        for &flow_id in flow_ids {
            let result = self.request_token(flow_id, acquire_count, prioritized);
            if !result.is_ok() {
                return result.with_attachment(ATTACHMENT_BLOCK_ID, flow_id.to_string());
            }
            remaining = remaining.min(result.remaining);
        }
        TokenResult::ok(remaining)
    }

    fn request_param_token(
        &self,
        flow_id: i64,
        acquire_count: u32,
        params: &[ParamValue],
    ) -> TokenResult {
        if acquire_count == 0 {
            return TokenResult::new(TokenResultStatus::BadRequest);
        }
        let Some(rule) = self.rules.param_rule(flow_id) else {
            return TokenResult::new(TokenResultStatus::NoRuleExists);
        };
        let connected = self.connections.connected_count(&rule.namespace);
        self.param.acquire(&rule, connected, acquire_count, params)
    }

    fn request_concurrent_token(
        &self,
        client_address: &str,
        flow_id: i64,
        acquire_count: u32,
    ) -> TokenResult {
        if acquire_count == 0 {
            return TokenResult::new(TokenResultStatus::BadRequest);
        }
        let Some(rule) = self.rules.flow_rule(flow_id) else {
            return TokenResult::new(TokenResultStatus::NoRuleExists);
        };
        let connected = self.connections.connected_count(&rule.namespace);
        let threshold =
            global_threshold(rule.rule.count, rule.config.threshold_type, connected);
        self.leases.acquire(
            client_address,
            flow_id,
            acquire_count,
            threshold,
            rule.config.resource_timeout_ms,
        )
    }

    fn release_concurrent_token(&self, token_id: i64) -> TokenResult {
        self.leases.release(token_id)
    }
}

#[cfg(test)]
mod tests {
    use spark_guard_core::rule::{ClusterFlowConfig, ClusterThresholdType, FlowRule};

    use super::*;

    fn service(rules: &[(i64, f64)]) -> DefaultTokenService {
        let service = DefaultTokenService::new(QuotaConfig::default());
        service
            .load_flow_rules(
                rules
                    .iter()
                    .map(|&(flow_id, count)| {
                        NamespacedFlowRule::new(
                            "default",
                            FlowRule::new(format!("res-{flow_id}"), count).with_cluster(
                                ClusterFlowConfig {
                                    flow_id,
                                    threshold_type: ClusterThresholdType::Global,
                                    ..ClusterFlowConfig::default()
                                },
                            ),
                        )
                    })
                    .collect(),
            )
            .unwrap();
        service
    }

    #[test]
    fn unknown_flow_id_reports_missing_rule() {
        let service = service(&[]);
        assert_eq!(
            service.request_token(404, 1, false).status,
            TokenResultStatus::NoRuleExists
        );
        assert_eq!(
            service.request_token(404, 0, false).status,
            TokenResultStatus::BadRequest
        );
    }

    #[test]
    fn batch_short_circuits_on_first_failure() {
        let service = service(&[(1, 100.0), (2, 0.0), (3, 100.0)]);
        let result = service.batch_request_token(&[1, 2, 3], 1, false);
        assert_eq!(result.status, TokenResultStatus::Blocked);
        assert_eq!(
            result.attachments.get(ATTACHMENT_BLOCK_ID).map(String::as_str),
            Some("2")
        );
        assert_eq!(
            service.request_token(3, 100, false).status,
            TokenResultStatus::Ok,
            "短路后的规则未被记账"
        );

        let missing = service.batch_request_token(&[1, 9], 1, false);
        assert_eq!(missing.status, TokenResultStatus::NoRuleExists);
        assert_eq!(
            missing.attachments.get(ATTACHMENT_BLOCK_ID).map(String::as_str),
            Some("9")
        );
    }

    #[test]
    fn batch_success_reports_smallest_remaining() {
        let service = service(&[(1, 10.0), (2, 5.0)]);
        let result = service.batch_request_token(&[1, 2], 2, false);
        assert!(result.is_ok());
        assert_eq!(result.remaining, 3);
        assert!(result.attachments.is_empty());
    }

    #[test]
    fn disconnect_returns_leases_to_the_pool() {
        let service = service(&[(5, 1.0)]);
        let lease = service.request_concurrent_token("10.0.0.1:1", 5, 1);
        assert!(lease.is_ok());
        assert_eq!(
            service.request_concurrent_token("10.0.0.2:1", 5, 1).status,
            TokenResultStatus::Blocked
        );
        service.disconnect("10.0.0.1:1");
        assert!(service.request_concurrent_token("10.0.0.2:1", 5, 1).is_ok());
    }
}
