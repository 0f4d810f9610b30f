//! Operator registry and call routing.
//!
//! One process-wide registry of operator sessions. All mutation runs
//! under a single write lock so that selection and assignment cannot
//! race; in particular [`OperatorManager::select_and_assign`] is atomic
//! with respect to concurrent selections.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{OperatorInfo, OperatorSession, OperatorStatus};

/// Aggregate pool statistics for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct OperatorPoolStats {
    pub total: usize,
    pub available: usize,
    pub on_call: usize,
    pub on_break: usize,
    pub offline: usize,
    pub utilization: f64,
}

pub struct OperatorManager {
    operators: RwLock<HashMap<String, OperatorSession>>,
    max_idle_seconds: u64,
}

impl OperatorManager {
    pub fn new(max_idle_seconds: u64) -> Self {
        Self {
            operators: RwLock::new(HashMap::new()),
            max_idle_seconds,
        }
    }

    pub async fn add_operator(&self, operator: OperatorSession) {
        self.operators
            .write()
            .await
            .insert(operator.id.clone(), operator);
    }

    /// Register a session for the principal if none exists yet.
    pub async fn ensure_session(&self, id: &str, name: &str) {
        let mut operators = self.operators.write().await;
        operators
            .entry(id.to_string())
            .or_insert_with(|| OperatorSession::new(id, name));
    }

    pub async fn remove_operator(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.operators
            .write()
            .await
            .remove(operator_id)
            .map(|op| op.snapshot())
    }

    pub async fn get_operator(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.operators
            .read()
            .await
            .get(operator_id)
            .map(|op| op.snapshot())
    }

    pub async fn get_all_operators(&self) -> Vec<OperatorInfo> {
        let mut all: Vec<OperatorInfo> = self
            .operators
            .read()
            .await
            .values()
            .map(|op| op.snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn mutate(
        &self,
        operator_id: &str,
        f: impl FnOnce(&mut OperatorSession),
    ) -> Option<OperatorInfo> {
        let mut operators = self.operators.write().await;
        let operator = operators.get_mut(operator_id)?;
        f(operator);
        Some(operator.snapshot())
    }

    pub async fn go_online(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.go_online()).await
    }

    /// Route a generic "make me available" request through the proper
    /// transition for the operator's current state.
    pub async fn make_available(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| match op.status {
            OperatorStatus::OnBreak => op.return_from_break(),
            OperatorStatus::WrapUp => op.end_wrap_up(),
            _ => op.go_online(),
        })
        .await
    }

    pub async fn go_offline(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.go_offline()).await
    }

    pub async fn go_on_break(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.go_on_break()).await
    }

    pub async fn return_from_break(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.return_from_break()).await
    }

    pub async fn start_wrap_up(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.start_wrap_up()).await
    }

    pub async fn end_wrap_up(&self, operator_id: &str) -> Option<OperatorInfo> {
        self.mutate(operator_id, |op| op.end_wrap_up()).await
    }

    async fn count_by(&self, status: OperatorStatus) -> usize {
        self.operators
            .read()
            .await
            .values()
            .filter(|op| op.status == status)
            .count()
    }

    pub async fn available_count(&self) -> usize {
        self.count_by(OperatorStatus::Available).await
    }

    pub async fn on_call_count(&self) -> usize {
        self.count_by(OperatorStatus::OnCall).await
    }

    pub async fn offline_count(&self) -> usize {
        self.count_by(OperatorStatus::Offline).await
    }

    pub async fn on_break_count(&self) -> usize {
        self.count_by(OperatorStatus::OnBreak).await
    }

    fn pick_longest_idle(operators: &HashMap<String, OperatorSession>) -> Option<&str> {
        operators
            .values()
            .filter(|op| op.is_available())
            // Earliest idle_since = longest idle; ties broken by id
            .min_by_key(|op| (op.idle_since(), op.id.clone()))
            .map(|op| op.id.as_str())
    }

    /// The AVAILABLE operator that has waited longest, or None.
    pub async fn select_operator(&self) -> Option<OperatorInfo> {
        let operators = self.operators.read().await;
        Self::pick_longest_idle(&operators).map(|id| operators[id].snapshot())
    }

    /// Assign a call to a specific operator. Succeeds only from AVAILABLE.
    pub async fn assign_call(&self, operator_id: &str, call_sid: &str, lead_id: Uuid) -> bool {
        let mut operators = self.operators.write().await;
        match operators.get_mut(operator_id) {
            Some(op) if op.is_available() => {
                op.start_call(call_sid, lead_id);
                true
            }
            _ => false,
        }
    }

    /// Select the longest-idle operator and assign the call in one step.
    ///
    /// Selection and the ON_CALL transition happen under the same write
    /// lock, so two concurrent calls can never route to the same operator.
    pub async fn select_and_assign(&self, call_sid: &str, lead_id: Uuid) -> Option<OperatorInfo> {
        let mut operators = self.operators.write().await;
        let id = Self::pick_longest_idle(&operators)?.to_string();
        let operator = operators.get_mut(&id)?;
        operator.start_call(call_sid, lead_id);
        Some(operator.snapshot())
    }

    pub async fn end_call(&self, operator_id: &str) -> Option<OperatorInfo> {
        let mut operators = self.operators.write().await;
        let operator = operators.get_mut(operator_id)?;
        if operator.status != OperatorStatus::OnCall {
            return None;
        }
        operator.end_call();
        Some(operator.snapshot())
    }

    /// Operators AVAILABLE for longer than `max_idle_seconds`.
    pub async fn get_long_idle_operators(&self) -> Vec<OperatorInfo> {
        let threshold = self.max_idle_seconds as f64;
        let now = Utc::now();
        self.operators
            .read()
            .await
            .values()
            .filter(|op| {
                op.is_available()
                    && op
                        .idle_since()
                        .map(|since| (now - since).num_milliseconds() as f64 / 1000.0 > threshold)
                        .unwrap_or(false)
            })
            .map(|op| op.snapshot())
            .collect()
    }

    pub async fn find_operator_by_call(&self, call_sid: &str) -> Option<OperatorInfo> {
        self.operators
            .read()
            .await
            .values()
            .find(|op| op.current_call_sid.as_deref() == Some(call_sid))
            .map(|op| op.snapshot())
    }

    pub async fn stats(&self) -> OperatorPoolStats {
        let operators = self.operators.read().await;
        let total = operators.len();
        let mut available = 0;
        let mut on_call = 0;
        let mut on_break = 0;
        let mut offline = 0;
        for op in operators.values() {
            match op.status {
                OperatorStatus::Available => available += 1,
                OperatorStatus::OnCall => on_call += 1,
                OperatorStatus::OnBreak => on_break += 1,
                OperatorStatus::Offline => offline += 1,
                OperatorStatus::WrapUp => {}
            }
        }

        let active = total.saturating_sub(offline).max(1);
        OperatorPoolStats {
            total,
            available,
            on_call,
            on_break,
            offline,
            utilization: on_call as f64 / active as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn manager_with_online(ids: &[&str]) -> OperatorManager {
        let manager = OperatorManager::new(300);
        for id in ids {
            manager.add_operator(OperatorSession::new(*id, *id)).await;
            manager.go_online(id).await.unwrap();
        }
        manager
    }

    #[tokio::test]
    async fn select_prefers_longest_idle() {
        let manager = OperatorManager::new(300);
        manager.add_operator(OperatorSession::new("b", "B")).await;
        manager.go_online("b").await.unwrap();
        // "a" comes online later, so "b" has waited longer
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.add_operator(OperatorSession::new("a", "A")).await;
        manager.go_online("a").await.unwrap();

        let selected = manager.select_operator().await.unwrap();
        assert_eq!(selected.id, "b");
    }

    #[tokio::test]
    async fn select_skips_unavailable() {
        let manager = manager_with_online(&["a", "b"]).await;
        manager.go_on_break("a").await.unwrap();
        assert!(manager.assign_call("b", "CA1", Uuid::new_v4()).await);

        assert!(manager.select_operator().await.is_none());
        assert!(manager.select_and_assign("CA2", Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn assign_requires_available() {
        let manager = manager_with_online(&["a"]).await;
        let lead = Uuid::new_v4();

        assert!(manager.assign_call("a", "CA1", lead).await);
        let op = manager.get_operator("a").await.unwrap();
        assert_eq!(op.status, OperatorStatus::OnCall);
        assert_eq!(op.current_call_sid.as_deref(), Some("CA1"));
        assert_eq!(op.current_lead_id, Some(lead));

        // Already on a call
        assert!(!manager.assign_call("a", "CA2", Uuid::new_v4()).await);
        // Unknown operator
        assert!(!manager.assign_call("zz", "CA3", Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn concurrent_assigns_cannot_both_win() {
        let manager = Arc::new(manager_with_online(&["a"]).await);
        let lead = Uuid::new_v4();

        let m1 = manager.clone();
        let m2 = manager.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.assign_call("a", "CA1", lead).await }),
            tokio::spawn(async move { m2.assign_call("a", "CA2", lead).await }),
        );
        let wins = [r1.unwrap(), r2.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn select_and_assign_drains_pool() {
        let manager = manager_with_online(&["a", "b"]).await;

        let first = manager.select_and_assign("CA1", Uuid::new_v4()).await.unwrap();
        let second = manager.select_and_assign("CA2", Uuid::new_v4()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(manager.select_and_assign("CA3", Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn end_call_returns_to_available() {
        let manager = manager_with_online(&["a"]).await;
        manager.assign_call("a", "CA1", Uuid::new_v4()).await;

        let op = manager.end_call("a").await.unwrap();
        assert_eq!(op.status, OperatorStatus::Available);
        assert_eq!(op.calls_handled, 1);

        // Not on a call anymore
        assert!(manager.end_call("a").await.is_none());
    }

    #[tokio::test]
    async fn find_by_call_sid() {
        let manager = manager_with_online(&["a", "b"]).await;
        manager.assign_call("b", "CA42", Uuid::new_v4()).await;

        let found = manager.find_operator_by_call("CA42").await.unwrap();
        assert_eq!(found.id, "b");
        assert!(manager.find_operator_by_call("CA99").await.is_none());
    }

    #[tokio::test]
    async fn long_idle_detection() {
        // Zero threshold: any available operator is immediately long-idle
        let manager = OperatorManager::new(0);
        manager.add_operator(OperatorSession::new("a", "A")).await;
        manager.go_online("a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let long_idle = manager.get_long_idle_operators().await;
        assert_eq!(long_idle.len(), 1);
        assert_eq!(long_idle[0].id, "a");

        // On-call operators are never long-idle
        manager.assign_call("a", "CA1", Uuid::new_v4()).await;
        assert!(manager.get_long_idle_operators().await.is_empty());
    }

    #[tokio::test]
    async fn make_available_picks_the_right_transition() {
        let manager = manager_with_online(&["a"]).await;

        manager.go_on_break("a").await.unwrap();
        let op = manager.make_available("a").await.unwrap();
        assert_eq!(op.status, OperatorStatus::Available);

        manager.assign_call("a", "CA1", Uuid::new_v4()).await;
        manager.start_wrap_up("a").await.unwrap();
        let op = manager.make_available("a").await.unwrap();
        assert_eq!(op.status, OperatorStatus::Available);
    }

    #[tokio::test]
    async fn counts_and_removal() {
        let manager = manager_with_online(&["a", "b", "c"]).await;
        manager.go_on_break("a").await.unwrap();
        manager.assign_call("b", "CA1", Uuid::new_v4()).await;

        assert_eq!(manager.available_count().await, 1);
        assert_eq!(manager.on_call_count().await, 1);
        assert_eq!(manager.on_break_count().await, 1);
        assert_eq!(manager.offline_count().await, 0);

        let removed = manager.remove_operator("c").await.unwrap();
        assert_eq!(removed.id, "c");
        assert!(manager.get_operator("c").await.is_none());
        assert_eq!(manager.available_count().await, 0);
    }

    #[tokio::test]
    async fn pool_stats() {
        let manager = manager_with_online(&["a", "b", "c"]).await;
        manager.assign_call("a", "CA1", Uuid::new_v4()).await;
        manager.go_offline("c").await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.on_call, 1);
        assert_eq!(stats.offline, 1);
        assert!((stats.utilization - 0.5).abs() < 1e-9);
    }
}
