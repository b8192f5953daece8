//! The process-wide component graph
//!
//! One [`Context`] is built per client and handed to every component that
//! needs a collaborator, instead of reaching for globals. Cloning is cheap:
//! every field is a shared handle.

use crate::config::ResilienceConfig;
use crate::connectivity::{ConnectivityMonitor, RecoverySteps};
use crate::metrics::ClientMetrics;
use crate::notice::{Notice, Notices};
use crate::reconciler::SubscriptionReconciler;
use crate::registry::ChannelRegistry;
use crate::remote::Remote;
use crate::session::SessionKeeper;
use async_trait::async_trait;
use lotsync_core::{Error, Mutation, Query, Record, Result};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct Context {
    pub config: ResilienceConfig,
    pub remote: Remote,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub registry: Arc<ChannelRegistry>,
    pub session: Arc<SessionKeeper>,
    pub reconciler: Arc<SubscriptionReconciler>,
    pub notices: Notices,
    pub metrics: Option<Arc<ClientMetrics>>,
}

impl Context {
    /// Read rows of `T`, skipping any that fail to decode
    pub async fn fetch<T: Record>(&self, label: &str, query: Query) -> Result<Vec<T>> {
        let rows = self
            .remote
            .call(
                label,
                &self.config.query_retry,
                self.config.query_timeout,
                move |b| {
                    let query = query.clone();
                    async move { b.query(&query).await }
                },
            )
            .await?;
        Ok(decode_rows(rows))
    }

    pub async fn fetch_one<T: Record>(&self, label: &str, query: Query) -> Result<Option<T>> {
        Ok(self.fetch(label, query.limit(1)).await?.into_iter().next())
    }

    pub async fn mutate(&self, label: &str, mutation: Mutation) -> Result<Value> {
        self.remote
            .call(
                label,
                &self.config.query_retry,
                self.config.query_timeout,
                move |b| {
                    let mutation = mutation.clone();
                    async move { b.mutate(&mutation).await }
                },
            )
            .await
    }

    pub async fn rpc(&self, name: &str, params: Value) -> Result<Value> {
        let procedure = name.to_string();
        self.remote
            .call(
                name,
                &self.config.query_retry,
                self.config.query_timeout,
                move |b| {
                    let procedure = procedure.clone();
                    let params = params.clone();
                    async move { b.rpc(&procedure, params).await }
                },
            )
            .await
    }

    /// Surface a failed user-initiated operation
    pub fn report(&self, error: &Error) {
        self.notices.publish(Notice::from_error(error));
    }

    pub fn record_rollback(&self, entity: &str) {
        if let Some(ref m) = self.metrics {
            m.record_rollback(entity);
        }
    }
}

pub(crate) fn decode_rows<T: Record>(rows: Vec<Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match lotsync_core::from_row(row) {
            Ok(record) => Some(record),
            Err(error) => {
                tracing::warn!(table = T::TABLE, error = %error, "skipping undecodable row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl RecoverySteps for Context {
    async fn refresh_session(&self) -> Result<()> {
        self.session.refresh_session().await
    }

    async fn probe_query(&self) -> Result<()> {
        let query = Query::table("profiles").head().limit(1);
        self.remote
            .call(
                "probe query",
                &self.config.reconnect_retry,
                self.config.probe_timeout,
                move |b| {
                    let query = query.clone();
                    async move { b.query(&query).await }
                },
            )
            .await
            .map(|_| ())
    }

    async fn restore_channels(&self) -> Result<()> {
        let closed = self.registry.cleanup_all().await;
        let live = self.reconciler.recreate_all().await;
        let wanted = self.reconciler.wanted_topics().len();
        tracing::info!(closed, live, wanted, "channels restored");
        if live < wanted {
            return Err(Error::Subscription(format!(
                "{} of {} feeds could not be reopened",
                wanted - live,
                wanted
            )));
        }
        Ok(())
    }
}
