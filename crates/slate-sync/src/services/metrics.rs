use crate::keys;
use chrono::NaiveDate;
use slate_cache::QueryCache;
use slate_core::{
    chart_series, ChartPoint, FillMode, Ledger, Period, PeriodSummary, Series, SlateResult, UserId,
    WellbeingSnapshot,
};
use slate_remote::LedgerAccessor;
use tracing::debug;

/// Read-side aggregates over the ledger and wellbeing snapshots
#[derive(Debug, Clone)]
pub struct MetricsService {
    cache: QueryCache,
    ledger: LedgerAccessor,
    user: UserId,
}

impl MetricsService {
    /// Service reading `ledger` for `user`
    #[must_use]
    pub fn new(cache: QueryCache, ledger: LedgerAccessor, user: UserId) -> Self {
        Self { cache, ledger, user }
    }

    /// All ledger rows of the user, cached under the ledger key
    ///
    /// # Errors
    /// The backend error when nothing usable is cached
    pub async fn ledger(&self) -> SlateResult<Ledger> {
        let accessor = self.ledger.clone();
        let user = self.user.clone();
        self.cache
            .fetch_with(&keys::ledger(&self.user), move || async move {
                accessor.load_ledger(&user).await
            })
            .await
    }

    /// Counters for a week or month
    ///
    /// # Errors
    /// Same as [`ledger`](Self::ledger)
    pub async fn summary(&self, period: Period) -> SlateResult<PeriodSummary> {
        Ok(self.ledger().await?.summarize(period))
    }

    /// Per-day counters of the week containing `anchor`, Monday first
    ///
    /// # Errors
    /// Same as [`ledger`](Self::ledger)
    pub async fn daily_breakdown(&self, anchor: NaiveDate) -> SlateResult<[PeriodSummary; 7]> {
        Ok(self.ledger().await?.daily_breakdown(anchor))
    }

    /// Wellbeing snapshots, newest first
    ///
    /// # Errors
    /// The backend error when nothing usable is cached
    pub async fn wellbeing(&self) -> SlateResult<Vec<WellbeingSnapshot>> {
        let accessor = self.ledger.clone();
        let user = self.user.clone();
        self.cache
            .fetch_with(&keys::wellbeing(&self.user), move || async move {
                accessor.wellbeing_snapshots(&user).await
            })
            .await
    }

    /// Daily chart of one wellbeing series between `start` and `end`
    ///
    /// # Errors
    /// Same as [`wellbeing`](Self::wellbeing)
    pub async fn wellbeing_chart(
        &self,
        series: &Series,
        start: NaiveDate,
        end: NaiveDate,
        mode: FillMode,
    ) -> SlateResult<Vec<ChartPoint>> {
        let snapshots = self.wellbeing().await?;
        Ok(chart_series(&snapshots, series, start, end, mode))
    }

    /// Store a new wellbeing snapshot
    ///
    /// # Errors
    /// The backend error; nothing is cached optimistically
    pub async fn record_wellbeing(&self, snapshot: &WellbeingSnapshot) -> SlateResult<WellbeingSnapshot> {
        let stored = self.ledger.record_wellbeing(snapshot).await?;
        let refreshed = self.cache.invalidate(&keys::wellbeing(&self.user));
        debug!(refreshed, "wellbeing snapshot stored");
        Ok(stored)
    }
}
