use serde::Serialize;
use txn_middleware::{ConnectionMetrics, ErrorKind};

/// One unit of work: read back each parameter and sum the values.
#[derive(Debug, Clone)]
pub(crate) struct UnitPlan {
    pub(crate) values: Vec<i64>,
}

impl UnitPlan {
    pub(crate) fn expected(&self) -> i64 {
        self.values.iter().sum()
    }
}

/// What the driver observed for one unit.
#[derive(Debug, Clone)]
pub(crate) struct UnitRecord {
    pub(crate) plan: UnitPlan,
    pub(crate) result: Result<i64, ErrorKind>,
    /// `open_transaction` calls made for this unit, failed ones included
    pub(crate) attempts: u64,
    pub(crate) work_calls: u64,
    pub(crate) before: ConnectionMetrics,
    pub(crate) after: ConnectionMetrics,
    pub(crate) open_sessions: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub(crate) struct FaultStats {
    /// `open_transaction` calls seen, faulted or not
    pub(crate) opens: u64,
    pub(crate) transient: u64,
    pub(crate) query: u64,
    pub(crate) io: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub(crate) struct Totals {
    pub(crate) units: u64,
    pub(crate) committed: u64,
    pub(crate) gave_up_transient: u64,
    pub(crate) gave_up_query: u64,
    pub(crate) gave_up_connection: u64,
    pub(crate) retried_units: u64,
    pub(crate) attempts: u64,
}

impl Totals {
    pub(crate) fn record(&mut self, unit: &UnitRecord) {
        self.units += 1;
        self.attempts += unit.attempts;
        if unit.attempts > 1 {
            self.retried_units += 1;
        }
        match unit.result {
            Ok(_) => self.committed += 1,
            Err(ErrorKind::TransientServer) => self.gave_up_transient += 1,
            Err(ErrorKind::Query) => self.gave_up_query += 1,
            Err(_) => self.gave_up_connection += 1,
        }
    }
}
