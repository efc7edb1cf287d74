use txn_middleware::ErrorKind;

use crate::model::UnitRecord;

pub(crate) struct Oracle;

impl Oracle {
    pub(crate) fn check(unit: &UnitRecord, max_attempts: u32) -> Result<(), String> {
        let max = u64::from(max_attempts);
        let committed = unit.after.transactions_committed - unit.before.transactions_committed;
        let controllers = unit.after.controllers_created - unit.before.controllers_created;

        if unit.attempts == 0 || unit.attempts > max {
            return Err(format!(
                "{} attempts outside 1..={max} (plan {:?})",
                unit.attempts, unit.plan.values
            ));
        }
        if unit.work_calls > unit.attempts {
            return Err(format!(
                "work ran {} times for {} attempts",
                unit.work_calls, unit.attempts
            ));
        }
        if controllers != 1 {
            return Err(format!("{controllers} controllers created for one unit"));
        }

        match unit.result {
            Ok(total) => {
                if total != unit.plan.expected() {
                    return Err(format!(
                        "read back {total}, expected {} (plan {:?})",
                        unit.plan.expected(),
                        unit.plan.values
                    ));
                }
                if committed != 1 {
                    return Err(format!("successful unit committed {committed} times"));
                }
            }
            Err(kind) => {
                if committed != 0 {
                    return Err(format!("failed unit ({kind:?}) committed {committed} times"));
                }
                if kind == ErrorKind::TransientServer && unit.attempts != max {
                    return Err(format!(
                        "gave up on a transient failure after {} of {max} attempts",
                        unit.attempts
                    ));
                }
                if !matches!(
                    kind,
                    ErrorKind::TransientServer | ErrorKind::Query | ErrorKind::Connection
                ) {
                    return Err(format!("unexpected failure kind {kind:?}"));
                }
            }
        }

        if unit.after.live_transactions != 0 {
            return Err(format!(
                "{} transactions still live after the unit",
                unit.after.live_transactions
            ));
        }
        if unit.after.live_controllers() != 0 {
            return Err(format!(
                "{} retry controllers never released",
                unit.after.live_controllers()
            ));
        }
        if unit.open_sessions != 0 {
            return Err(format!(
                "{} server-side transactions left open",
                unit.open_sessions
            ));
        }
        Ok(())
    }
}
