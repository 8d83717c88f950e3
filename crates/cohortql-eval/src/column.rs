//! Columnar series representations
//!
//! A [`PatientColumn`] holds at most one value per patient and is sparse: any
//! patient without an explicit entry takes the column's default. An
//! [`EventColumn`] holds one value per event row, keyed by the row's stable
//! identity so that columns derived from a frame and from a filtered child of
//! that frame can still be combined row-for-row.

use std::collections::BTreeMap;

use cohortql_query::{PatientId, Value};

/// Stable identity of one event row within its base table.
pub type RowId = u64;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientColumn {
    values: BTreeMap<PatientId, Option<Value>>,
    default: Option<Value>,
}

impl PatientColumn {
    pub fn from_default(default: Option<Value>) -> Self {
        Self { values: BTreeMap::new(), default }
    }

    pub fn insert(&mut self, patient: PatientId, value: Option<Value>) {
        self.values.insert(patient, value);
    }

    pub fn get(&self, patient: PatientId) -> Option<Value> {
        self.values.get(&patient).unwrap_or(&self.default).clone()
    }

    pub fn default_value(&self) -> &Option<Value> {
        &self.default
    }

    /// Patients with an explicit entry.
    pub fn patients(&self) -> impl Iterator<Item = PatientId> + '_ {
        self.values.keys().copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventColumn {
    rows: BTreeMap<PatientId, BTreeMap<RowId, Option<Value>>>,
}

impl EventColumn {
    pub fn insert(&mut self, patient: PatientId, row: RowId, value: Option<Value>) {
        self.rows.entry(patient).or_default().insert(row, value);
    }

    pub fn get(&self, patient: PatientId, row: RowId) -> Option<Value> {
        self.rows.get(&patient).and_then(|rows| rows.get(&row).cloned().flatten())
    }

    pub fn patients(&self) -> impl Iterator<Item = PatientId> + '_ {
        self.rows.keys().copied()
    }

    pub fn rows_for(&self, patient: PatientId) -> Option<&BTreeMap<RowId, Option<Value>>> {
        self.rows.get(&patient)
    }

    /// Collapse to one value per patient: `f` sees the non-null values of each
    /// patient that has rows, in row order; everyone else takes `default`.
    pub fn aggregate(
        &self,
        default: Option<Value>,
        f: impl Fn(&[&Value]) -> Option<Value>,
    ) -> PatientColumn {
        let mut out = PatientColumn::from_default(default);
        for (&patient, rows) in &self.rows {
            let present: Vec<&Value> = rows.values().flatten().collect();
            out.insert(patient, f(&present));
        }
        out
    }
}

/// A series over either cardinality.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Patient(PatientColumn),
    Event(EventColumn),
}

impl Column {
    /// The series value at one event row, broadcasting patient-level series
    /// across the patient's rows.
    pub fn cell(&self, patient: PatientId, row: RowId) -> Option<Value> {
        match self {
            Column::Patient(c) => c.get(patient),
            Column::Event(c) => c.get(patient, row),
        }
    }
}

/// Combine aligned series element-wise.
///
/// With event operands the result is an event series over the rows common to
/// every event operand, which by the domain rules is the row set of the most
/// deeply filtered one. With only patient operands the result is patient
/// level, defined wherever any operand is explicitly defined and defaulting to
/// `f` over the operand defaults everywhere else.
pub fn apply(
    columns: &[&Column],
    f: impl Fn(&[Option<Value>]) -> Option<Value>,
) -> Column {
    let event_columns: Vec<&EventColumn> = columns
        .iter()
        .filter_map(|c| match c {
            Column::Event(e) => Some(e),
            Column::Patient(_) => None,
        })
        .collect();

    let Some((first, rest)) = event_columns.split_first() else {
        let mut args = Vec::with_capacity(columns.len());
        let mut out = PatientColumn::from_default(f(&collect_defaults(columns)));
        let mut patients: Vec<PatientId> = columns
            .iter()
            .filter_map(|c| match c {
                Column::Patient(p) => Some(p.patients()),
                Column::Event(_) => None,
            })
            .flatten()
            .collect();
        patients.sort_unstable();
        patients.dedup();
        for patient in patients {
            args.clear();
            for c in columns {
                match c {
                    Column::Patient(p) => args.push(p.get(patient)),
                    Column::Event(_) => unreachable!(),
                }
            }
            out.insert(patient, f(&args));
        }
        return Column::Patient(out);
    };

    let mut out = EventColumn::default();
    for patient in first.patients() {
        let Some(rows) = first.rows_for(patient) else { continue };
        for &row in rows.keys() {
            if !rest
                .iter()
                .all(|c| c.rows_for(patient).is_some_and(|r| r.contains_key(&row)))
            {
                continue;
            }
            let args: Vec<Option<Value>> = columns.iter().map(|c| c.cell(patient, row)).collect();
            out.insert(patient, row, f(&args));
        }
    }
    Column::Event(out)
}

fn collect_defaults(columns: &[&Column]) -> Vec<Option<Value>> {
    columns
        .iter()
        .map(|c| match c {
            Column::Patient(p) => p.default_value().clone(),
            Column::Event(_) => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use cohortql_query::BinaryOp;

    fn int(i: i64) -> Option<Value> {
        Some(Value::Int(i))
    }

    #[test]
    fn patient_columns_fall_back_to_the_default() {
        let mut c = PatientColumn::from_default(int(0));
        c.insert(1, int(10));
        c.insert(2, None);
        assert_eq!(c.get(1), int(10));
        assert_eq!(c.get(2), None);
        assert_eq!(c.get(3), int(0));
    }

    #[test]
    fn patient_level_apply_covers_every_explicit_patient() {
        let mut a = PatientColumn::from_default(None);
        a.insert(1, int(1));
        let mut b = PatientColumn::from_default(int(100));
        b.insert(2, int(2));
        let out = apply(&[&Column::Patient(a), &Column::Patient(b)], |args| {
            ops::binary_op(BinaryOp::Add, &args[0], &args[1])
        });
        let Column::Patient(out) = out else { panic!() };
        assert_eq!(out.get(1), int(101));
        assert_eq!(out.get(2), None); // 2 has no value for `a`
        assert_eq!(*out.default_value(), None);
    }

    #[test]
    fn event_apply_intersects_row_identities() {
        let mut full = EventColumn::default();
        full.insert(1, 0, int(10));
        full.insert(1, 1, int(20));
        full.insert(1, 2, int(30));
        // A filtered child kept only rows 0 and 2.
        let mut narrow = EventColumn::default();
        narrow.insert(1, 0, int(1));
        narrow.insert(1, 2, int(3));

        let out = apply(&[&Column::Event(full), &Column::Event(narrow)], |args| {
            ops::binary_op(BinaryOp::Add, &args[0], &args[1])
        });
        let Column::Event(out) = out else { panic!() };
        assert_eq!(out.get(1, 0), int(11));
        assert_eq!(out.get(1, 1), None);
        assert_eq!(out.get(1, 2), int(33));
    }

    #[test]
    fn patient_series_broadcast_across_rows() {
        let mut events = EventColumn::default();
        events.insert(1, 0, int(10));
        events.insert(1, 1, int(20));
        let mut per_patient = PatientColumn::from_default(None);
        per_patient.insert(1, int(5));

        let out = apply(
            &[&Column::Event(events), &Column::Patient(per_patient)],
            |args| ops::binary_op(BinaryOp::Add, &args[0], &args[1]),
        );
        let Column::Event(out) = out else { panic!() };
        assert_eq!(out.get(1, 0), int(15));
        assert_eq!(out.get(1, 1), int(25));
    }

    #[test]
    fn aggregation_skips_null_cells_and_defaults_absent_patients() {
        let mut c = EventColumn::default();
        c.insert(1, 0, int(1));
        c.insert(1, 1, None);
        c.insert(1, 2, int(2));
        let out = c.aggregate(int(0), |values| {
            ops::aggregate_op(cohortql_query::AggregateOp::Sum, values)
        });
        assert_eq!(out.get(1), int(3));
        assert_eq!(out.get(9), int(0));
    }
}
