//! In-memory tables
//!
//! The database holds one-row-per-patient tables and many-rows-per-patient
//! event tables, both columnar. Event rows get a stable [`RowId`] at load time
//! which survives filtering, so series derived at different filter depths stay
//! alignable.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;

use cohortql_query::{PatientId, Value};

use crate::column::{EventColumn, PatientColumn, RowId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientTable {
    patients: BTreeSet<PatientId>,
    columns: IndexMap<String, PatientColumn>,
}

impl PatientTable {
    pub fn from_rows(
        column_names: &[String],
        rows: Vec<(PatientId, Vec<Option<Value>>)>,
    ) -> Self {
        let mut patients = BTreeSet::new();
        let mut columns: IndexMap<String, PatientColumn> = column_names
            .iter()
            .map(|name| (name.clone(), PatientColumn::from_default(None)))
            .collect();
        for (patient, values) in rows {
            patients.insert(patient);
            for (column, value) in columns.values_mut().zip(values) {
                column.insert(patient, value);
            }
        }
        Self { patients, columns }
    }

    pub fn column(&self, name: &str) -> Option<&PatientColumn> {
        self.columns.get(name)
    }

    pub fn insert_column(&mut self, name: String, column: PatientColumn) {
        self.patients.extend(column.patients());
        self.columns.insert(name, column);
    }

    pub fn patients(&self) -> &BTreeSet<PatientId> {
        &self.patients
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    rows: BTreeMap<PatientId, Vec<RowId>>,
    columns: IndexMap<String, EventColumn>,
}

impl EventTable {
    /// Build from input rows, assigning row ids in input order.
    pub fn from_rows(
        column_names: &[String],
        rows: Vec<(PatientId, Vec<Option<Value>>)>,
    ) -> Self {
        let mut table = Self {
            rows: BTreeMap::new(),
            columns: column_names
                .iter()
                .map(|name| (name.clone(), EventColumn::default()))
                .collect(),
        };
        for (row_id, (patient, values)) in rows.into_iter().enumerate() {
            let row_id = row_id as RowId;
            table.rows.entry(patient).or_default().push(row_id);
            for (column, value) in table.columns.values_mut().zip(values) {
                column.insert(patient, row_id, value);
            }
        }
        table
    }

    pub fn column(&self, name: &str) -> Option<&EventColumn> {
        self.columns.get(name)
    }

    pub fn patients(&self) -> impl Iterator<Item = PatientId> + '_ {
        self.rows.keys().copied()
    }

    pub fn rows(&self) -> &BTreeMap<PatientId, Vec<RowId>> {
        &self.rows
    }

    /// True per patient with at least one row, false for everyone else.
    pub fn exists(&self) -> PatientColumn {
        let mut out = PatientColumn::from_default(Some(Value::Bool(false)));
        for &patient in self.rows.keys() {
            out.insert(patient, Some(Value::Bool(true)));
        }
        out
    }

    /// Row count per patient, zero for patients with no rows.
    pub fn count(&self) -> PatientColumn {
        let mut out = PatientColumn::from_default(Some(Value::Int(0)));
        for (&patient, rows) in &self.rows {
            out.insert(patient, Some(Value::Int(rows.len() as i64)));
        }
        out
    }

    /// Keep only the rows `keep` approves, dropping patients left with none.
    pub fn retain_rows(&self, keep: impl Fn(PatientId, RowId) -> bool) -> Self {
        let mut out = Self {
            rows: BTreeMap::new(),
            columns: self
                .columns
                .keys()
                .map(|name| (name.clone(), EventColumn::default()))
                .collect(),
        };
        for (&patient, rows) in &self.rows {
            for &row in rows {
                if !keep(patient, row) {
                    continue;
                }
                out.rows.entry(patient).or_default().push(row);
                for (name, column) in &mut out.columns {
                    let value = self.columns[name.as_str()]
                        .rows_for(patient)
                        .and_then(|r| r.get(&row).cloned())
                        .flatten();
                    column.insert(patient, row, value);
                }
            }
        }
        out
    }
}

/// The complete data backing one evaluation.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    patient_tables: IndexMap<String, PatientTable>,
    event_tables: IndexMap<String, EventTable>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patient_table(
        &mut self,
        name: impl Into<String>,
        column_names: &[&str],
        rows: Vec<(PatientId, Vec<Option<Value>>)>,
    ) {
        let column_names: Vec<String> = column_names.iter().map(|s| s.to_string()).collect();
        self.patient_tables
            .insert(name.into(), PatientTable::from_rows(&column_names, rows));
    }

    pub fn add_event_table(
        &mut self,
        name: impl Into<String>,
        column_names: &[&str],
        rows: Vec<(PatientId, Vec<Option<Value>>)>,
    ) {
        let column_names: Vec<String> = column_names.iter().map(|s| s.to_string()).collect();
        self.event_tables
            .insert(name.into(), EventTable::from_rows(&column_names, rows));
    }

    pub fn patient_table(&self, name: &str) -> Option<&PatientTable> {
        self.patient_tables.get(name)
    }

    pub fn event_table(&self, name: &str) -> Option<&EventTable> {
        self.event_tables.get(name)
    }

    /// Every patient mentioned by any loaded table.
    pub fn all_patients(&self) -> BTreeSet<PatientId> {
        let mut all = BTreeSet::new();
        for table in self.patient_tables.values() {
            all.extend(table.patients().iter().copied());
        }
        for table in self.event_tables.values() {
            all.extend(table.patients());
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Option<Value> {
        Some(Value::Int(i))
    }

    #[test]
    fn event_tables_assign_stable_row_ids() {
        let table = EventTable::from_rows(
            &["v".to_string()],
            vec![(1, vec![int(10)]), (2, vec![int(20)]), (1, vec![int(30)])],
        );
        assert_eq!(table.rows()[&1], vec![0, 2]);
        assert_eq!(table.rows()[&2], vec![1]);
        assert_eq!(table.column("v").unwrap().get(1, 2), int(30));
    }

    #[test]
    fn retain_rows_drops_emptied_patients_but_keeps_ids() {
        let table = EventTable::from_rows(
            &["v".to_string()],
            vec![(1, vec![int(10)]), (1, vec![int(30)]), (2, vec![int(20)])],
        );
        let filtered = table.retain_rows(|_, row| row == 1);
        assert_eq!(filtered.rows().len(), 1);
        assert_eq!(filtered.rows()[&1], vec![1]);
        assert_eq!(filtered.column("v").unwrap().get(1, 1), int(30));
        assert_eq!(filtered.count().get(2), int(0));
    }

    #[test]
    fn all_patients_spans_both_table_kinds() {
        let mut db = InMemoryDatabase::new();
        db.add_patient_table("patients", &["dob"], vec![(1, vec![None]), (2, vec![None])]);
        db.add_event_table("events", &["v"], vec![(3, vec![int(1)])]);
        assert_eq!(db.all_patients(), BTreeSet::from([1, 2, 3]));
    }
}
