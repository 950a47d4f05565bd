use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    deid::{generalize::Hierarchy, Row},
    error::{MechanismError, MechanismResult},
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct QuasiIdentifier {
    pub column: String,
    pub hierarchy: Hierarchy,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AnonymityParams {
    pub k: usize,
    pub quasi_identifiers: Vec<QuasiIdentifier>,
    /// Enables l-diversity over `sensitive_column` after k-anonymity.
    #[serde(default)]
    pub l: Option<usize>,
    #[serde(default)]
    pub sensitive_column: Option<String>,
}

impl AnonymityParams {
    pub fn validate(&self) -> MechanismResult<()> {
        if self.k == 0 {
            return Err(MechanismError::InvalidParameter("k must be >= 1".into()));
        }
        if self.quasi_identifiers.is_empty() {
            return Err(MechanismError::InvalidParameter(
                "k-anonymity needs at least one quasi-identifier".into(),
            ));
        }
        for qi in &self.quasi_identifiers {
            qi.hierarchy.validate()?;
        }
        match (self.l, &self.sensitive_column) {
            (Some(0), _) => Err(MechanismError::InvalidParameter("l must be >= 1".into())),
            (Some(_), None) => Err(MechanismError::InvalidParameter(
                "l-diversity needs a sensitive column".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EquivalenceClass {
    pub tuple: Vec<Value>,
    pub size: usize,
    pub distinct_sensitive: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AnonymizedTable {
    /// Surviving rows in input order with quasi-identifiers generalized.
    pub rows: Vec<Row>,
    pub suppressed: usize,
    pub classes: Vec<EquivalenceClass>,
}

struct Grouping<'a> {
    rows: &'a [Row],
    params: &'a AnonymityParams,
    max_levels: Vec<usize>,
    levels: Vec<Vec<usize>>,
    suppressed: Vec<bool>,
}

type ClassKey = Vec<String>;

impl<'a> Grouping<'a> {
    fn new(rows: &'a [Row], params: &'a AnonymityParams) -> Self {
        let width = params.quasi_identifiers.len();
        Self {
            rows,
            params,
            max_levels: params
                .quasi_identifiers
                .iter()
                .map(|qi| qi.hierarchy.max_level())
                .collect(),
            levels: vec![vec![0; width]; rows.len()],
            suppressed: vec![false; rows.len()],
        }
    }

    fn raw(&self, row: usize, column: usize) -> &Value {
        let name = &self.params.quasi_identifiers[column].column;
        self.rows[row].get(name).unwrap_or(&Value::Null)
    }

    fn label(&self, row: usize, column: usize, level: usize) -> Value {
        self.params.quasi_identifiers[column]
            .hierarchy
            .label(self.raw(row, column), level)
    }

    fn key(&self, row: usize) -> ClassKey {
        (0..self.max_levels.len())
            .map(|column| self.label(row, column, self.levels[row][column]).to_string())
            .collect()
    }

    fn classes(&self) -> BTreeMap<ClassKey, Vec<usize>> {
        let mut classes: BTreeMap<ClassKey, Vec<usize>> = BTreeMap::new();
        for row in (0..self.rows.len()).filter(|row| !self.suppressed[*row]) {
            classes.entry(self.key(row)).or_default().push(row);
        }
        classes
    }

    fn distinct_sensitive(&self, members: &[usize]) -> usize {
        let Some(column) = &self.params.sensitive_column else {
            return 0;
        };
        members
            .iter()
            .map(|row| {
                self.rows[*row]
                    .get(column)
                    .unwrap_or(&Value::Null)
                    .to_string()
            })
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Least-generalized column that can still be raised; ties go to the
    /// earlier quasi-identifier.
    fn next_column(&self, row: usize) -> Option<usize> {
        self.levels[row]
            .iter()
            .enumerate()
            .filter(|(column, level)| **level < self.max_levels[*column])
            .min_by_key(|(column, level)| (**level, *column))
            .map(|(column, _)| column)
    }

    fn enforce_k(&mut self) {
        let k = self.params.k;
        loop {
            let mut raised = false;
            for members in self.classes().into_values() {
                if members.len() >= k {
                    continue;
                }
                let Some(column) = self.next_column(members[0]) else {
                    continue;
                };
                let target = self.levels[members[0]][column] + 1;
                for row in members {
                    let level = &mut self.levels[row][column];
                    *level = (*level).max(target).min(self.max_levels[column]);
                }
                raised = true;
            }
            if !raised {
                break;
            }
        }
        for members in self.classes().into_values() {
            if members.len() < k {
                for row in members {
                    self.suppressed[row] = true;
                }
            }
        }
    }

    /// Per-column levels at which the two class leaders first coincide,
    /// plus the number of steps both classes travel to get there.
    fn common_generalization(&self, a: usize, b: usize) -> (usize, Vec<usize>) {
        let mut distance = 0;
        let mut targets = Vec::with_capacity(self.max_levels.len());
        for column in 0..self.max_levels.len() {
            let (la, lb) = (self.levels[a][column], self.levels[b][column]);
            let mut level = la.max(lb);
            while level < self.max_levels[column]
                && self.label(a, column, level) != self.label(b, column, level)
            {
                level += 1;
            }
            distance += (level - la) + (level - lb);
            targets.push(level);
        }
        (distance, targets)
    }

    fn enforce_l(&mut self, l: usize) {
        loop {
            let classes = self.classes();
            let Some((key, members)) = classes
                .iter()
                .find(|(_, members)| self.distinct_sensitive(members) < l)
            else {
                break;
            };
            let nearest = classes
                .iter()
                .filter(|(other, _)| *other != key)
                .map(|(other, others)| {
                    let (distance, targets) = self.common_generalization(members[0], others[0]);
                    (distance, other, others, targets)
                })
                .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
            match nearest {
                Some((distance, _, others, targets)) => {
                    debug!("l-diversity merge classes distance={distance}");
                    for row in members.iter().chain(others.iter()) {
                        for (column, target) in targets.iter().enumerate() {
                            let level = &mut self.levels[*row][column];
                            *level = (*level).max(*target);
                        }
                    }
                }
                None => {
                    for row in members {
                        self.suppressed[*row] = true;
                    }
                }
            }
        }
    }

    fn finish(self) -> AnonymizedTable {
        let classes = self
            .classes()
            .into_values()
            .map(|members| EquivalenceClass {
                tuple: (0..self.max_levels.len())
                    .map(|column| self.label(members[0], column, self.levels[members[0]][column]))
                    .collect(),
                size: members.len(),
                distinct_sensitive: self
                    .params
                    .sensitive_column
                    .as_ref()
                    .map(|_| self.distinct_sensitive(&members)),
            })
            .collect();
        let mut rows = Vec::new();
        for (idx, row) in self.rows.iter().enumerate() {
            if self.suppressed[idx] {
                continue;
            }
            let mut out = row.clone();
            for (column, qi) in self.params.quasi_identifiers.iter().enumerate() {
                out.insert(qi.column.clone(), self.label(idx, column, self.levels[idx][column]));
            }
            rows.push(out);
        }
        AnonymizedTable {
            suppressed: self.suppressed.iter().filter(|flag| **flag).count(),
            rows,
            classes,
        }
    }
}

/// Generalizes quasi-identifiers until every equivalence class holds at least
/// `k` rows, suppressing classes that stay undersized at the top of every
/// ladder. When `l` is set, classes lacking `l` distinct sensitive values are
/// merged with their nearest neighbour, or suppressed when none remain.
pub fn anonymize(rows: &[Row], params: &AnonymityParams) -> MechanismResult<AnonymizedTable> {
    params.validate()?;
    let mut grouping = Grouping::new(rows, params);
    grouping.enforce_k();
    if let Some(l) = params.l {
        grouping.enforce_l(l);
    }
    let table = grouping.finish();
    debug!(
        "anonymized rows={} suppressed={} classes={}",
        rows.len(),
        table.suppressed,
        table.classes.len()
    );
    Ok(table)
}
