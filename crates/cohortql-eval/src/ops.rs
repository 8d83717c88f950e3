//! Scalar operation semantics
//!
//! Every operation here takes nullable operands and returns a nullable result.
//! `And`/`Or` follow three-valued logic, where null means "unknown": `false AND
//! unknown` is false and `true OR unknown` is true, everything else involving
//! unknown stays unknown. `IsNull` never returns null. All other operations
//! propagate null operands. The n-ary minimum/maximum and the aggregations
//! instead disregard nulls and only go null when no value is left.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use chrono::Datelike;
use cohortql_query::{AggregateOp, BinaryOp, NaryOp, UnaryOp, Value, compare_present};

use crate::dates;

pub fn kleene_not(a: Option<bool>) -> Option<bool> {
    a.map(|a| !a)
}

pub fn kleene_and(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

pub fn kleene_or(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

pub fn unary_op(op: UnaryOp, operand: &Option<Value>) -> Option<Value> {
    match op {
        UnaryOp::IsNull => return Some(Value::Bool(operand.is_none())),
        UnaryOp::Not => {
            return kleene_not(operand.as_ref().and_then(Value::as_bool)).map(Value::Bool);
        }
        _ => {}
    }
    let operand = operand.as_ref()?;
    match op {
        UnaryOp::Negate => match operand {
            Value::Int(i) => i.checked_neg().map(Value::Int),
            Value::Float(f) => Some(Value::Float(-f)),
            _ => None,
        },
        UnaryOp::CastToInt => match operand {
            Value::Bool(b) => Some(Value::Int(i64::from(*b))),
            Value::Int(i) => Some(Value::Int(*i)),
            // Truncates toward zero, matching SQL CAST.
            Value::Float(f) => Some(Value::Int(f.trunc() as i64)),
            _ => None,
        },
        UnaryOp::CastToFloat => operand.as_f64().map(Value::Float),
        UnaryOp::YearFromDate => date(operand).map(|d| Value::Int(i64::from(d.year()))),
        UnaryOp::MonthFromDate => date(operand).map(|d| Value::Int(i64::from(d.month()))),
        UnaryOp::DayFromDate => date(operand).map(|d| Value::Int(i64::from(d.day()))),
        UnaryOp::ToFirstOfYear => date(operand).map(|d| Value::Date(dates::to_first_of_year(d))),
        UnaryOp::ToFirstOfMonth => {
            date(operand).map(|d| Value::Date(dates::to_first_of_month(d)))
        }
        UnaryOp::Not | UnaryOp::IsNull => unreachable!(),
    }
}

pub fn binary_op(op: BinaryOp, lhs: &Option<Value>, rhs: &Option<Value>) -> Option<Value> {
    match op {
        BinaryOp::And => {
            return kleene_and(bool_of(lhs), bool_of(rhs)).map(Value::Bool);
        }
        BinaryOp::Or => {
            return kleene_or(bool_of(lhs), bool_of(rhs)).map(Value::Bool);
        }
        _ => {}
    }
    let (a, b) = (lhs.as_ref()?, rhs.as_ref()?);
    match op {
        BinaryOp::Eq => compare(a, b, |o| o == Ordering::Equal),
        BinaryOp::Ne => compare(a, b, |o| o != Ordering::Equal),
        BinaryOp::Lt => compare(a, b, |o| o == Ordering::Less),
        BinaryOp::Le => compare(a, b, |o| o != Ordering::Greater),
        BinaryOp::Gt => compare(a, b, |o| o == Ordering::Greater),
        BinaryOp::Ge => compare(a, b, |o| o != Ordering::Less),
        BinaryOp::Add => arith(a, b, i64::checked_add, |x, y| x + y),
        BinaryOp::Subtract => arith(a, b, i64::checked_sub, |x, y| x - y),
        BinaryOp::Multiply => arith(a, b, i64::checked_mul, |x, y| x * y),
        BinaryOp::TrueDivide => {
            let y = b.as_f64()?;
            if y == 0.0 { None } else { Some(Value::Float(a.as_f64()? / y)) }
        }
        BinaryOp::FloorDivide => match (a, b) {
            (Value::Int(x), Value::Int(y)) => floor_div(*x, *y).map(Value::Int),
            _ => {
                let y = b.as_f64()?;
                if y == 0.0 {
                    None
                } else {
                    Some(Value::Int((a.as_f64()? / y).floor() as i64))
                }
            }
        },
        BinaryOp::StringContains => match (a, b) {
            (Value::Str(haystack), Value::Str(needle)) => {
                Some(Value::Bool(haystack.contains(needle.as_str())))
            }
            _ => None,
        },
        BinaryOp::In => match (a, b) {
            (Value::Str(s), Value::StrSet(set)) => Some(Value::Bool(set.contains(s))),
            _ => None,
        },
        BinaryOp::DateAddDays => date_shift(a, b, dates::date_add_days),
        BinaryOp::DateAddMonths => date_shift(a, b, dates::date_add_months),
        BinaryOp::DateAddYears => date_shift(a, b, dates::date_add_years),
        BinaryOp::DateDifferenceInDays => date_span(a, b, dates::date_difference_in_days),
        BinaryOp::DateDifferenceInMonths => date_span(a, b, dates::date_difference_in_months),
        BinaryOp::DateDifferenceInYears => date_span(a, b, dates::date_difference_in_years),
        BinaryOp::And | BinaryOp::Or => unreachable!(),
    }
}

/// Minimum/maximum across series, disregarding nulls. Null only when every
/// operand is null.
pub fn nary_op(op: NaryOp, operands: &[Option<Value>]) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for value in operands.iter().flatten() {
        best = Some(match best {
            None => value,
            Some(current) => {
                let ordering = compare_present(value, current);
                let wins = match op {
                    NaryOp::MinimumOf => ordering == Ordering::Less,
                    NaryOp::MaximumOf => ordering == Ordering::Greater,
                };
                if wins { value } else { current }
            }
        });
    }
    best.cloned()
}

/// Collapse the non-null values of one patient's rows. Only called for
/// patients that have rows; the engine supplies the no-rows default.
pub fn aggregate_op(op: AggregateOp, values: &[&Value]) -> Option<Value> {
    match op {
        AggregateOp::CountDistinct => {
            let distinct: HashSet<&&Value> = values.iter().collect();
            Some(Value::Int(distinct.len() as i64))
        }
        AggregateOp::Min => fold_extremum(values, Ordering::Less),
        AggregateOp::Max => fold_extremum(values, Ordering::Greater),
        AggregateOp::Sum => {
            if values.is_empty() {
                return None;
            }
            if values.iter().any(|v| matches!(v, Value::Float(_))) {
                let mut total = 0.0;
                for v in values {
                    total += v.as_f64()?;
                }
                Some(Value::Float(total))
            } else {
                let mut total = 0i64;
                for v in values {
                    let Value::Int(i) = v else { return None };
                    total = total.checked_add(*i)?;
                }
                Some(Value::Int(total))
            }
        }
        AggregateOp::Mean => {
            if values.is_empty() {
                return None;
            }
            let mut total = 0.0;
            for v in values {
                total += v.as_f64()?;
            }
            Some(Value::Float(total / values.len() as f64))
        }
        AggregateOp::CombineAsSet => {
            let set: BTreeSet<String> = values
                .iter()
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Some(Value::StrSet(set))
        }
    }
}

fn bool_of(value: &Option<Value>) -> Option<bool> {
    value.as_ref().and_then(Value::as_bool)
}

fn date(value: &Value) -> Option<chrono::NaiveDate> {
    match value {
        Value::Date(d) => Some(*d),
        _ => None,
    }
}

fn compare(a: &Value, b: &Value, test: impl Fn(Ordering) -> bool) -> Option<Value> {
    Some(Value::Bool(test(compare_present(a, b))))
}

fn arith(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y).map(Value::Int),
        _ => Some(Value::Float(float_op(a.as_f64()?, b.as_f64()?))),
    }
}

fn floor_div(x: i64, y: i64) -> Option<i64> {
    if y == 0 {
        return None;
    }
    let q = x.checked_div(y)?;
    if x % y != 0 && (x < 0) != (y < 0) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn date_shift(
    a: &Value,
    b: &Value,
    f: fn(chrono::NaiveDate, i64) -> Option<chrono::NaiveDate>,
) -> Option<Value> {
    match (a, b) {
        (Value::Date(d), Value::Int(n)) => f(*d, *n).map(Value::Date),
        _ => None,
    }
}

fn date_span(
    start: &Value,
    end: &Value,
    f: fn(chrono::NaiveDate, chrono::NaiveDate) -> i64,
) -> Option<Value> {
    match (start, end) {
        (Value::Date(s), Value::Date(e)) => Some(Value::Int(f(*s, *e))),
        _ => None,
    }
}

fn fold_extremum(values: &[&Value], keep: Ordering) -> Option<Value> {
    let mut best: Option<&Value> = None;
    for value in values {
        best = Some(match best {
            None => value,
            Some(current) if compare_present(value, current) == keep => value,
            Some(current) => current,
        });
    }
    best.cloned()
}
