//! Per-entity cleaning and enrichment of staging rows.

use super::rules::{self, Case, NA};
use crate::entity::Entity;
use crate::error::{EtlError, EtlResult};
use crate::record::{FieldValue, StagingRow, TypedRecord};
use chrono::NaiveDate;
use std::collections::HashSet;

/// Applies the rules for one run. Every derivation is relative to `as_of`,
/// which keeps reruns over the same staging content identical.
pub struct Enricher<'a> {
    as_of: NaiveDate,
    known_customers: &'a HashSet<String>,
    nulls_replaced: u64,
}

impl<'a> Enricher<'a> {
    pub fn new(as_of: NaiveDate, known_customers: &'a HashSet<String>) -> Self {
        Self {
            as_of,
            known_customers,
            nulls_replaced: 0,
        }
    }

    pub fn nulls_replaced(&self) -> u64 {
        self.nulls_replaced
    }

    pub fn enrich(&mut self, row: &StagingRow) -> EtlResult<TypedRecord> {
        match row.entity {
            Entity::Branch => self.branch(row),
            Entity::Customer => self.customer(row),
            Entity::Loan => self.loan(row),
            Entity::Transaction => self.transaction(row),
        }
    }

    fn text(&mut self, row: &StagingRow, column: &str, case: Case) -> String {
        let raw = row.get(column);
        if rules::is_null_text(raw) {
            self.nulls_replaced += 1;
            return NA.to_string();
        }
        rules::apply_case(raw.unwrap_or_default().trim(), case)
    }

    fn date(&self, row: &StagingRow, column: &str) -> Option<NaiveDate> {
        rules::parse_date(row.get(column), self.as_of)
    }

    fn require_customer(&self, row: &StagingRow) -> EtlResult<String> {
        let customer_id = row.get("customer_id").map(str::trim).unwrap_or_default();
        if customer_id.is_empty() || !self.known_customers.contains(customer_id) {
            return Err(EtlError::row_transform(
                row.entity,
                &row.natural_key,
                format!("customer '{}' is not a known customer", customer_id),
            ));
        }
        Ok(customer_id.to_string())
    }

    fn require_positive(&self, row: &StagingRow, column: &str) -> EtlResult<f64> {
        match rules::parse_amount(row.get(column)) {
            Some(v) if v > 0.0 => Ok(v),
            _ => Err(EtlError::row_transform(
                row.entity,
                &row.natural_key,
                format!("{} must be a positive amount, got {:?}", column, row.get(column)),
            )),
        }
    }

    fn require_date(&self, row: &StagingRow, column: &str) -> EtlResult<NaiveDate> {
        self.date(row, column).ok_or_else(|| {
            EtlError::row_transform(
                row.entity,
                &row.natural_key,
                format!("{} is not a valid date, got {:?}", column, row.get(column)),
            )
        })
    }

    fn finish(row: &StagingRow, builder: crate::record::RecordBuilder) -> EtlResult<TypedRecord> {
        builder
            .build()
            .map_err(|e| EtlError::row_transform(row.entity, &row.natural_key, e.to_string()))
    }

    fn branch(&mut self, row: &StagingRow) -> EtlResult<TypedRecord> {
        let state = self.text(row, "state", Case::Upper);
        let region = rules::region_for_state(&state);
        let builder = TypedRecord::builder(Entity::Branch)
            .set("branch_id", row.natural_key.as_str())
            .set("branch_name", self.text(row, "branch_name", Case::Title))
            .set("city", self.text(row, "city", Case::Title))
            .set("manager_name", self.text(row, "manager_name", Case::Title))
            .set("region", region)
            .set("state", state);
        Self::finish(row, builder)
    }

    fn customer(&mut self, row: &StagingRow) -> EtlResult<TypedRecord> {
        let dob = self.date(row, "dob");
        let opened = self.date(row, "account_open_date");
        let age = dob.map_or(0, |d| rules::age_on(d, self.as_of));
        let tenure = opened.map_or(0, |d| rules::tenure_days(d, self.as_of));

        let builder = TypedRecord::builder(Entity::Customer)
            .set("customer_id", row.natural_key.as_str())
            .set("branch_id", self.text(row, "branch_id", Case::Keep))
            .set("first_name", self.text(row, "first_name", Case::Title))
            .set("last_name", self.text(row, "last_name", Case::Title))
            .set("dob", dob)
            .set("age", age)
            .set("gender", rules::normalize_gender(row.get("gender")))
            .set("email", self.text(row, "email", Case::Lower))
            .set("phone", self.text(row, "phone", Case::Keep))
            .set("address", self.text(row, "address", Case::Title))
            .set("account_open_date", opened)
            .set("customer_tenure_days", tenure)
            .set("customer_segment", rules::customer_segment(tenure))
            .set("outlier_flag", false);
        Self::finish(row, builder)
    }

    fn loan(&mut self, row: &StagingRow) -> EtlResult<TypedRecord> {
        let customer_id = self.require_customer(row)?;
        let amount = self.require_positive(row, "loan_amount")?;
        let start = self.require_date(row, "start_date")?;
        let end = self.date(row, "end_date");
        let rate = rules::parse_amount(row.get("interest_rate")).unwrap_or(0.0);
        let duration = end.and_then(|end| rules::duration_months(start, end));

        let builder = TypedRecord::builder(Entity::Loan)
            .set("loan_id", row.natural_key.as_str())
            .set("customer_id", customer_id)
            .set("loan_type", self.text(row, "loan_type", Case::Title))
            .set("loan_amount", amount)
            .set("interest_rate", rate)
            .set("start_date", start)
            .set("end_date", end)
            .set("loan_status", self.text(row, "loan_status", Case::Title))
            .set("loan_duration_months", duration)
            .set("risk_category", rules::risk_category(amount))
            .set("outlier_flag", false);
        Self::finish(row, builder)
    }

    fn transaction(&mut self, row: &StagingRow) -> EtlResult<TypedRecord> {
        let customer_id = self.require_customer(row)?;
        let amount = self.require_positive(row, "amount")?;
        let date = self.require_date(row, "transaction_date")?;
        let balance = rules::parse_amount(row.get("balance_after")).unwrap_or(0.0);

        let builder = TypedRecord::builder(Entity::Transaction)
            .set("transaction_id", row.natural_key.as_str())
            .set("customer_id", customer_id)
            .set("transaction_date", date)
            .set("transaction_type", self.text(row, "transaction_type", Case::Upper))
            .set("amount", amount)
            .set("balance_after", balance)
            .set("fraud_flag", rules::parse_flag(row.get("fraud_flag")))
            .set("transaction_category", rules::transaction_category(amount))
            .set("outlier_flag", false);
        Self::finish(row, builder)
    }
}

/// Column whose distribution decides `outlier_flag`, if the entity has one.
pub fn outlier_column(entity: Entity) -> Option<&'static str> {
    match entity {
        Entity::Loan => Some("loan_amount"),
        Entity::Transaction => Some("amount"),
        Entity::Branch | Entity::Customer => None,
    }
}

/// Flag records whose amount lies outside the IQR fences of the batch.
/// Returns the number flagged.
pub fn flag_outliers(records: &mut [TypedRecord]) -> u64 {
    let Some(entity) = records.first().map(|r| r.entity) else {
        return 0;
    };
    let Some(column) = outlier_column(entity) else {
        return 0;
    };

    let amounts: Vec<f64> = records
        .iter()
        .filter_map(|r| r.get(column).and_then(FieldValue::as_real))
        .collect();
    let Some((low, high)) = rules::iqr_fences(&amounts) else {
        return 0;
    };

    let mut flagged = 0;
    for record in records.iter_mut() {
        let is_outlier = record
            .get(column)
            .and_then(FieldValue::as_real)
            .is_some_and(|v| v < low || v > high);
        if is_outlier {
            record.set("outlier_flag", FieldValue::Boolean(true));
            flagged += 1;
        }
    }
    flagged
}
