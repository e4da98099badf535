//! Invoice type configuration: percentage shares, due-date policies and the
//! explicit set of invoice kinds a quote is billed with.

use crate::error::BillingError;
use crate::models::{InvoiceKind, InvoiceType};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_GRACE_HOURS: i64 = 48;

/// Invoice types used when neither configuration nor the ledger supply any.
pub fn default_invoice_types() -> Vec<InvoiceType> {
    vec![
        InvoiceType {
            invoice_type_id: 1,
            kind: InvoiceKind::Deposit,
            percentage: Decimal::new(25, 2),
        },
        InvoiceType {
            invoice_type_id: 2,
            kind: InvoiceKind::Remaining,
            percentage: Decimal::new(75, 2),
        },
        InvoiceType {
            invoice_type_id: 3,
            kind: InvoiceKind::Full,
            percentage: Decimal::ONE,
        },
    ]
}

/// When an invoice falls due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueDatePolicy {
    /// Due when issued.
    Immediate,
    /// Due this long before the event starts.
    BeforeEvent(Duration),
}

impl DueDatePolicy {
    pub fn due_date(&self, now: DateTime<Utc>, event_date: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            DueDatePolicy::Immediate => now,
            DueDatePolicy::BeforeEvent(window) => event_date - *window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedType {
    pub invoice_type: InvoiceType,
    pub due_date_policy: DueDatePolicy,
}

impl ResolvedType {
    pub fn percentage(&self) -> Decimal {
        self.invoice_type.percentage
    }

    pub fn kind(&self) -> InvoiceKind {
        self.invoice_type.kind
    }
}

/// Desired invoice set for a quote. Full billing and the deposit/remaining
/// split never coexist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPlan {
    Full,
    Split,
}

impl BillingPlan {
    pub fn kinds(&self) -> &'static [InvoiceKind] {
        match self {
            BillingPlan::Full => &[InvoiceKind::Full],
            BillingPlan::Split => &[InvoiceKind::Deposit, InvoiceKind::Remaining],
        }
    }

    /// Plan an invoice of `kind` belongs to.
    pub fn of_kind(kind: InvoiceKind) -> Self {
        match kind {
            InvoiceKind::Full => BillingPlan::Full,
            InvoiceKind::Deposit | InvoiceKind::Remaining => BillingPlan::Split,
        }
    }

    /// Build a plan from a requested set of kinds: exactly `{Full}` or
    /// exactly `{Deposit, Remaining}`.
    pub fn from_kinds(kinds: &[InvoiceKind]) -> Result<Self, BillingError> {
        let has = |k: InvoiceKind| kinds.contains(&k);
        let full = has(InvoiceKind::Full);
        let split = has(InvoiceKind::Deposit) || has(InvoiceKind::Remaining);

        match (full, split) {
            (true, false) => Ok(BillingPlan::Full),
            (false, true) if has(InvoiceKind::Deposit) && has(InvoiceKind::Remaining) => {
                Ok(BillingPlan::Split)
            }
            (false, true) => Err(BillingError::Validation(
                "deposit and remaining invoices must be requested together".to_string(),
            )),
            (true, true) => Err(BillingError::Validation(
                "full invoice cannot be combined with deposit or remaining invoices".to_string(),
            )),
            (false, false) => Err(BillingError::Validation(
                "no invoice types requested".to_string(),
            )),
        }
    }
}

/// Maps invoice type ids to their share and due-date policy.
#[derive(Debug, Clone)]
pub struct InvoiceTypeResolver {
    types: HashMap<i32, InvoiceType>,
    grace_window: Duration,
}

impl InvoiceTypeResolver {
    /// Validates the type table: one type per kind, deposit in (0, 1),
    /// deposit + remaining = 1 and full = 1.
    pub fn new(types: Vec<InvoiceType>, grace_window: Duration) -> Result<Self, BillingError> {
        if grace_window < Duration::zero() {
            return Err(BillingError::Config(
                "grace window must not be negative".to_string(),
            ));
        }

        let mut by_id = HashMap::new();
        let mut by_kind: HashMap<InvoiceKind, Decimal> = HashMap::new();
        for invoice_type in types {
            if by_kind
                .insert(invoice_type.kind, invoice_type.percentage)
                .is_some()
            {
                return Err(BillingError::Config(format!(
                    "invoice kind '{}' is configured more than once",
                    invoice_type.kind
                )));
            }
            if let Some(previous) = by_id.insert(invoice_type.invoice_type_id, invoice_type) {
                return Err(BillingError::Config(format!(
                    "invoice type id {} is configured more than once",
                    previous.invoice_type_id
                )));
            }
        }

        let share = |kind: InvoiceKind| {
            by_kind
                .get(&kind)
                .copied()
                .ok_or_else(|| BillingError::Config(format!("invoice kind '{}' is not configured", kind)))
        };
        let deposit = share(InvoiceKind::Deposit)?;
        let remaining = share(InvoiceKind::Remaining)?;
        let full = share(InvoiceKind::Full)?;

        if deposit <= Decimal::ZERO || deposit >= Decimal::ONE {
            return Err(BillingError::Config(format!(
                "deposit percentage must be between 0 and 1, got {}",
                deposit
            )));
        }
        if deposit + remaining != Decimal::ONE {
            return Err(BillingError::Config(format!(
                "deposit and remaining percentages must sum to 1, got {} + {}",
                deposit, remaining
            )));
        }
        if full != Decimal::ONE {
            return Err(BillingError::Config(format!(
                "full invoice percentage must be 1, got {}",
                full
            )));
        }

        Ok(Self {
            types: by_id,
            grace_window,
        })
    }

    pub fn with_defaults() -> Result<Self, BillingError> {
        Self::new(default_invoice_types(), Duration::hours(DEFAULT_GRACE_HOURS))
    }

    pub fn resolve(&self, invoice_type_id: i32) -> Result<ResolvedType, BillingError> {
        let invoice_type = self.types.get(&invoice_type_id).ok_or_else(|| {
            BillingError::NotFound(format!("invoice type {}", invoice_type_id))
        })?;
        Ok(ResolvedType {
            invoice_type: invoice_type.clone(),
            due_date_policy: self.policy_for(invoice_type.kind),
        })
    }

    pub fn resolve_kind(&self, kind: InvoiceKind) -> Result<ResolvedType, BillingError> {
        let invoice_type = self
            .types
            .values()
            .find(|t| t.kind == kind)
            .ok_or_else(|| BillingError::NotFound(format!("invoice kind '{}'", kind)))?;
        self.resolve(invoice_type.invoice_type_id)
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    fn policy_for(&self, kind: InvoiceKind) -> DueDatePolicy {
        match kind {
            InvoiceKind::Deposit | InvoiceKind::Full => DueDatePolicy::Immediate,
            InvoiceKind::Remaining => DueDatePolicy::BeforeEvent(self.grace_window),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn types(deposit: Decimal, remaining: Decimal, full: Decimal) -> Vec<InvoiceType> {
        vec![
            InvoiceType {
                invoice_type_id: 1,
                kind: InvoiceKind::Deposit,
                percentage: deposit,
            },
            InvoiceType {
                invoice_type_id: 2,
                kind: InvoiceKind::Remaining,
                percentage: remaining,
            },
            InvoiceType {
                invoice_type_id: 3,
                kind: InvoiceKind::Full,
                percentage: full,
            },
        ]
    }

    #[test]
    fn default_split_sums_to_one() {
        let resolver = InvoiceTypeResolver::with_defaults().unwrap();
        let deposit = resolver.resolve_kind(InvoiceKind::Deposit).unwrap();
        let remaining = resolver.resolve_kind(InvoiceKind::Remaining).unwrap();
        assert_eq!(deposit.percentage() + remaining.percentage(), Decimal::ONE);
        assert_eq!(resolver.resolve(3).unwrap().percentage(), Decimal::ONE);
    }

    #[test]
    fn rejects_invalid_percentages() {
        let grace = Duration::hours(48);
        assert!(InvoiceTypeResolver::new(types(dec!(0.3), dec!(0.75), dec!(1)), grace).is_err());
        assert!(InvoiceTypeResolver::new(types(dec!(1), dec!(0), dec!(1)), grace).is_err());
        assert!(InvoiceTypeResolver::new(types(dec!(0), dec!(1), dec!(1)), grace).is_err());
        assert!(InvoiceTypeResolver::new(types(dec!(0.5), dec!(0.5), dec!(0.9)), grace).is_err());
        assert!(InvoiceTypeResolver::new(types(dec!(0.5), dec!(0.5), dec!(1)), grace).is_ok());
    }

    #[test]
    fn rejects_missing_or_duplicate_kinds() {
        let grace = Duration::hours(48);
        let mut missing = types(dec!(0.25), dec!(0.75), dec!(1));
        missing.pop();
        assert!(InvoiceTypeResolver::new(missing, grace).is_err());

        let mut duplicated = types(dec!(0.25), dec!(0.75), dec!(1));
        duplicated.push(InvoiceType {
            invoice_type_id: 4,
            kind: InvoiceKind::Deposit,
            percentage: dec!(0.25),
        });
        assert!(InvoiceTypeResolver::new(duplicated, grace).is_err());
    }

    #[test]
    fn remaining_is_due_before_event() {
        let resolver = InvoiceTypeResolver::with_defaults().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let event = Utc.with_ymd_and_hms(2024, 5, 11, 18, 0, 0).unwrap();

        let remaining = resolver.resolve(2).unwrap();
        assert_eq!(
            remaining.due_date_policy.due_date(now, event),
            Utc.with_ymd_and_hms(2024, 5, 9, 18, 0, 0).unwrap()
        );

        for id in [1, 3] {
            let resolved = resolver.resolve(id).unwrap();
            assert_eq!(resolved.due_date_policy.due_date(now, event), now);
        }
    }

    #[test]
    fn unknown_type_is_not_found() {
        let resolver = InvoiceTypeResolver::with_defaults().unwrap();
        assert!(matches!(resolver.resolve(99), Err(BillingError::NotFound(_))));
    }

    #[test]
    fn plan_is_full_xor_split() {
        use InvoiceKind::*;
        assert_eq!(BillingPlan::from_kinds(&[Full]).unwrap(), BillingPlan::Full);
        assert_eq!(
            BillingPlan::from_kinds(&[Remaining, Deposit]).unwrap(),
            BillingPlan::Split
        );
        assert!(BillingPlan::from_kinds(&[Full, Deposit, Remaining]).is_err());
        assert!(BillingPlan::from_kinds(&[Deposit]).is_err());
        assert!(BillingPlan::from_kinds(&[]).is_err());
    }
}
