//! Quote pricing.
//!
//! Two front ends share one [`FeeSchedule`]: line-item pricing sums whatever
//! services were attached to a quote, and the flag-based estimate expands a
//! guest count plus add-on flags into line items first. Both end in
//! [`compute_amount`], so they cannot disagree on a fee.

use crate::models::{OpenBarPackage, Quote, QuoteLineItem, ServiceOptions};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Staff needed for guest counts up to `max_guests` (inclusive).
/// The last tier should leave `max_guests` unset to cover everything above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffTier {
    pub max_guests: Option<i32>,
    pub staff: i32,
}

/// Per-guest add-on fees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerGuestFees {
    pub liquor: Decimal,
    pub beer_and_wine: Decimal,
    pub mixers: Decimal,
    pub juices: Decimal,
    pub soft_drinks: Decimal,
    pub cups: Decimal,
    pub ice: Decimal,
    pub glassware: Decimal,
    pub partial_open_bar: Decimal,
    pub full_open_bar: Decimal,
}

impl Default for PerGuestFees {
    fn default() -> Self {
        Self {
            liquor: Decimal::new(10, 0),
            beer_and_wine: Decimal::new(5, 0),
            mixers: Decimal::new(3, 0),
            juices: Decimal::new(1, 0),
            soft_drinks: Decimal::new(2, 0),
            cups: Decimal::new(2, 0),
            ice: Decimal::new(2, 0),
            glassware: Decimal::new(3, 0),
            partial_open_bar: Decimal::ZERO,
            full_open_bar: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeSchedule {
    /// Rate per staff member per hour.
    pub staffing_hourly_rate: Decimal,
    pub staffing_tiers: Vec<StaffTier>,
    /// Rental fee per bar unit.
    pub bar_rental_fee: Decimal,
    /// Hourly rate for moving, setting up and breaking down a mobile bar.
    pub bar_setup_hourly_rate: Decimal,
    /// Hours of setup and breakdown per bar unit.
    pub bar_setup_hours: Decimal,
    pub per_guest: PerGuestFees,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            staffing_hourly_rate: Decimal::new(70, 0),
            staffing_tiers: vec![
                StaffTier { max_guests: Some(50), staff: 1 },
                StaffTier { max_guests: Some(90), staff: 2 },
                StaffTier { max_guests: Some(120), staff: 3 },
                StaffTier { max_guests: None, staff: 4 },
            ],
            bar_rental_fee: Decimal::new(200, 0),
            bar_setup_hourly_rate: Decimal::ZERO,
            bar_setup_hours: Decimal::ZERO,
            per_guest: PerGuestFees::default(),
        }
    }
}

/// Inputs of the flag-based estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimateRequest {
    pub guests: i32,
    pub hours: Decimal,
    pub options: ServiceOptions,
}

impl From<&Quote> for EstimateRequest {
    fn from(quote: &Quote) -> Self {
        Self {
            guests: quote.guests,
            hours: quote.hours,
            options: quote.options.clone(),
        }
    }
}

/// Sum of `units × price_per_unit`. Empty input is zero and negative inputs
/// contribute nothing.
pub fn compute_amount<'a, I>(line_items: I) -> Decimal
where
    I: IntoIterator<Item = &'a QuoteLineItem>,
{
    line_items.into_iter().map(QuoteLineItem::subtotal).sum()
}

/// Pure pricing over a configured fee schedule.
#[derive(Debug, Clone, Default)]
pub struct PricingEngine {
    schedule: FeeSchedule,
}

impl PricingEngine {
    pub fn new(schedule: FeeSchedule) -> Self {
        Self { schedule }
    }

    pub fn compute_amount(&self, line_items: &[QuoteLineItem]) -> Decimal {
        compute_amount(line_items)
    }

    /// Staff required for a guest count; zero when there are no guests.
    pub fn staff_needed(&self, guests: i32) -> i32 {
        if guests <= 0 {
            return 0;
        }
        self.schedule
            .staffing_tiers
            .iter()
            .find(|tier| tier.max_guests.map_or(true, |max| guests <= max))
            .or_else(|| self.schedule.staffing_tiers.last())
            .map(|tier| tier.staff)
            .unwrap_or(0)
    }

    /// Expand an estimate request into line items for `quote_id`.
    pub fn estimate_line_items(&self, quote_id: Uuid, request: &EstimateRequest) -> Vec<QuoteLineItem> {
        if request.guests <= 0 {
            return Vec::new();
        }

        let guests = Decimal::from(request.guests);
        let hours = request.hours.max(Decimal::ZERO);
        let staff = Decimal::from(self.staff_needed(request.guests));
        let fees = &self.schedule.per_guest;
        let options = &request.options;

        let mut items = vec![line(
            quote_id,
            "staffing",
            staff * hours,
            self.schedule.staffing_hourly_rate,
        )];

        if options.bar_units > 0 {
            items.push(line(
                quote_id,
                "bar_rental",
                Decimal::from(options.bar_units),
                self.schedule.bar_rental_fee,
            ));

            let setup_rate = self.schedule.bar_setup_hourly_rate * self.schedule.bar_setup_hours;
            if setup_rate > Decimal::ZERO {
                items.push(line(
                    quote_id,
                    "bar_setup",
                    Decimal::from(options.bar_units),
                    setup_rate,
                ));
            }
        }

        let open_bar_fee = match options.open_bar {
            OpenBarPackage::None => Decimal::ZERO,
            OpenBarPackage::Partial => fees.partial_open_bar,
            OpenBarPackage::Full => fees.full_open_bar,
        };
        if open_bar_fee > Decimal::ZERO {
            items.push(line(quote_id, "open_bar", guests, open_bar_fee));
        }

        let per_guest = [
            (options.liquor, "liquor", fees.liquor),
            (options.beer_and_wine, "beer_and_wine", fees.beer_and_wine),
            (options.mixers, "mixers", fees.mixers),
            (options.juices, "juices", fees.juices),
            (options.soft_drinks, "soft_drinks", fees.soft_drinks),
            (options.cups, "cups", fees.cups),
            (options.ice, "ice", fees.ice),
            (options.glassware, "glassware", fees.glassware),
        ];
        for (requested, service, fee) in per_guest {
            if requested {
                items.push(line(quote_id, service, guests, fee));
            }
        }

        items
    }

    /// Flag-based estimate. Zero whenever the guest count is not positive.
    pub fn compute_estimate(&self, request: &EstimateRequest) -> Decimal {
        compute_amount(&self.estimate_line_items(Uuid::nil(), request))
    }
}

fn line(quote_id: Uuid, service: &str, units: Decimal, price_per_unit: Decimal) -> QuoteLineItem {
    QuoteLineItem {
        line_item_id: Uuid::new_v4(),
        quote_id,
        service: service.to_string(),
        units,
        price_per_unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(units: Decimal, price: Decimal) -> QuoteLineItem {
        line(Uuid::new_v4(), "service", units, price)
    }

    fn all_options() -> ServiceOptions {
        ServiceOptions {
            liquor: true,
            beer_and_wine: true,
            mixers: true,
            juices: true,
            soft_drinks: true,
            cups: true,
            ice: true,
            glassware: true,
            bar_units: 2,
            open_bar: OpenBarPackage::Full,
        }
    }

    #[test]
    fn amount_is_exact_sum_of_line_items() {
        let items = vec![
            item(dec!(8), dec!(50)),
            item(dec!(1), dec!(150)),
            item(dec!(3), dec!(0.333)),
        ];
        assert_eq!(compute_amount(&items), dec!(550.999));
    }

    #[test]
    fn empty_line_items_price_to_zero() {
        assert_eq!(compute_amount(&Vec::<QuoteLineItem>::new()), Decimal::ZERO);
    }

    #[test]
    fn negative_line_items_contribute_nothing() {
        let items = vec![item(dec!(-2), dec!(50)), item(dec!(2), dec!(50))];
        assert_eq!(compute_amount(&items), dec!(100));
    }

    #[test]
    fn staff_step_function() {
        let engine = PricingEngine::default();
        assert_eq!(engine.staff_needed(1), 1);
        assert_eq!(engine.staff_needed(50), 1);
        assert_eq!(engine.staff_needed(51), 2);
        assert_eq!(engine.staff_needed(90), 2);
        assert_eq!(engine.staff_needed(91), 3);
        assert_eq!(engine.staff_needed(120), 3);
        assert_eq!(engine.staff_needed(121), 4);
        assert_eq!(engine.staff_needed(500), 4);
        assert_eq!(engine.staff_needed(0), 0);
    }

    #[test]
    fn estimate_is_zero_without_guests() {
        let engine = PricingEngine::default();
        for guests in [0, -1, -100] {
            let request = EstimateRequest {
                guests,
                hours: dec!(5),
                options: all_options(),
            };
            assert_eq!(engine.compute_estimate(&request), Decimal::ZERO);
        }
    }

    #[test]
    fn estimate_uses_fee_schedule() {
        let engine = PricingEngine::default();
        let request = EstimateRequest {
            guests: 60,
            hours: dec!(4),
            options: ServiceOptions {
                liquor: true,
                ice: true,
                bar_units: 1,
                ..ServiceOptions::default()
            },
        };
        // 2 staff × 4h × 70 + 1 bar × 200 + 60 × (10 + 2)
        assert_eq!(engine.compute_estimate(&request), dec!(1480));
    }

    #[test]
    fn negative_hours_and_bars_cost_nothing() {
        let engine = PricingEngine::default();
        let request = EstimateRequest {
            guests: 10,
            hours: dec!(-3),
            options: ServiceOptions {
                bar_units: -2,
                ..ServiceOptions::default()
            },
        };
        assert_eq!(engine.compute_estimate(&request), Decimal::ZERO);
    }

    #[test]
    fn alternate_schedule_changes_estimate() {
        let schedule = FeeSchedule {
            staffing_hourly_rate: dec!(100),
            ..FeeSchedule::default()
        };
        let engine = PricingEngine::new(schedule);
        let request = EstimateRequest {
            guests: 20,
            hours: dec!(3),
            options: ServiceOptions::default(),
        };
        assert_eq!(engine.compute_estimate(&request), dec!(300));
    }

    #[test]
    fn bar_setup_and_open_bar_fees_come_from_schedule() {
        let schedule = FeeSchedule {
            bar_setup_hourly_rate: dec!(25),
            bar_setup_hours: dec!(2),
            per_guest: PerGuestFees {
                partial_open_bar: dec!(8),
                full_open_bar: dec!(15),
                ..PerGuestFees::default()
            },
            ..FeeSchedule::default()
        };
        let engine = PricingEngine::new(schedule);
        let mut request = EstimateRequest {
            guests: 40,
            hours: dec!(4),
            options: ServiceOptions {
                bar_units: 2,
                open_bar: OpenBarPackage::Partial,
                ..ServiceOptions::default()
            },
        };
        // 1 staff × 4h × 70 + 2 bars × (200 + 25 × 2) + 40 × 8
        assert_eq!(engine.compute_estimate(&request), dec!(1100));

        request.options.open_bar = OpenBarPackage::Full;
        assert_eq!(engine.compute_estimate(&request), dec!(1380));
    }

    #[test]
    fn setup_and_open_bar_are_free_by_default() {
        let engine = PricingEngine::default();
        let request = EstimateRequest {
            guests: 40,
            hours: dec!(4),
            options: ServiceOptions {
                bar_units: 1,
                open_bar: OpenBarPackage::Full,
                ..ServiceOptions::default()
            },
        };
        let services: Vec<_> = engine
            .estimate_line_items(Uuid::new_v4(), &request)
            .into_iter()
            .map(|i| i.service)
            .collect();
        assert_eq!(services, vec!["staffing", "bar_rental"]);
    }

    #[test]
    fn estimate_and_line_items_agree() {
        let engine = PricingEngine::default();
        let quote_id = Uuid::new_v4();
        let request = EstimateRequest {
            guests: 130,
            hours: dec!(6),
            options: all_options(),
        };
        let items = engine.estimate_line_items(quote_id, &request);
        assert!(items.iter().all(|i| i.quote_id == quote_id));
        assert_eq!(engine.compute_amount(&items), engine.compute_estimate(&request));
    }
}
