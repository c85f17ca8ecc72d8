//! Depth analytics
//!
//! Turns the unordered book into sorted cumulative depth and estimates how
//! much can be bought or sold for a leveraged notional budget. Sums always
//! run over the full book; only the emitted level lists are truncated.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::{DepthLevel, DerivedBookView, Level, OrderBook, OrderBookMetrics, Side};

/// Decimal places kept on interpolated sizes
const SIZE_DP: u32 = 8;

/// Account balance and leverage behind the max size estimates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub balance: Decimal,
    pub leverage: Decimal,
}

impl Budget {
    pub fn new(balance: Decimal, leverage: Decimal) -> Self {
        Self { balance, leverage }
    }

    /// Quote notional available: balance x leverage, saturating
    pub fn notional(&self) -> Decimal {
        self.balance
            .checked_mul(self.leverage)
            .unwrap_or(Decimal::MAX)
    }
}

/// Builds [`DerivedBookView`]s from an order book
#[derive(Debug, Clone)]
pub struct DepthProjector {
    display_depth: usize,
    budget: Option<Budget>,
}

impl DepthProjector {
    pub fn new(display_depth: usize) -> Self {
        Self {
            display_depth,
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Option<Budget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn set_budget(&mut self, budget: Option<Budget>) {
        self.budget = budget;
    }

    pub fn budget(&self) -> Option<Budget> {
        self.budget
    }

    /// Project the current book into a view
    pub fn project(&self, book: &OrderBook) -> DerivedBookView {
        let mut bids = cumulate(book.sorted_levels(Side::Bid));
        let mut asks = cumulate(book.sorted_levels(Side::Ask));

        let (max_buy_size, max_sell_size) = match self.budget.map(|b| b.notional()) {
            Some(notional) => (max_fill_size(&asks, notional), max_fill_size(&bids, notional)),
            None => (Decimal::ZERO, Decimal::ZERO),
        };

        let metrics = OrderBookMetrics::from_levels(&bids, &asks);

        bids.truncate(self.display_depth);
        asks.truncate(self.display_depth);

        DerivedBookView {
            symbol: book.symbol().to_string(),
            timestamp: book.last_update_time(),
            last_update_id: book.last_update_id(),
            bid_depth: last_cumulative(&bids),
            ask_depth: last_cumulative(&asks),
            bids,
            asks,
            max_buy_size,
            max_sell_size,
            metrics,
        }
    }
}

/// Attach running quantity from the touch outwards
pub fn cumulate(levels: Vec<Level>) -> Vec<DepthLevel> {
    let mut running = Decimal::ZERO;
    levels
        .into_iter()
        .map(|level| {
            running += level.quantity;
            DepthLevel {
                price: level.price,
                quantity: level.quantity,
                cumulative_quantity: running,
            }
        })
        .collect()
}

/// Size fillable by walking `levels` until `budget` notional is spent
///
/// The level that crosses the budget is taken fractionally. If the side
/// runs out first the full side quantity is returned as is.
pub fn max_fill_size(levels: &[DepthLevel], budget: Decimal) -> Decimal {
    if budget <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut spent = Decimal::ZERO;
    let mut filled = Decimal::ZERO;

    for level in levels {
        // Overflowing notional is more than any budget
        let notional = level.price.checked_mul(level.quantity).unwrap_or(Decimal::MAX);
        let crosses = spent
            .checked_add(notional)
            .map_or(true, |total| total >= budget);
        if crosses {
            let partial = (budget - spent) / level.price;
            return (filled + partial).round_dp_with_strategy(SIZE_DP, RoundingStrategy::ToZero);
        }
        spent += notional;
        filled += level.quantity;
    }

    filled
}

fn last_cumulative(levels: &[DepthLevel]) -> Decimal {
    levels
        .last()
        .map(|l| l.cumulative_quantity)
        .unwrap_or(Decimal::ZERO)
}
