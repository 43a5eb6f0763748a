use std::collections::BTreeMap;

use polars::{df, frame::DataFrame};

use crate::{
    error::{LockstepResult, polars_err},
    schema::{TableKind, col},
    sim::Fill,
};

/// A per-symbol holding. Quantity is signed: positive long, negative
/// short. `avg_price` is always non-negative, including for shorts.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_price: f64,
}

/// Recomputes positions by replaying fills in timestamp order.
///
/// The sort is stable, so fills sharing a timestamp replay in append
/// order; any tie order is a valid outcome and callers must not depend on
/// one. Replay rules per fill (signed quantity `s`, held `(q, avg)`):
/// open from flat, same-side weighted-average add, opposite-side partial
/// reduce (avg unchanged), exact close (both zero), or flip (remainder at
/// the fill price). Flat symbols are dropped from the result.
pub(crate) fn derive_positions(fills: &[Fill]) -> Vec<Position> {
    let mut ordered: Vec<&Fill> = fills.iter().collect();
    ordered.sort_by_key(|fill| fill.timestamp);

    let mut book: BTreeMap<&str, (f64, f64)> = BTreeMap::new();

    for fill in ordered {
        let signed = fill.side.signed(fill.quantity);
        let entry = book.entry(fill.symbol.as_str()).or_insert((0.0, 0.0));
        let (quantity, avg_price) = *entry;

        *entry = if quantity == 0.0 {
            (signed, fill.price)
        } else if (quantity > 0.0) == (signed > 0.0) {
            let new_quantity = quantity + signed;
            let notional = quantity * avg_price + signed * fill.price;
            (new_quantity, notional / new_quantity)
        } else if signed.abs() < quantity.abs() {
            (quantity + signed, avg_price)
        } else if signed.abs() == quantity.abs() {
            (0.0, 0.0)
        } else {
            // Flip: what remains is a fresh position in the opposite
            // direction, carried at the fill price.
            (quantity + signed, fill.price)
        };
    }

    book.into_iter()
        .filter(|(_, (quantity, _))| *quantity != 0.0)
        .map(|(symbol, (quantity, avg_price))| Position {
            symbol: symbol.to_string(),
            quantity,
            avg_price,
        })
        .collect()
}

pub(crate) fn positions_to_frame(positions: &[Position]) -> LockstepResult<DataFrame> {
    if positions.is_empty() {
        return Ok(TableKind::Position.empty_frame());
    }

    let symbol: Vec<&str> = positions.iter().map(|p| p.symbol.as_str()).collect();
    let quantity: Vec<f64> = positions.iter().map(|p| p.quantity).collect();
    let avg_price: Vec<f64> = positions.iter().map(|p| p.avg_price).collect();

    let frame = df!(
        col::SYMBOL => symbol,
        col::QUANTITY => quantity,
        col::AVG_PRICE => avg_price,
    )
    .map_err(polars_err)?;

    TableKind::Position.validate(frame)
}

#[cfg(test)]
mod test {
    use chrono::NaiveDateTime;

    use crate::schema::Side;

    use super::*;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
    }

    fn fill(symbol: &str, side: Side, quantity: f64, price: f64, stamp: &str) -> Fill {
        Fill {
            order_id: format!("{symbol}-{stamp}"),
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
            commission: 0.0,
            timestamp: ts(stamp),
        }
    }

    #[test]
    fn open_from_flat() {
        let positions = derive_positions(&[fill(
            "AAPL",
            Side::Buy,
            10.0,
            100.0,
            "2024-01-01T10:00:00",
        )]);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10.0);
        assert_eq!(positions[0].avg_price, 100.0);
    }

    #[test]
    fn short_open_keeps_avg_price_positive() {
        let positions = derive_positions(&[fill(
            "AAPL",
            Side::Sell,
            10.0,
            100.0,
            "2024-01-01T10:00:00",
        )]);
        assert_eq!(positions[0].quantity, -10.0);
        assert_eq!(positions[0].avg_price, 100.0);
    }

    #[test]
    fn same_side_addition_weights_average() {
        let positions = derive_positions(&[
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("AAPL", Side::Buy, 10.0, 110.0, "2024-01-02T10:00:00"),
        ]);
        assert_eq!(positions[0].quantity, 20.0);
        assert_eq!(positions[0].avg_price, 105.0);
    }

    #[test]
    fn partial_reduction_keeps_average() {
        let positions = derive_positions(&[
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("AAPL", Side::Sell, 4.0, 120.0, "2024-01-02T10:00:00"),
        ]);
        assert_eq!(positions[0].quantity, 6.0);
        assert_eq!(positions[0].avg_price, 100.0);
    }

    #[test]
    fn exact_close_removes_symbol() {
        let positions = derive_positions(&[
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("AAPL", Side::Sell, 10.0, 120.0, "2024-01-02T10:00:00"),
        ]);
        assert!(positions.is_empty());
    }

    #[test]
    fn flip_carries_fill_price() {
        // buy 10 @ 100, sell 15 @ 110 -> short 5 @ 110
        let positions = derive_positions(&[
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("AAPL", Side::Sell, 15.0, 110.0, "2024-01-02T10:00:00"),
        ]);
        assert_eq!(positions[0].quantity, -5.0);
        assert_eq!(positions[0].avg_price, 110.0);
    }

    #[test]
    fn replay_is_deterministic_per_timestamp_order() {
        let fills = [
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("GOOG", Side::Sell, 3.0, 2000.0, "2024-01-01T11:00:00"),
            fill("AAPL", Side::Sell, 4.0, 110.0, "2024-01-02T10:00:00"),
        ];
        let first = derive_positions(&fills);
        let second = derive_positions(&fills);
        assert_eq!(first, second);
    }

    #[test]
    fn same_timestamp_ties_still_net_out() {
        // Two same-timestamp opposite fills of equal size always cancel,
        // whatever order they replay in.
        let fills = [
            fill("AAPL", Side::Buy, 10.0, 100.0, "2024-01-01T10:00:00"),
            fill("AAPL", Side::Sell, 10.0, 100.0, "2024-01-01T10:00:00"),
        ];
        assert!(derive_positions(&fills).is_empty());
    }

    #[test]
    fn frame_conversion_round_trips() {
        let positions = vec![Position {
            symbol: "AAPL".to_string(),
            quantity: -5.0,
            avg_price: 110.0,
        }];
        let frame = positions_to_frame(&positions).unwrap();
        assert_eq!(frame.height(), 1);

        let empty = positions_to_frame(&[]).unwrap();
        assert_eq!(empty.height(), 0);
    }
}
