use std::collections::BTreeSet;
use std::fmt;

use polars::{
    df,
    frame::DataFrame,
    prelude::{DataType, Field, Schema, TimeUnit},
};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{LockstepResult, SchemaError, SchemaViolation, polars_err};

/// Canonical column names shared by every table contract.
pub mod col {
    pub const DATETIME: &str = "datetime";
    pub const SYMBOL: &str = "symbol";
    pub const OPEN: &str = "open";
    pub const HIGH: &str = "high";
    pub const LOW: &str = "low";
    pub const CLOSE: &str = "close";
    pub const VOLUME: &str = "volume";
    pub const SIGNAL: &str = "signal";
    pub const SIGNAL_STRENGTH: &str = "signal_strength";
    pub const QUANTITY: &str = "quantity";
    pub const AVG_PRICE: &str = "avg_price";
    pub const SIDE: &str = "side";
    pub const PRICE: &str = "price";
    pub const ORDER_TYPE: &str = "order_type";
    pub const ORDER_ID: &str = "order_id";
    pub const FILLED_QUANTITY: &str = "filled_quantity";
    pub const FILLED_PRICE: &str = "filled_price";
    pub const COMMISSION: &str = "commission";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DATE: &str = "date";
    pub const DAILY_RETURN: &str = "daily_return";
    pub const CUMULATIVE_RETURN: &str = "cumulative_return";
    pub const VOLATILITY: &str = "volatility";
    pub const SHARPE_RATIO: &str = "sharpe_ratio";
    pub const MAX_DRAWDOWN: &str = "max_drawdown";
}

// ================================================================================================
// Column Types
// ================================================================================================

/// Declared type of a required column.
///
/// `Timestamp` accepts any `Datetime` unit/zone so user frames survive
/// validation regardless of their time unit; the crate itself writes
/// microsecond, zone-free datetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    Date,
    Str,
    Float,
    Int,
}

impl ColumnType {
    pub fn matches(&self, dtype: &DataType) -> bool {
        match self {
            Self::Timestamp => matches!(dtype, DataType::Datetime(_, _)),
            Self::Date => matches!(dtype, DataType::Date),
            Self::Str => matches!(dtype, DataType::String),
            Self::Float => matches!(dtype, DataType::Float64),
            Self::Int => matches!(dtype, DataType::Int64),
        }
    }

    /// The dtype used when this crate materializes a column of this type.
    pub fn canonical_dtype(&self) -> DataType {
        match self {
            Self::Timestamp => DataType::Datetime(TimeUnit::Microseconds, None),
            Self::Date => DataType::Date,
            Self::Str => DataType::String,
            Self::Float => DataType::Float64,
            Self::Int => DataType::Int64,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timestamp => "timestamp",
            Self::Date => "date",
            Self::Str => "string",
            Self::Float => "f64",
            Self::Int => "i64",
        };
        write!(f, "{s}")
    }
}

// ================================================================================================
// Order Domain Enums
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Signed quantity: buys are positive, sells negative.
    pub fn signed(&self, quantity: f64) -> f64 {
        match self {
            Self::Buy => quantity,
            Self::Sell => -quantity,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

// ================================================================================================
// Table Kinds
// ================================================================================================

/// The closed set of tabular artifacts moving between components.
///
/// Every cross-component boundary revalidates against the contract of the
/// kind flowing across it; this is the principal mechanism for catching
/// user-code defects early and keeping persisted artifacts sound to read
/// back. Validators check only the required columns and the constraints
/// listed per kind — extra columns pass untouched, column order is never
/// changed, and types are never coerced.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    Ohlcv,
    Signal,
    Portfolio,
    Position,
    Order,
    Fill,
    Metrics,
}

const OHLCV_COLUMNS: &[(&str, ColumnType)] = &[
    (col::DATETIME, ColumnType::Timestamp),
    (col::SYMBOL, ColumnType::Str),
    (col::OPEN, ColumnType::Float),
    (col::HIGH, ColumnType::Float),
    (col::LOW, ColumnType::Float),
    (col::CLOSE, ColumnType::Float),
    (col::VOLUME, ColumnType::Int),
];

const SIGNAL_COLUMNS: &[(&str, ColumnType)] = &[
    (col::DATETIME, ColumnType::Timestamp),
    (col::SYMBOL, ColumnType::Str),
];

const PORTFOLIO_COLUMNS: &[(&str, ColumnType)] = &[
    (col::DATETIME, ColumnType::Timestamp),
    (col::SYMBOL, ColumnType::Str),
];

const POSITION_COLUMNS: &[(&str, ColumnType)] = &[
    (col::SYMBOL, ColumnType::Str),
    (col::QUANTITY, ColumnType::Float),
    (col::AVG_PRICE, ColumnType::Float),
];

const ORDER_COLUMNS: &[(&str, ColumnType)] = &[
    (col::SYMBOL, ColumnType::Str),
    (col::SIDE, ColumnType::Str),
    (col::QUANTITY, ColumnType::Float),
    (col::PRICE, ColumnType::Float),
    (col::ORDER_TYPE, ColumnType::Str),
];

const FILL_COLUMNS: &[(&str, ColumnType)] = &[
    (col::ORDER_ID, ColumnType::Str),
    (col::SYMBOL, ColumnType::Str),
    (col::SIDE, ColumnType::Str),
    (col::FILLED_QUANTITY, ColumnType::Float),
    (col::FILLED_PRICE, ColumnType::Float),
    (col::COMMISSION, ColumnType::Float),
    (col::TIMESTAMP, ColumnType::Timestamp),
];

const METRICS_COLUMNS: &[(&str, ColumnType)] = &[
    (col::DATE, ColumnType::Date),
    (col::DAILY_RETURN, ColumnType::Float),
    (col::CUMULATIVE_RETURN, ColumnType::Float),
    (col::VOLATILITY, ColumnType::Float),
    (col::SHARPE_RATIO, ColumnType::Float),
    (col::MAX_DRAWDOWN, ColumnType::Float),
];

impl TableKind {
    pub fn required_columns(&self) -> &'static [(&'static str, ColumnType)] {
        match self {
            Self::Ohlcv => OHLCV_COLUMNS,
            Self::Signal => SIGNAL_COLUMNS,
            Self::Portfolio => PORTFOLIO_COLUMNS,
            Self::Position => POSITION_COLUMNS,
            Self::Order => ORDER_COLUMNS,
            Self::Fill => FILL_COLUMNS,
            Self::Metrics => METRICS_COLUMNS,
        }
    }

    /// A zero-row frame carrying the required columns in canonical dtypes.
    pub fn empty_frame(&self) -> DataFrame {
        let fields = self
            .required_columns()
            .iter()
            .map(|(name, ty)| Field::new((*name).into(), ty.canonical_dtype()));
        DataFrame::empty_with_schema(&Schema::from_iter(fields))
    }

    /// Validates `table` against this kind's contract and returns it
    /// unchanged, or fails with the first violation found.
    pub fn validate(&self, table: DataFrame) -> LockstepResult<DataFrame> {
        self.check_required_columns(&table)?;

        match self {
            Self::Ohlcv => self.check_ohlcv(&table)?,
            Self::Position => self.check_position(&table)?,
            Self::Order => self.check_order(&table)?,
            Self::Fill => self.check_fill(&table)?,
            Self::Signal | Self::Portfolio | Self::Metrics => {}
        }

        Ok(table)
    }

    fn check_required_columns(&self, table: &DataFrame) -> Result<(), SchemaError> {
        let schema = table.schema();
        for (name, ty) in self.required_columns() {
            let Some(dtype) = schema.get(name) else {
                return Err(self.violation(SchemaViolation::MissingColumn((*name).to_string())));
            };
            if !ty.matches(dtype) {
                return Err(self.violation(SchemaViolation::WrongType {
                    name: (*name).to_string(),
                    expected: ty.to_string(),
                    actual: format!("{dtype:?}"),
                }));
            }
        }
        Ok(())
    }

    fn check_ohlcv(&self, table: &DataFrame) -> Result<(), SchemaError> {
        for name in [col::OPEN, col::HIGH, col::LOW, col::CLOSE, col::VOLUME] {
            self.check_non_null(table, name)?;
        }
        Ok(())
    }

    fn check_position(&self, table: &DataFrame) -> Result<(), SchemaError> {
        self.check_non_null(table, col::QUANTITY)?;
        self.check_non_null(table, col::AVG_PRICE)?;

        let quantity = self.f64_column(table, col::QUANTITY)?;
        if quantity.into_iter().flatten().any(|q| q == 0.0) {
            return Err(self.violation(SchemaViolation::DisallowedValue {
                name: col::QUANTITY.to_string(),
                values: vec!["0".to_string()],
            }));
        }

        let avg_price = self.f64_column(table, col::AVG_PRICE)?;
        let negative: Vec<String> = avg_price
            .into_iter()
            .flatten()
            .filter(|p| *p < 0.0)
            .map(|p| p.to_string())
            .collect();
        if !negative.is_empty() {
            return Err(self.violation(SchemaViolation::DisallowedValue {
                name: col::AVG_PRICE.to_string(),
                values: negative,
            }));
        }

        Ok(())
    }

    fn check_order(&self, table: &DataFrame) -> Result<(), SchemaError> {
        // Every column but `price` must be fully populated.
        for (name, _) in ORDER_COLUMNS {
            if *name != col::PRICE {
                self.check_non_null(table, name)?;
            }
        }

        self.check_allowed_values(table, col::SIDE, &[Side::Buy.into(), Side::Sell.into()])?;
        self.check_allowed_values(
            table,
            col::ORDER_TYPE,
            &[OrderType::Market.into(), OrderType::Limit.into()],
        )?;
        self.check_positive(table, col::QUANTITY, false)?;

        // market ⇔ price null; limit ⇒ price non-null.
        let order_type = self.str_column(table, col::ORDER_TYPE)?;
        let price = self.f64_column(table, col::PRICE)?;
        for (kind, price) in order_type.into_iter().zip(price.into_iter()) {
            match (kind, price) {
                (Some("market"), Some(p)) => {
                    return Err(self.violation(SchemaViolation::DisallowedValue {
                        name: col::PRICE.to_string(),
                        values: vec![format!("{p} (market orders carry no price)")],
                    }));
                }
                (Some("limit"), None) => {
                    return Err(self.violation(SchemaViolation::ForbiddenNull(
                        col::PRICE.to_string(),
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn check_fill(&self, table: &DataFrame) -> Result<(), SchemaError> {
        for (name, _) in FILL_COLUMNS {
            self.check_non_null(table, name)?;
        }
        self.check_positive(table, col::FILLED_QUANTITY, false)?;
        self.check_positive(table, col::FILLED_PRICE, false)?;
        self.check_positive(table, col::COMMISSION, true)?;
        Ok(())
    }

    fn check_non_null(&self, table: &DataFrame, name: &str) -> Result<(), SchemaError> {
        let column = self.column(table, name)?;
        if column.null_count() > 0 {
            return Err(self.violation(SchemaViolation::ForbiddenNull(name.to_string())));
        }
        Ok(())
    }

    fn check_allowed_values(
        &self,
        table: &DataFrame,
        name: &str,
        allowed: &[&str],
    ) -> Result<(), SchemaError> {
        let column = self.str_column(table, name)?;
        let offending: BTreeSet<String> = column
            .into_iter()
            .flatten()
            .filter(|v| !allowed.contains(v))
            .map(str::to_string)
            .collect();
        if !offending.is_empty() {
            return Err(self.violation(SchemaViolation::DisallowedValue {
                name: name.to_string(),
                values: offending.into_iter().collect(),
            }));
        }
        Ok(())
    }

    fn check_positive(
        &self,
        table: &DataFrame,
        name: &str,
        zero_allowed: bool,
    ) -> Result<(), SchemaError> {
        let column = self.f64_column(table, name)?;
        let offending: Vec<String> = column
            .into_iter()
            .flatten()
            .filter(|v| if zero_allowed { *v < 0.0 } else { *v <= 0.0 })
            .map(|v| v.to_string())
            .collect();
        if !offending.is_empty() {
            return Err(self.violation(SchemaViolation::DisallowedValue {
                name: name.to_string(),
                values: offending,
            }));
        }
        Ok(())
    }

    fn column<'a>(
        &self,
        table: &'a DataFrame,
        name: &str,
    ) -> Result<&'a polars::prelude::Column, SchemaError> {
        table
            .column(name)
            .map_err(|_| self.violation(SchemaViolation::MissingColumn(name.to_string())))
    }

    fn f64_column<'a>(
        &self,
        table: &'a DataFrame,
        name: &str,
    ) -> Result<&'a polars::prelude::Float64Chunked, SchemaError> {
        self.column(table, name)?.f64().map_err(|_| {
            self.violation(SchemaViolation::WrongType {
                name: name.to_string(),
                expected: ColumnType::Float.to_string(),
                actual: format!("{:?}", table.schema().get(name)),
            })
        })
    }

    fn str_column<'a>(
        &self,
        table: &'a DataFrame,
        name: &str,
    ) -> Result<&'a polars::prelude::StringChunked, SchemaError> {
        self.column(table, name)?.str().map_err(|_| {
            self.violation(SchemaViolation::WrongType {
                name: name.to_string(),
                expected: ColumnType::Str.to_string(),
                actual: format!("{:?}", table.schema().get(name)),
            })
        })
    }

    fn violation(&self, reason: SchemaViolation) -> SchemaError {
        SchemaError {
            table: *self,
            reason,
        }
    }
}

// ================================================================================================
// Typed Row Builders
// ================================================================================================

/// One order before it becomes a row of an Order table.
///
/// The nullable `price` is a real `Option`, never a sentinel: `None` for
/// market orders, `Some` for limit orders.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: Option<f64>,
    pub order_type: OrderType,
}

impl OrderRow {
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
            order_type: OrderType::Market,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price: Some(price),
            order_type: OrderType::Limit,
        }
    }
}

/// Builds a validated Order table from typed rows.
pub fn orders_to_frame(rows: &[OrderRow]) -> LockstepResult<DataFrame> {
    if rows.is_empty() {
        return Ok(TableKind::Order.empty_frame());
    }

    let symbol: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
    let side: Vec<&str> = rows.iter().map(|r| r.side.into()).collect();
    let quantity: Vec<f64> = rows.iter().map(|r| r.quantity).collect();
    let price: Vec<Option<f64>> = rows.iter().map(|r| r.price).collect();
    let order_type: Vec<&str> = rows.iter().map(|r| r.order_type.into()).collect();

    let frame = df!(
        col::SYMBOL => symbol,
        col::SIDE => side,
        col::QUANTITY => quantity,
        col::PRICE => price,
        col::ORDER_TYPE => order_type,
    )
    .map_err(polars_err)?;

    TableKind::Order.validate(frame)
}
